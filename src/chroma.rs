//! [`VectorStore`] backed by a Chroma server over its v2 REST API.

use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::{
    doc_id::ChunkId,
    document::Document,
    error::{Error, Result},
    http::{JsonClient, join_url},
    vector_store::{
        DEFAULT_MAX_BATCH_SIZE,
        Neighbor,
        VectorStore,
        chunk_metadata,
        document_from_stored,
    },
};

const SERVICE: &str = "vector store";

/// Connection settings for a Chroma collection.
#[derive(Debug, Clone)]
pub struct ChromaOptions {
    pub url: String,
    pub tenant: String,
    pub database: String,
    pub collection: String,
    pub timeout: Duration,
    pub max_batch_size: usize,
}

impl Default for ChromaOptions {
    fn default() -> Self {
        Self {
            url: "http://localhost:8001".into(),
            tenant: "default_tenant".into(),
            database: "default_database".into(),
            collection: "docrag".into(),
            timeout: Duration::from_secs(10),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

pub struct ChromaStore {
    http: JsonClient,
    collection_url: String,
    max_batch_size: usize,
}

#[derive(Deserialize)]
struct CollectionInfo {
    id: String,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    ids: Vec<&'a str>,
    embeddings: Vec<&'a [f32]>,
    documents: Vec<&'a str>,
    metadatas: Vec<Map<String, Value>>,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    ids: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Map<String, Value>>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Map<String, Value>>>>,
    #[serde(default)]
    embeddings: Option<Vec<Option<Vec<f32>>>>,
}

impl ChromaStore {
    /// Connect and get-or-create the collection.
    ///
    /// New collections are created with cosine distance so the default
    /// [`DistanceMetric`](crate::vector_store::DistanceMetric) applies.
    pub fn connect(options: &ChromaOptions) -> Result<Self> {
        if options.max_batch_size == 0 {
            return Err(Error::Config(
                "store max batch size must be positive".into(),
            ));
        }

        let http = JsonClient::new(SERVICE, options.timeout)?;
        let collections_url = join_url(
            &options.url,
            &format!(
                "api/v2/tenants/{}/databases/{}/collections",
                options.tenant, options.database
            ),
        );

        let info: CollectionInfo = http.post(
            &collections_url,
            &json!({
                "name": options.collection,
                "get_or_create": true,
                "metadata": { "hnsw:space": "cosine" },
            }),
        )?;
        info!(
            collection = %options.collection,
            id = %info.id,
            "connected to vector store"
        );

        Ok(Self {
            http,
            collection_url: join_url(&collections_url, &info.id),
            max_batch_size: options.max_batch_size,
        })
    }

    fn endpoint(&self, action: &str) -> String {
        join_url(&self.collection_url, action)
    }

    /// One page of stored records, `max_batch_size` at a time.
    fn page(&self, include: &[&str], offset: usize) -> Result<GetResponse> {
        let request = json!({
            "include": include,
            "limit": self.max_batch_size,
            "offset": offset,
        });
        self.http.post(&self.endpoint("get"), &request)
    }
}

impl VectorStore for ChromaStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn upsert(&self, documents: &[Document]) -> Result<()> {
        let request = encode_upsert(documents)?;
        let _: Value = self.http.post(&self.endpoint("upsert"), &request)?;
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let request = json!({
            "query_embeddings": [vector],
            "n_results": k,
            "include": ["documents", "metadatas", "distances"],
        });
        let response: QueryResponse =
            self.http.post(&self.endpoint("query"), &request)?;
        let neighbors = decode_query(response)?;

        if let (Some(first), Some(last)) = (neighbors.first(), neighbors.last())
        {
            debug!(
                k,
                returned = neighbors.len(),
                closest = first.distance,
                farthest = last.distance,
                "vector store query"
            );
        }
        Ok(neighbors)
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Document>> {
        let request = json!({
            "ids": [id.as_str()],
            "include": ["documents", "metadatas", "embeddings"],
        });
        let response: GetResponse =
            self.http.post(&self.endpoint("get"), &request)?;
        decode_get(response)
    }

    fn count(&self) -> Result<usize> {
        self.http.get(&self.endpoint("count"))
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let request = DeleteRequest {
            ids: ids.iter().map(ChunkId::as_str).collect(),
        };
        let _: Value = self.http.post(&self.endpoint("delete"), &request)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut removed = 0;
        loop {
            let page = self.page(&[], 0)?;
            if page.ids.is_empty() {
                break;
            }
            let ids: Vec<ChunkId> =
                page.ids.into_iter().map(ChunkId::from_raw).collect();
            self.delete(&ids)?;
            removed += ids.len();
        }
        info!(removed, "cleared collection");
        Ok(())
    }

    fn sources(&self) -> Result<BTreeSet<String>> {
        let mut sources = BTreeSet::new();
        let mut offset = 0;
        loop {
            let page = self.page(&["metadatas"], offset)?;
            let fetched = page.ids.len();
            sources.extend(stored_sources(&page));
            if fetched < self.max_batch_size {
                break;
            }
            offset += fetched;
        }
        Ok(sources)
    }
}

fn malformed(message: impl Into<String>) -> Error {
    Error::MalformedResponse {
        service: SERVICE,
        message: message.into(),
    }
}

fn encode_upsert(documents: &[Document]) -> Result<UpsertRequest<'_>> {
    let mut request = UpsertRequest {
        ids: Vec::with_capacity(documents.len()),
        embeddings: Vec::with_capacity(documents.len()),
        documents: Vec::with_capacity(documents.len()),
        metadatas: Vec::with_capacity(documents.len()),
    };

    for doc in documents {
        let embedding =
            doc.embedding().ok_or_else(|| Error::MissingEmbedding {
                id: doc.id().to_string(),
            })?;
        request.ids.push(doc.id().as_str());
        request.embeddings.push(embedding.vector());
        request.documents.push(doc.content());
        request.metadatas.push(chunk_metadata(doc));
    }

    Ok(request)
}

/// Flatten the single-query response into neighbours.
///
/// Distances and document text are required: without them the result can
/// neither be ranked nor keyword-scored.
fn decode_query(response: QueryResponse) -> Result<Vec<Neighbor>> {
    let Some(ids) = response.ids.into_iter().next() else {
        return Ok(Vec::new());
    };

    let distances = response
        .distances
        .and_then(|d| d.into_iter().next())
        .ok_or_else(|| malformed("query response has no distances"))?;
    let documents = response
        .documents
        .and_then(|d| d.into_iter().next())
        .ok_or_else(|| malformed("query response has no documents"))?;
    let metadatas = response
        .metadatas
        .and_then(|m| m.into_iter().next())
        .unwrap_or_default();

    if distances.len() != ids.len() || documents.len() != ids.len() {
        return Err(malformed(format!(
            "query response columns disagree: {} ids, {} distances, {} \
             documents",
            ids.len(),
            distances.len(),
            documents.len()
        )));
    }

    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let distance = distances[i]
                .ok_or_else(|| malformed(format!("no distance for {id}")))?;
            let content = documents[i]
                .as_deref()
                .ok_or_else(|| malformed(format!("no document for {id}")))?;
            let metadata = metadatas.get(i).and_then(Option::as_ref);
            let document = document_from_stored(id, content, metadata, None)
                .map_err(|e| malformed(format!("stored chunk {id}: {e}")))?;
            Ok(Neighbor { document, distance })
        })
        .collect()
}

fn decode_get(response: GetResponse) -> Result<Option<Document>> {
    let Some(id) = response.ids.first() else {
        return Ok(None);
    };

    let content = response
        .documents
        .as_ref()
        .and_then(|d| d.first())
        .and_then(Option::as_deref)
        .ok_or_else(|| malformed(format!("no document for {id}")))?;
    let metadata = response
        .metadatas
        .as_ref()
        .and_then(|m| m.first())
        .and_then(Option::as_ref);
    let vector = response
        .embeddings
        .and_then(|e| e.into_iter().next())
        .flatten();

    document_from_stored(id, content, metadata, vector)
        .map(Some)
        .map_err(|e| malformed(format!("stored chunk {id}: {e}")))
}

/// The `source` of every record in a page; records without one are
/// named by their id, as in [`document_from_stored`].
fn stored_sources(response: &GetResponse) -> Vec<String> {
    response
        .ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            response
                .metadatas
                .as_ref()
                .and_then(|m| m.get(i))
                .and_then(Option::as_ref)
                .and_then(|m| m.get("source"))
                .and_then(Value::as_str)
                .unwrap_or(id.as_str())
                .to_string()
        })
        .collect()
}
