//! Blocking JSON-over-HTTP plumbing shared by the service adapters.
//!
//! Transport failures are mapped onto the crate's error taxonomy here so
//! callers can decide on retries with [`Error::is_transient`].

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 200;

pub(crate) struct JsonClient {
    client: Client,
    service: &'static str,
    timeout: Duration,
}

impl JsonClient {
    pub(crate) fn new(service: &'static str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("docrag/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::Config(format!("cannot build HTTP client for {service}: {e}"))
            })?;

        Ok(Self {
            client,
            service,
            timeout,
        })
    }

    pub(crate) fn post<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| self.transport_error(e))?;
        self.decode(response)
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| self.transport_error(e))?;
        self.decode(response)
    }

    fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();
        let body = response.text().map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(Error::Upstream {
                service: self.service,
                status: status.as_u16(),
                message: truncate(&body, MAX_ERROR_BODY).to_string(),
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::MalformedResponse {
            service: self.service,
            message: e.to_string(),
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                service: self.service,
                after: self.timeout,
            }
        } else if err.is_decode() {
            Error::MalformedResponse {
                service: self.service,
                message: err.to_string(),
            }
        } else {
            Error::Connection {
                service: self.service,
                message: err.to_string(),
            }
        }
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
