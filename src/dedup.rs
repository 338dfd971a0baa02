//! Source-level deduplication of fused results.

use std::collections::HashSet;

use crate::fusion::Fused;

/// A fused entry that survived deduplication.
#[derive(Debug, Clone)]
pub struct Kept {
    pub entry: Fused,
    /// Only present because a slot had to be backfilled.
    pub is_fill: bool,
}

/// Diversify `fused` (sorted best first) across sources.
///
/// When enabled, the best chunk of each distinct source comes first, in
/// fused order, up to `limit`. Any slots left are backfilled with the
/// next-best remaining chunks regardless of source, each flagged as a
/// fill. Sources never appear unless they were in the input, so a single
/// matching source fills every slot by itself.
///
/// When disabled, the input passes through untouched.
pub fn deduplicate(fused: Vec<Fused>, limit: usize, enabled: bool) -> Vec<Kept> {
    if !enabled {
        return fused
            .into_iter()
            .map(|entry| Kept {
                entry,
                is_fill: false,
            })
            .collect();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut firsts = Vec::new();
    let mut rest = Vec::new();

    for entry in fused {
        if firsts.len() < limit && seen.insert(entry.document.source().to_string())
        {
            firsts.push(Kept {
                entry,
                is_fill: false,
            });
        } else {
            rest.push(entry);
        }
    }

    let open = limit.saturating_sub(firsts.len());
    firsts.extend(rest.into_iter().take(open).map(|entry| Kept {
        entry,
        is_fill: true,
    }));
    firsts
}
