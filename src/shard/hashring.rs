//! Range-partitioned hash ring.
//!
//! The ring has `totalVirtualBackends` slots. Each backend owns one
//! inclusive range of slots, written as `"start-end"` in the config, and
//! the ranges must cover every slot exactly once. A key lands on slot
//! `xxh3(key) mod total`, so the mapping only depends on the config.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use super::{to_backends, Backend, BackendDefaults, BackendDefinition, ShardError};

const DEFAULT_VIRTUAL_BACKENDS: i64 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HashRingConfig {
    total_virtual_backends: Option<i64>,
    #[serde(default)]
    backends: Option<HashMap<String, BackendDefinition>>,
}

#[derive(Debug)]
struct SlotRange {
    start: usize,
    end: usize,
    backend: Arc<Backend>,
}

#[derive(Debug)]
pub struct HashRingStrategy {
    total: u64,
    /// Sorted by `start`, contiguous from 0 to `total - 1`.
    ranges: Vec<SlotRange>,
}

impl HashRingStrategy {
    pub fn from_config(config: &Value, defaults: &BackendDefaults) -> Result<Self, ShardError> {
        let cfg = HashRingConfig::deserialize(config)?;

        let definitions = match cfg.backends {
            Some(backends) if !backends.is_empty() => backends,
            _ => return Err(ShardError::NoRingBackends),
        };

        for (key, definition) in &definitions {
            definition.validate().map_err(|source| ShardError::Backend {
                key: key.clone(),
                source,
            })?;
        }

        let total = match cfg.total_virtual_backends {
            Some(n) if n >= 0 => n,
            _ => DEFAULT_VIRTUAL_BACKENDS,
        };

        let mut bounds = parse_ranges(definitions.keys())?;
        bounds.sort_by_key(|(start, _, _)| *start);
        check_coverage(&bounds, total)?;

        let backends = to_backends(&definitions, defaults)?;
        let ranges = bounds
            .into_iter()
            .filter_map(|(start, end, key)| {
                backends.get(&key).map(|backend| SlotRange {
                    start,
                    end,
                    backend: Arc::clone(backend),
                })
            })
            .collect();

        Ok(Self {
            total: total as u64,
            ranges,
        })
    }

    pub fn shard(&self, key: &str) -> Option<Arc<Backend>> {
        let slot = (xxh3_64(key.as_bytes()) % self.total) as usize;
        let idx = self.ranges.partition_point(|r| r.end < slot);
        self.ranges
            .get(idx)
            .filter(|r| r.start <= slot)
            .map(|r| Arc::clone(&r.backend))
    }
}

/// Parses `"start-end"` keys. Both bounds are plain decimal numbers.
fn parse_ranges<'a>(
    keys: impl Iterator<Item = &'a String>,
) -> Result<Vec<(usize, usize, String)>, ShardError> {
    keys.map(|key| {
        let bad_format = || ShardError::InvalidRangeFormat(key.clone());
        let (start, end) = key.split_once('-').ok_or_else(bad_format)?;
        let start = parse_bound(start).ok_or_else(bad_format)?;
        let end = parse_bound(end).ok_or_else(bad_format)?;

        if end <= start {
            return Err(ShardError::InvalidRange { start, end });
        }
        Ok((start, end, key.clone()))
    })
    .collect()
}

fn parse_bound(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// `bounds` must be sorted by start.
fn check_coverage(bounds: &[(usize, usize, String)], total: i64) -> Result<(), ShardError> {
    for pair in bounds.windows(2) {
        let (_, prev_end, _) = &pair[0];
        let (next_start, _, _) = &pair[1];
        if next_start <= prev_end {
            return Err(ShardError::Overlap(*next_start));
        }
    }

    let max_end = bounds.iter().map(|(_, end, _)| *end).max().unwrap_or(0);
    if max_end as i64 != total - 1 {
        return Err(ShardError::OutOfBounds {
            max: total - 1,
            found: max_end,
        });
    }

    let mut expected = 0;
    for (start, end, _) in bounds {
        if *start != expected {
            return Err(ShardError::MissingCoverage(expected));
        }
        expected = end + 1;
    }

    Ok(())
}
