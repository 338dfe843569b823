//! Geographic sharding over S2 cells.
//!
//! Backends are keyed by S2 cell id. A shard key is turned into a cell,
//! either from a `lat<sep>lng` pair or from a cell id embedded at a fixed
//! position in a separated id, and routed to the configured cell that
//! contains it.

use std::collections::HashMap;
use std::sync::Arc;

use s2::cellid::CellID;
use s2::latlng::LatLng;
use serde::Deserialize;
use serde_json::Value;

use super::{to_backends, Backend, BackendDefaults, BackendDefinition, ShardError, DEFAULT_BACKEND_KEY};

#[derive(Debug, Deserialize)]
struct S2Config {
    #[serde(default)]
    shard_key_separator: String,
    shard_key_position: Option<i64>,
    #[serde(default)]
    backends: HashMap<String, BackendDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    LatLng,
    SmartId(usize),
}

#[derive(Debug)]
pub struct S2Strategy {
    cells: Vec<(CellID, Arc<Backend>)>,
    default: Option<Arc<Backend>>,
    separator: String,
    mode: KeyMode,
}

impl S2Strategy {
    pub fn from_config(config: &Value, defaults: &BackendDefaults) -> Result<Self, ShardError> {
        let cfg = S2Config::deserialize(config)?;

        if cfg.shard_key_separator.is_empty() {
            return Err(ShardError::MissingSeparator);
        }

        let mode = match cfg.shard_key_position {
            None | Some(-1) => KeyMode::LatLng,
            Some(p) if p >= 0 => KeyMode::SmartId(p as usize),
            Some(p) => return Err(ShardError::InvalidPosition(p)),
        };

        let mut ids = Vec::with_capacity(cfg.backends.len());
        for key in cfg.backends.keys().filter(|k| *k != DEFAULT_BACKEND_KEY) {
            let cell = key
                .parse()
                .map(CellID)
                .ok()
                .filter(CellID::is_valid)
                .ok_or_else(|| ShardError::BadCellId(key.clone()))?;
            ids.push((key.clone(), cell));
        }

        if let Some(overlapping) = find_overlap(&ids) {
            return Err(ShardError::OverlappingCells(overlapping));
        }

        let mut backends = to_backends(&cfg.backends, defaults)?;
        let default = backends.remove(DEFAULT_BACKEND_KEY);
        let cells = ids
            .into_iter()
            .filter_map(|(key, cell)| backends.remove(&key).map(|b| (cell, b)))
            .collect();

        Ok(Self {
            cells,
            default,
            separator: cfg.shard_key_separator,
            mode,
        })
    }

    pub fn shard(&self, key: &str) -> Result<Option<Arc<Backend>>, ShardError> {
        let target = self.cell_id(key)?;

        let owner = self
            .cells
            .iter()
            .find(|(cell, _)| cell.contains(&target))
            .map(|(_, backend)| backend)
            .or(self.default.as_ref())
            .ok_or(ShardError::NoGeoBackend)?;

        Ok(Some(Arc::clone(owner)))
    }

    fn cell_id(&self, key: &str) -> Result<CellID, ShardError> {
        let parts: Vec<&str> = key.split(self.separator.as_str()).collect();
        match self.mode {
            KeyMode::LatLng => cell_from_lat_lng(&parts),
            KeyMode::SmartId(pos) => cell_from_smart_id(&parts, pos),
        }
    }
}

fn cell_from_lat_lng(parts: &[&str]) -> Result<CellID, ShardError> {
    let [lat, lng] = parts else {
        return Err(ShardError::InvalidLocation("lat lng key is not valid"));
    };

    let lat: f64 = lat
        .parse()
        .map_err(|_| ShardError::InvalidLocation("fail to parse latitude"))?;
    let lng: f64 = lng
        .parse()
        .map_err(|_| ShardError::InvalidLocation("fail to parse longitude"))?;

    let ll = LatLng::from_degrees(lat, lng);
    if !ll.is_valid() {
        return Err(ShardError::InvalidLocation(
            "fail to convert lat-long to s2 objects",
        ));
    }

    Ok(CellID::from(&ll))
}

fn cell_from_smart_id(parts: &[&str], pos: usize) -> Result<CellID, ShardError> {
    let raw = parts
        .get(pos)
        .ok_or(ShardError::InvalidLocation("failed to get location from smart-id"))?;
    let id: u64 = raw
        .parse()
        .map_err(|_| ShardError::InvalidLocation("failed to parse s2id"))?;
    Ok(CellID(id))
}

/// Returns the first pair of configured cells where one contains the other.
fn find_overlap(ids: &[(String, CellID)]) -> Option<Vec<String>> {
    let mut sorted: Vec<&(String, CellID)> = ids.iter().collect();
    sorted.sort_by_key(|(_, cell)| cell.level());

    for (i, (outer_key, outer)) in sorted.iter().enumerate() {
        for (inner_key, inner) in &sorted[i + 1..] {
            if outer.level() < inner.level() && outer.contains(inner) {
                return Some(vec![outer_key.clone(), inner_key.clone()]);
            }
        }
    }
    None
}
