use crate::utils::BoundedOrderedSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("invalid persist document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk shape, every list oldest first
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistDocument {
    downloaded: Vec<String>,
    extracted: Vec<String>,
    #[serde(default)]
    stopped: Vec<String>,
    #[serde(default)]
    imported: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EvictionStats {
    pub downloaded: u64,
    pub extracted: u64,
    pub stopped: u64,
    pub imported: u64,
}

/// Tracking sets that survive restarts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPersist {
    pub downloaded: BoundedOrderedSet<String>,
    pub extracted: BoundedOrderedSet<String>,
    pub stopped: BoundedOrderedSet<String>,
    pub imported: BoundedOrderedSet<String>,
    max_len: usize,
}

impl ControllerPersist {
    pub fn new(max_len: usize) -> Self {
        Self {
            downloaded: BoundedOrderedSet::new(max_len),
            extracted: BoundedOrderedSet::new(max_len),
            stopped: BoundedOrderedSet::new(max_len),
            imported: BoundedOrderedSet::new(max_len),
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Parse a stored document. Lists longer than `max_len` keep only
    /// their newest entries.
    pub fn from_json(content: &str, max_len: usize) -> Result<Self, PersistError> {
        let doc: PersistDocument = serde_json::from_str(content)?;
        let persist = Self {
            downloaded: load_set("downloaded", doc.downloaded, max_len),
            extracted: load_set("extracted", doc.extracted, max_len),
            stopped: load_set("stopped", doc.stopped, max_len),
            imported: load_set("imported", doc.imported, max_len),
            max_len,
        };
        info!(
            "Loaded persist: {} downloaded, {} extracted, {} stopped, {} imported",
            persist.downloaded.len(),
            persist.extracted.len(),
            persist.stopped.len(),
            persist.imported.len()
        );
        Ok(persist)
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        let doc = PersistDocument {
            downloaded: self.downloaded.as_list(),
            extracted: self.extracted.as_list(),
            stopped: self.stopped.as_list(),
            imported: self.imported.as_list(),
        };
        Ok(serde_json::to_string(&doc)?)
    }

    pub fn eviction_stats(&self) -> EvictionStats {
        EvictionStats {
            downloaded: self.downloaded.total_evictions(),
            extracted: self.extracted.total_evictions(),
            stopped: self.stopped.total_evictions(),
            imported: self.imported.total_evictions(),
        }
    }
}

impl Default for ControllerPersist {
    fn default() -> Self {
        Self::new(crate::utils::bounded_set::DEFAULT_MAX_LEN)
    }
}

fn load_set(key: &str, names: Vec<String>, max_len: usize) -> BoundedOrderedSet<String> {
    let set = BoundedOrderedSet::from_iter_with_capacity(names, max_len);
    if set.total_evictions() > 0 {
        warn!(
            "Persist list '{}' exceeded {} entries, evicted {} oldest",
            key,
            max_len,
            set.total_evictions()
        );
    }
    set
}
