pub mod collection;
pub mod diff;

pub use collection::{Model, ModelEvent, ModelListener};
pub use diff::{diff_models, ModelDiff};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("file '{0}' already exists in the model")]
    FileExists(String),

    #[error("file '{0}' not found in the model")]
    FileNotFound(String),

    #[error("mismatch in is_dir between {context} for '{name}'")]
    IsDirMismatch { name: String, context: &'static str },

    #[error("zero sources have a file object for '{0}'")]
    NoSources(String),

    #[error("duplicate child '{child}' under '{parent}'")]
    DuplicateChild { parent: String, child: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Default,
    Queued,
    Downloading,
    Downloaded,
    Deleted,
    Extracting,
    Extracted,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileState::Default => "DEFAULT",
            FileState::Queued => "QUEUED",
            FileState::Downloading => "DOWNLOADING",
            FileState::Downloaded => "DOWNLOADED",
            FileState::Deleted => "DELETED",
            FileState::Extracting => "EXTRACTING",
            FileState::Extracted => "EXTRACTED",
        };
        f.write_str(s)
    }
}

/// One entry of the reconciled model, root-level or nested.
///
/// Children are owned by their parent. The way back up is `full_path`:
/// `parent_path()` names the parent without holding a reference to it.
/// Once a file is placed in a [`Model`] it is shared behind an `Arc` and
/// never mutated again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    name: String,
    is_dir: bool,
    full_path: String,
    children: IndexMap<String, ModelFile>,

    pub state: FileState,
    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    pub transferred_size: Option<u64>,
    pub downloading_speed: Option<u64>,
    pub eta: Option<u64>,
    pub is_extractable: bool,
    pub local_created_timestamp: Option<i64>,
    pub local_modified_timestamp: Option<i64>,
    pub remote_created_timestamp: Option<i64>,
    pub remote_modified_timestamp: Option<i64>,
}

impl ModelFile {
    pub fn new(name: impl Into<String>, is_dir: bool) -> Self {
        let name = name.into();
        Self {
            full_path: name.clone(),
            name,
            is_dir,
            children: IndexMap::new(),
            state: FileState::Default,
            local_size: None,
            remote_size: None,
            transferred_size: None,
            downloading_speed: None,
            eta: None,
            is_extractable: false,
            local_created_timestamp: None,
            local_modified_timestamp: None,
            remote_created_timestamp: None,
            remote_modified_timestamp: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Path from the root-level ancestor, `/`-separated, including this name
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.full_path.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Path relative to the root-level ancestor; `None` for a root
    pub fn path_below_root(&self) -> Option<&str> {
        self.full_path.split_once('/').map(|(_, rest)| rest)
    }

    pub fn is_root(&self) -> bool {
        !self.full_path.contains('/')
    }

    /// Adopt `child`, rewriting its path (and its descendants') under this file.
    pub fn add_child(&mut self, mut child: ModelFile) -> Result<(), ModelError> {
        if self.children.contains_key(&child.name) {
            return Err(ModelError::DuplicateChild {
                parent: self.full_path.clone(),
                child: child.name,
            });
        }
        child.reparent(&self.full_path);
        self.children.insert(child.name.clone(), child);
        Ok(())
    }

    fn reparent(&mut self, parent_path: &str) {
        self.full_path = format!("{}/{}", parent_path, self.name);
        let path = self.full_path.clone();
        for child in self.children.values_mut() {
            child.reparent(&path);
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &ModelFile> {
        self.children.values()
    }

    pub fn child(&self, name: &str) -> Option<&ModelFile> {
        self.children.get(name)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Every descendant, breadth first
    pub fn descendants(&self) -> Vec<&ModelFile> {
        let mut out = Vec::new();
        let mut frontier: std::collections::VecDeque<&ModelFile> = self.children.values().collect();
        while let Some(file) = frontier.pop_front() {
            frontier.extend(file.children.values());
            out.push(file);
        }
        out
    }
}
