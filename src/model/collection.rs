use super::{ModelError, ModelFile};
use crate::utils::EventQueue;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

/// Observer of changes applied to a live [`Model`].
///
/// Callbacks run on the reconciliation thread while the model lock is held,
/// so implementations must return quickly and never call back into the model.
pub trait ModelListener: Send + Sync {
    fn file_added(&self, file: &Arc<ModelFile>);
    fn file_removed(&self, file: &Arc<ModelFile>);
    fn file_updated(&self, old_file: &Arc<ModelFile>, new_file: &Arc<ModelFile>);
}

#[derive(Debug, Clone)]
pub enum ModelEvent {
    Added(Arc<ModelFile>),
    Removed(Arc<ModelFile>),
    Updated {
        old: Arc<ModelFile>,
        new: Arc<ModelFile>,
    },
}

impl ModelEvent {
    pub fn name(&self) -> &str {
        match self {
            ModelEvent::Added(file) | ModelEvent::Removed(file) => file.name(),
            ModelEvent::Updated { new, .. } => new.name(),
        }
    }
}

/// Streaming consumers get a bounded queue; a slow reader loses its oldest
/// events rather than stalling the reconciliation thread.
impl ModelListener for EventQueue<ModelEvent> {
    fn file_added(&self, file: &Arc<ModelFile>) {
        self.put(ModelEvent::Added(file.clone()));
    }

    fn file_removed(&self, file: &Arc<ModelFile>) {
        self.put(ModelEvent::Removed(file.clone()));
    }

    fn file_updated(&self, old_file: &Arc<ModelFile>, new_file: &Arc<ModelFile>) {
        self.put(ModelEvent::Updated {
            old: old_file.clone(),
            new: new_file.clone(),
        });
    }
}

/// Root-level files keyed by name, in insertion order.
#[derive(Default)]
pub struct Model {
    files: IndexMap<String, Arc<ModelFile>>,
    listeners: Vec<Arc<dyn ModelListener>>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("files", &self.files)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ModelListener>) {
        self.listeners.push(listener);
    }

    /// Detach a listener previously added; identity is the `Arc` allocation.
    pub fn remove_listener(&mut self, listener: &Arc<dyn ModelListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let before = self.listeners.len();
        self.listeners
            .retain(|l| Arc::as_ptr(l) as *const () != target);
        before != self.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn add_file(&mut self, file: Arc<ModelFile>) -> Result<(), ModelError> {
        if self.files.contains_key(file.name()) {
            return Err(ModelError::FileExists(file.name().to_string()));
        }
        debug!("Model: adding {}", file.name());
        self.files.insert(file.name().to_string(), file.clone());
        for listener in &self.listeners {
            listener.file_added(&file);
        }
        Ok(())
    }

    pub fn remove_file(&mut self, name: &str) -> Result<Arc<ModelFile>, ModelError> {
        let file = self
            .files
            .shift_remove(name)
            .ok_or_else(|| ModelError::FileNotFound(name.to_string()))?;
        debug!("Model: removing {}", name);
        for listener in &self.listeners {
            listener.file_removed(&file);
        }
        Ok(file)
    }

    /// Replace the file of the same name, keeping its position.
    pub fn update_file(&mut self, file: Arc<ModelFile>) -> Result<(), ModelError> {
        let slot = self
            .files
            .get_mut(file.name())
            .ok_or_else(|| ModelError::FileNotFound(file.name().to_string()))?;
        let old = std::mem::replace(slot, file.clone());
        debug!("Model: updating {}", file.name());
        for listener in &self.listeners {
            listener.file_updated(&old, &file);
        }
        Ok(())
    }

    pub fn get_file(&self, name: &str) -> Result<Arc<ModelFile>, ModelError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::FileNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Shared references to every root file; no deep copy.
    pub fn files(&self) -> Vec<Arc<ModelFile>> {
        self.files.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
