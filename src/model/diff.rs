use super::{Model, ModelFile};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum ModelDiff {
    Added(Arc<ModelFile>),
    Removed(Arc<ModelFile>),
    Updated {
        old: Arc<ModelFile>,
        new: Arc<ModelFile>,
    },
}

impl ModelDiff {
    pub fn name(&self) -> &str {
        match self {
            ModelDiff::Added(file) | ModelDiff::Removed(file) => file.name(),
            ModelDiff::Updated { new, .. } => new.name(),
        }
    }
}

/// Changes that turn `old` into `new`, one entry per differing root name.
///
/// Content is compared by value, children included.
pub fn diff_models(old: &Model, new: &Model) -> Vec<ModelDiff> {
    let mut diffs = Vec::new();

    for old_file in old.files() {
        match new.get_file(old_file.name()) {
            Ok(new_file) => {
                if !Arc::ptr_eq(&old_file, &new_file) && *old_file != *new_file {
                    diffs.push(ModelDiff::Updated {
                        old: old_file,
                        new: new_file,
                    });
                }
            }
            Err(_) => diffs.push(ModelDiff::Removed(old_file)),
        }
    }

    for new_file in new.files() {
        if !old.contains(new_file.name()) {
            diffs.push(ModelDiff::Added(new_file));
        }
    }

    diffs
}
