use super::extract::{is_archive, ExtractStatus};
use super::scanner::SystemFile;
use super::transfer::{JobKind, JobState, TransferJobStatus, TransferState};
use crate::model::{FileState, Model, ModelError, ModelFile};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Merges the scans, transfer statuses, extraction statuses and tracking
/// sets into one model.
///
/// The built model is cached until a setter receives a value different
/// from the one it holds, or until the TTL runs out.
pub struct ModelBuilder {
    local_files: HashMap<String, SystemFile>,
    remote_files: HashMap<String, SystemFile>,
    transfer_statuses: HashMap<String, TransferJobStatus>,
    extract_statuses: HashMap<String, ExtractStatus>,
    downloaded_files: HashSet<String>,
    extracted_files: HashSet<String>,
    cached: Option<(Arc<Model>, Instant)>,
    ttl: Duration,
    /// Names the last rebuild marked DELETED from the downloaded set
    touched_downloaded: Vec<String>,
}

fn by_name<T>(items: Vec<T>, name: impl Fn(&T) -> &str) -> HashMap<String, T> {
    items
        .into_iter()
        .map(|item| (name(&item).to_string(), item))
        .collect()
}

impl ModelBuilder {
    pub fn new(ttl: Duration) -> Self {
        Self {
            local_files: HashMap::new(),
            remote_files: HashMap::new(),
            transfer_statuses: HashMap::new(),
            extract_statuses: HashMap::new(),
            downloaded_files: HashSet::new(),
            extracted_files: HashSet::new(),
            cached: None,
            ttl,
            touched_downloaded: Vec::new(),
        }
    }

    fn replace<T: PartialEq>(slot: &mut T, value: T, cached: &mut Option<(Arc<Model>, Instant)>) {
        if *slot != value {
            *slot = value;
            *cached = None;
        }
    }

    pub fn set_local_files(&mut self, files: Vec<SystemFile>) {
        Self::replace(&mut self.local_files, by_name(files, |f| &f.name), &mut self.cached);
    }

    pub fn set_remote_files(&mut self, files: Vec<SystemFile>) {
        Self::replace(&mut self.remote_files, by_name(files, |f| &f.name), &mut self.cached);
    }

    /// Overlay fresher local entries for files being transferred or
    /// extracted. An empty list changes nothing.
    pub fn set_active_files(&mut self, files: Vec<SystemFile>) {
        for file in files {
            if self.local_files.get(&file.name) != Some(&file) {
                self.local_files.insert(file.name.clone(), file);
                self.cached = None;
            }
        }
    }

    pub fn set_transfer_statuses(&mut self, statuses: Vec<TransferJobStatus>) {
        Self::replace(
            &mut self.transfer_statuses,
            by_name(statuses, |s| &s.name),
            &mut self.cached,
        );
    }

    pub fn set_extract_statuses(&mut self, statuses: Vec<ExtractStatus>) {
        Self::replace(
            &mut self.extract_statuses,
            by_name(statuses, |s| &s.name),
            &mut self.cached,
        );
    }

    pub fn set_downloaded_files(&mut self, names: HashSet<String>) {
        Self::replace(&mut self.downloaded_files, names, &mut self.cached);
    }

    pub fn set_extracted_files(&mut self, names: HashSet<String>) {
        Self::replace(&mut self.extracted_files, names, &mut self.cached);
    }

    pub fn clear(&mut self) {
        self.local_files.clear();
        self.remote_files.clear();
        self.transfer_statuses.clear();
        self.extract_statuses.clear();
        self.downloaded_files.clear();
        self.extracted_files.clear();
        self.touched_downloaded.clear();
        self.cached = None;
    }

    /// True when the next `build_model` will rebuild
    pub fn has_changes(&self) -> bool {
        !matches!(&self.cached, Some((_, built)) if built.elapsed() <= self.ttl)
    }

    /// Names whose DELETED state came from the downloaded set, so the owner
    /// can keep them from being evicted.
    pub fn take_touched_downloaded(&mut self) -> Vec<String> {
        std::mem::take(&mut self.touched_downloaded)
    }

    pub fn build_model(&mut self) -> Result<Arc<Model>, ModelError> {
        if let Some((model, built)) = &self.cached {
            if built.elapsed() <= self.ttl {
                return Ok(model.clone());
            }
            debug!("Model cache expired after {}s", built.elapsed().as_secs());
            self.cached = None;
        }

        let names: BTreeSet<&String> = self
            .local_files
            .keys()
            .chain(self.remote_files.keys())
            .chain(self.transfer_statuses.keys())
            .collect();

        let mut model = Model::new();
        let mut touched = Vec::new();
        for name in names {
            let mut file = self.build_root_file(name)?;
            if self.resolve_final_state(&mut file)? {
                touched.push(name.clone());
            }
            model.add_file(Arc::new(file))?;
        }

        let model = Arc::new(model);
        self.touched_downloaded = touched;
        self.cached = Some((model.clone(), Instant::now()));
        Ok(model)
    }

    fn build_root_file(&self, name: &str) -> Result<ModelFile, ModelError> {
        let remote = self.remote_files.get(name);
        let local = self.local_files.get(name);
        let status = self.transfer_statuses.get(name);

        let status_is_dir = status.map(|s| s.kind == JobKind::Mirror);
        let is_dir = remote
            .map(|f| f.is_dir)
            .or(local.map(|f| f.is_dir))
            .or(status_is_dir)
            .ok_or_else(|| ModelError::NoSources(name.to_string()))?;

        if remote.map_or(false, |f| f.is_dir != is_dir)
            || local.map_or(false, |f| f.is_dir != is_dir)
            || status_is_dir.map_or(false, |d| d != is_dir)
        {
            return Err(ModelError::IsDirMismatch {
                name: name.to_string(),
                context: "sources",
            });
        }

        let mut file = ModelFile::new(name, is_dir);
        if let Some(status) = status {
            file.state = match status.state {
                JobState::Queued => FileState::Queued,
                JobState::Running => FileState::Downloading,
            };
        }

        let transfer_state = status
            .filter(|s| s.state == JobState::Running)
            .and_then(|s| s.total_transfer_state.as_ref());
        fill_attributes(&mut file, remote, local, transfer_state);

        if remote.is_some() || local.is_some() {
            let children = ChildBuilder {
                root_state: file.state,
                status,
            };
            children.build_into(&mut file, remote, local, "")?;
        }

        estimate_eta(&mut file, transfer_state);
        Ok(file)
    }

    /// Returns true if the file became DELETED because of the downloaded set.
    fn resolve_final_state(&self, file: &mut ModelFile) -> Result<bool, ModelError> {
        // Downloaded
        if file.state == FileState::Default {
            let downloaded = if file.is_dir() {
                file.remote_size.is_some() && all_remote_children_downloaded(file)
            } else {
                matches!((file.local_size, file.remote_size), (Some(l), Some(r)) if l >= r)
            };
            if downloaded {
                file.state = FileState::Downloaded;
            }
        }

        // Deleted
        let mut touched = false;
        if file.state == FileState::Default
            && file.local_size.is_none()
            && self.downloaded_files.contains(file.name())
        {
            file.state = FileState::Deleted;
            touched = true;
        }

        // Extracting
        if let Some(status) = self.extract_statuses.get(file.name()) {
            if status.is_dir != file.is_dir() {
                return Err(ModelError::IsDirMismatch {
                    name: file.name().to_string(),
                    context: "file and extract status",
                });
            }
            let extractable_state = matches!(file.state, FileState::Default | FileState::Downloaded);
            if extractable_state && file.local_size.is_some() {
                file.state = FileState::Extracting;
            } else if file.local_size.is_none() {
                warn!("File {} has extract status but doesn't exist locally", file.name());
            } else {
                warn!("File {} has extract status but is in state {}", file.name(), file.state);
            }
        }

        // Extracted
        if file.state == FileState::Downloaded && self.extracted_files.contains(file.name()) {
            file.state = FileState::Extracted;
        }

        Ok(touched)
    }
}

/// Every non-directory descendant that exists remotely is DOWNLOADED
fn all_remote_children_downloaded(file: &ModelFile) -> bool {
    let mut frontier: VecDeque<&ModelFile> = file.children().collect();
    while let Some(child) = frontier.pop_front() {
        if !child.is_dir() && child.remote_size.is_some() && child.state != FileState::Downloaded {
            return false;
        }
        frontier.extend(child.children());
    }
    true
}

struct ChildBuilder<'a> {
    root_state: FileState,
    status: Option<&'a TransferJobStatus>,
}

impl ChildBuilder<'_> {
    /// Build the union of remote and local children under `parent`.
    ///
    /// `path` is the parent's path below the root, empty for the root.
    fn build_into(
        &self,
        parent: &mut ModelFile,
        remote: Option<&SystemFile>,
        local: Option<&SystemFile>,
        path: &str,
    ) -> Result<(), ModelError> {
        let remote_children: HashMap<&str, &SystemFile> = remote
            .map(|f| f.children.iter().map(|c| (c.name.as_str(), c)).collect())
            .unwrap_or_default();
        let local_children: HashMap<&str, &SystemFile> = local
            .map(|f| f.children.iter().map(|c| (c.name.as_str(), c)).collect())
            .unwrap_or_default();
        let names: BTreeSet<&str> = remote_children
            .keys()
            .chain(local_children.keys())
            .copied()
            .collect();

        for name in names {
            let remote_child = remote_children.get(name).copied();
            let local_child = local_children.get(name).copied();
            let child_path = if path.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", path, name)
            };

            let is_dir = remote_child.or(local_child).map_or(false, |f| f.is_dir);
            if local_child.map_or(false, |f| f.is_dir != is_dir) {
                return Err(ModelError::IsDirMismatch {
                    name: format!("{}/{}", parent.full_path(), name),
                    context: "child sources",
                });
            }

            let transfer_state = self.status.and_then(|s| {
                s.active_file_transfer_states
                    .iter()
                    .find(|(p, _)| *p == child_path)
                    .map(|(_, state)| state)
            });

            let mut child = ModelFile::new(name, is_dir);
            child.state = self.child_state(is_dir, remote_child, local_child, transfer_state);
            fill_attributes(&mut child, remote_child, local_child, transfer_state);
            self.build_into(&mut child, remote_child, local_child, &child_path)?;

            if let (Some(total), Some(part)) = (parent.transferred_size, child.transferred_size) {
                parent.transferred_size = Some(total + part);
            }
            if child.is_extractable {
                parent.is_extractable = true;
            }
            parent.add_child(child)?;
        }
        Ok(())
    }

    fn child_state(
        &self,
        is_dir: bool,
        remote: Option<&SystemFile>,
        local: Option<&SystemFile>,
        transfer_state: Option<&TransferState>,
    ) -> FileState {
        if is_dir {
            FileState::Default
        } else if transfer_state.is_some() {
            FileState::Downloading
        } else if matches!((remote, local), (Some(r), Some(l)) if l.size >= r.size) {
            FileState::Downloaded
        } else if remote.is_some()
            && matches!(self.root_state, FileState::Queued | FileState::Downloading)
        {
            FileState::Queued
        } else {
            FileState::Default
        }
    }
}

/// Sizes, speed, timestamps and the file's own extractable flag.
/// A directory's transferred size starts at zero and grows with its children.
fn fill_attributes(
    file: &mut ModelFile,
    remote: Option<&SystemFile>,
    local: Option<&SystemFile>,
    transfer_state: Option<&TransferState>,
) {
    file.remote_size = remote.map(|f| f.size);
    file.local_size = local.map(|f| f.size);

    if let Some(state) = transfer_state {
        file.downloading_speed = state.speed;
        file.eta = state.eta;
    }

    if let (Some(r), Some(l)) = (remote, local) {
        file.transferred_size = Some(if file.is_dir() { 0 } else { l.size.min(r.size) });
    }

    if !file.is_dir() && is_archive(file.name()) {
        file.is_extractable = true;
    }

    if let Some(l) = local {
        file.local_created_timestamp = l.timestamp_created;
        file.local_modified_timestamp = l.timestamp_modified;
    }
    if let Some(r) = remote {
        file.remote_created_timestamp = r.timestamp_created;
        file.remote_modified_timestamp = r.timestamp_modified;
    }
}

/// First-order estimate for a downloading root without a reported ETA.
/// Without a local scan the transfer's own local size stands in.
fn estimate_eta(file: &mut ModelFile, transfer_state: Option<&TransferState>) {
    if file.state != FileState::Downloading || file.eta.is_some() {
        return;
    }
    let Some(speed) = file.downloading_speed.filter(|&s| s > 0) else {
        return;
    };
    let Some(remote_size) = file.remote_size else {
        return;
    };
    let Some(transferred) = file
        .transferred_size
        .or_else(|| transfer_state.and_then(|s| s.size_local))
    else {
        return;
    };
    file.eta = Some(remote_size.saturating_sub(transferred).div_ceil(speed));
}
