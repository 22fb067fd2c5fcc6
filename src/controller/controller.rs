use super::builder::ModelBuilder;
use super::command::{Action, Command, CommandCallback, CommandCompletion, CommandError, CommandOutcome};
use super::delete::{DeleteOperation, FileDeleter, ScanTarget};
use super::extract::{ExtractResult, ExtractState, ExtractStatus, Extractor};
use super::memory_monitor::MemoryMonitor;
use super::persist::ControllerPersist;
use super::scanner::{ScanResult, ScanSource};
use super::status::{Status, StatusSnapshot};
use super::transfer::{JobState, TransferClient, TransferJobStatus};
use crate::model::{diff_models, FileState, Model, ModelDiff, ModelError, ModelFile, ModelListener};
use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The rebuild was abandoned; the live model is unchanged
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("collaborator failed: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

impl ControllerError {
    /// Whether the service should stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerError::Collaborator(_))
    }
}

/// The moving parts the controller drives
pub struct Collaborators {
    pub scans: Box<dyn ScanSource>,
    pub transfer: Box<dyn TransferClient>,
    pub extractor: Box<dyn Extractor>,
    pub deleter: Box<dyn FileDeleter>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub cache_ttl: Duration,
    pub memory_log_interval: Duration,
}

/// What one tick gathered from the collaborators
struct Collected {
    remote: Option<ScanResult>,
    local: Option<ScanResult>,
    active: Option<ScanResult>,
    transfer_statuses: Option<Vec<TransferJobStatus>>,
    extract_statuses: Option<Vec<ExtractStatus>>,
    extracted: Vec<ExtractResult>,
}

/// Owns the live model and advances it one tick at a time.
///
/// Only the thread calling [`Controller::process`] mutates the model; every
/// other thread goes through a [`ControllerHandle`].
pub struct Controller {
    builder: ModelBuilder,
    model: Arc<Mutex<Model>>,
    persist: Arc<Mutex<ControllerPersist>>,
    status: Arc<Status>,
    scans: Box<dyn ScanSource>,
    transfer: Box<dyn TransferClient>,
    extractor: Box<dyn Extractor>,
    deleter: Box<dyn FileDeleter>,
    command_tx: Sender<Command>,
    command_rx: Receiver<Command>,
    active_operations: Vec<DeleteOperation>,
    active_downloading: Vec<String>,
    active_extracting: Vec<String>,
    /// Set once any remote scan has succeeded
    remote_scan_seen: bool,
    memory_monitor: MemoryMonitor,
}

impl Controller {
    pub fn new(
        collaborators: Collaborators,
        persist: ControllerPersist,
        status: Arc<Status>,
        options: ControllerOptions,
    ) -> Self {
        let mut builder = ModelBuilder::new(options.cache_ttl);
        builder.set_downloaded_files(persist.downloaded.as_set());
        builder.set_extracted_files(persist.extracted.as_set());

        let model = Arc::new(Mutex::new(Model::new()));
        let persist = Arc::new(Mutex::new(persist));
        let (command_tx, command_rx) = unbounded();

        let mut memory_monitor = MemoryMonitor::new(options.memory_log_interval);
        {
            let model = model.clone();
            memory_monitor.register_data_source("model_files", move || model.lock().len());
        }
        let sizes: [(&str, fn(&ControllerPersist) -> usize); 5] = [
            ("downloaded", |p| p.downloaded.len()),
            ("extracted", |p| p.extracted.len()),
            ("stopped", |p| p.stopped.len()),
            ("imported", |p| p.imported.len()),
            ("downloaded_evictions", |p| p.downloaded.total_evictions() as usize),
        ];
        for (label, pick) in sizes {
            let persist = persist.clone();
            memory_monitor.register_data_source(label, move || pick(&persist.lock()));
        }

        Self {
            builder,
            model,
            persist,
            status,
            scans: collaborators.scans,
            transfer: collaborators.transfer,
            extractor: collaborators.extractor,
            deleter: collaborators.deleter,
            command_tx,
            command_rx,
            active_operations: Vec::new(),
            active_downloading: Vec::new(),
            active_extracting: Vec::new(),
            remote_scan_seen: false,
            memory_monitor,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            model: self.model.clone(),
            persist: self.persist.clone(),
            status: self.status.clone(),
            command_tx: self.command_tx.clone(),
        }
    }

    /// One reconciliation tick. Never blocks on a collaborator.
    pub fn process(&mut self) -> Result<(), ControllerError> {
        self.propagate_errors()?;
        self.cleanup_operations();
        self.process_commands();

        let collected = self.collect();
        self.update_active_files(&collected);
        self.feed_builder(&collected);
        let built = self.build_and_apply();
        self.update_status(&collected);

        self.memory_monitor.log_stats_if_due();
        built
    }

    /// Wait for delete operations still in flight.
    pub fn exit(&mut self) {
        for operation in self.active_operations.drain(..) {
            let name = operation.name.clone();
            if let Err(e) = operation.join() {
                warn!("Operation on {} failed during shutdown: {:#}", name, e);
            }
        }
        self.memory_monitor.force_log_stats();
        info!("Controller exited");
    }

    fn propagate_errors(&mut self) -> anyhow::Result<()> {
        self.transfer.propagate_error()?;
        self.scans.propagate_error()?;
        self.extractor.propagate_error()
    }

    fn cleanup_operations(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .active_operations
            .drain(..)
            .partition(DeleteOperation::is_finished);
        self.active_operations = running;

        for operation in finished {
            let rescan = operation.rescan;
            let name = operation.name.clone();
            if let Err(e) = operation.join() {
                warn!("Delete of {} failed: {:#}", name, e);
            }
            match rescan {
                ScanTarget::Local => self.scans.force_local_scan(),
                ScanTarget::Remote => self.scans.force_remote_scan(),
            }
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            info!("Received command {} for file {}", command.action, command.file_name);
            let outcome = self.dispatch(&command);
            if let Err(e) = &outcome {
                warn!("Command failed. {}", e);
            }
            command.complete(&outcome);
        }
    }

    /// Validate against the live model as it is now, then delegate.
    fn dispatch(&mut self, command: &Command) -> CommandOutcome {
        let name = command.file_name.as_str();
        let file = self
            .model
            .lock()
            .get_file(name)
            .map_err(|_| CommandError::not_found(format!("File '{}' not found", name)))?;

        match command.action {
            Action::Queue => {
                if file.remote_size.is_none() {
                    return Err(CommandError::not_found(format!(
                        "File '{}' does not exist remotely",
                        name
                    )));
                }
                self.transfer
                    .queue(file.name(), file.is_dir())
                    .map_err(|e| CommandError::transient(format!("Transfer error: {}", e)))?;
                self.persist.lock().stopped.discard(name);
            }
            Action::Stop => {
                if !matches!(file.state, FileState::Downloading | FileState::Queued) {
                    return Err(CommandError::conflict(format!(
                        "File '{}' is not Queued or Downloading",
                        name
                    )));
                }
                self.transfer
                    .kill(file.name())
                    .map_err(|e| CommandError::transient(format!("Transfer error: {}", e)))?;
                self.persist.lock().stopped.add(name.to_string());
            }
            Action::Extract => {
                if !is_settled(file.state) {
                    return Err(CommandError::conflict(format!(
                        "File '{}' in state {} cannot be extracted",
                        name, file.state
                    )));
                }
                require_local(&file)?;
                self.extractor
                    .extract(&file)
                    .map_err(|e| CommandError::transient(format!("Extract error: {}", e)))?;
            }
            Action::DeleteLocal => {
                if !is_settled(file.state) {
                    return Err(CommandError::conflict(format!(
                        "Local file '{}' cannot be deleted in state {}",
                        name, file.state
                    )));
                }
                require_local(&file)?;
                let operation = self
                    .deleter
                    .delete_local(file.name())
                    .map_err(|e| CommandError::transient(format!("Delete error: {}", e)))?;
                self.active_operations.push(operation);
                self.persist.lock().stopped.add(name.to_string());
            }
            Action::DeleteRemote => {
                if !is_settled(file.state) && file.state != FileState::Deleted {
                    return Err(CommandError::conflict(format!(
                        "Remote file '{}' cannot be deleted in state {}",
                        name, file.state
                    )));
                }
                if file.remote_size.is_none() {
                    return Err(CommandError::not_found(format!(
                        "File '{}' does not exist remotely",
                        name
                    )));
                }
                let operation = self
                    .deleter
                    .delete_remote(file.name())
                    .map_err(|e| CommandError::transient(format!("Delete error: {}", e)))?;
                self.active_operations.push(operation);
            }
        }
        Ok(())
    }

    fn collect(&mut self) -> Collected {
        let scans = self.scans.pop_latest_results();
        let transfer_statuses = match self.transfer.status() {
            Ok(statuses) => Some(statuses),
            Err(e) => {
                warn!("Transfer status unavailable this tick: {}", e);
                None
            }
        };
        Collected {
            remote: scans.remote,
            local: scans.local,
            active: scans.active,
            transfer_statuses,
            extract_statuses: self.extractor.pop_latest_statuses(),
            extracted: self.extractor.pop_completed(),
        }
    }

    fn update_active_files(&mut self, collected: &Collected) {
        if let Some(statuses) = &collected.transfer_statuses {
            self.active_downloading = statuses
                .iter()
                .filter(|s| s.state == JobState::Running)
                .map(|s| s.name.clone())
                .collect();
        }
        if let Some(statuses) = &collected.extract_statuses {
            self.active_extracting = statuses
                .iter()
                .filter(|s| s.state == ExtractState::Extracting)
                .map(|s| s.name.clone())
                .collect();
        }
        let active = self
            .active_downloading
            .iter()
            .chain(self.active_extracting.iter())
            .cloned()
            .collect();
        self.scans.update_active_files(active);
    }

    fn feed_builder(&mut self, collected: &Collected) {
        // A failed scan says nothing about the files; keep the last good one
        if let Some(scan) = collected.remote.as_ref().filter(|s| !s.failed) {
            self.builder.set_remote_files(scan.files.clone());
            self.remote_scan_seen = true;
        }
        if let Some(scan) = collected.local.as_ref().filter(|s| !s.failed) {
            self.builder.set_local_files(scan.files.clone());
        }
        if let Some(scan) = collected.active.as_ref().filter(|s| !s.failed) {
            self.builder.set_active_files(scan.files.clone());
        }
        if let Some(statuses) = &collected.transfer_statuses {
            self.builder.set_transfer_statuses(statuses.clone());
        }
        if let Some(statuses) = &collected.extract_statuses {
            self.builder.set_extract_statuses(statuses.clone());
        }
        if !collected.extracted.is_empty() {
            let mut persist = self.persist.lock();
            for result in &collected.extracted {
                info!("Extraction of {} completed", result.name);
                persist.extracted.add(result.name.clone());
            }
            self.builder.set_extracted_files(persist.extracted.as_set());
        }
    }

    fn build_and_apply(&mut self) -> Result<(), ControllerError> {
        if !self.builder.has_changes() {
            return Ok(());
        }
        let new_model = self.builder.build_model().map_err(|e| {
            error!("Model rebuild failed, keeping the current model: {}", e);
            e
        })?;
        let touched = self.builder.take_touched_downloaded();

        // Lock order: model, then persist
        let mut model = self.model.lock();
        let diff = diff_models(&model, &new_model);
        if !diff.is_empty() {
            debug!("Applying {} model change(s)", diff.len());
        }

        let mut persist = self.persist.lock();
        for entry in diff {
            if let Some(name) = newly_downloaded(&entry) {
                info!("{} is downloaded", name);
                persist.downloaded.add(name.to_string());
            }
            match entry {
                ModelDiff::Added(file) => model.add_file(file)?,
                ModelDiff::Removed(file) => {
                    model.remove_file(file.name())?;
                }
                ModelDiff::Updated { new, .. } => model.update_file(new)?,
            }
        }

        for name in &touched {
            persist.downloaded.touch(name.as_str());
        }

        let deleted: Vec<String> = persist
            .extracted
            .iter()
            .filter(|name| {
                model
                    .get_file(name)
                    .map_or(false, |f| f.state == FileState::Deleted)
            })
            .cloned()
            .collect();
        if !deleted.is_empty() {
            info!("Removing from extracted list: {:?}", deleted);
            persist.extracted.remove_all(deleted.iter());
        }

        if self.remote_scan_seen {
            let gone: Vec<String> = persist
                .downloaded
                .iter()
                .filter(|name| !model.contains(name))
                .cloned()
                .collect();
            if !gone.is_empty() {
                info!("Removing from downloaded list: {:?}", gone);
                persist.downloaded.remove_all(gone.iter());
            }
        }

        self.builder.set_downloaded_files(persist.downloaded.as_set());
        self.builder.set_extracted_files(persist.extracted.as_set());
        Ok(())
    }

    fn update_status(&self, collected: &Collected) {
        if let Some(scan) = &collected.remote {
            self.status.controller.set("latest_remote_scan", |c| {
                c.latest_remote_scan_time = Some(scan.timestamp);
                c.latest_remote_scan_failed = Some(scan.failed);
                c.latest_remote_scan_error = scan.error_message.clone();
            });
        }
        if let Some(scan) = &collected.local {
            self.status.controller.set("latest_local_scan_time", |c| {
                c.latest_local_scan_time = Some(scan.timestamp);
            });
        }
    }
}

/// States a file can be extracted or locally deleted from
fn is_settled(state: FileState) -> bool {
    matches!(
        state,
        FileState::Default | FileState::Downloaded | FileState::Extracted
    )
}

fn require_local(file: &ModelFile) -> Result<(), CommandError> {
    match file.local_size {
        Some(_) => Ok(()),
        None => Err(CommandError::not_found(format!(
            "File '{}' does not exist locally",
            file.name()
        ))),
    }
}

fn has_downloaded_content(file: &ModelFile) -> bool {
    match file.state {
        FileState::Downloaded => true,
        FileState::Downloading => file.local_size.map_or(false, |s| s > 0),
        _ => false,
    }
}

/// Name of a file that just started holding downloaded content
fn newly_downloaded(entry: &ModelDiff) -> Option<&str> {
    match entry {
        ModelDiff::Added(file) if has_downloaded_content(file) => Some(file.name()),
        ModelDiff::Updated { old, new }
            if has_downloaded_content(new) && !has_downloaded_content(old) =>
        {
            Some(new.name())
        }
        _ => None,
    }
}

/// Result of one command issued by [`ControllerHandle::run_bulk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOutcome {
    pub file_name: String,
    /// `None` if the command had not been processed before the timeout
    pub outcome: Option<CommandOutcome>,
}

/// Logs the outcome of a command nobody may be waiting on any more
struct LogOutcome {
    action: Action,
    file_name: String,
}

impl CommandCallback for LogOutcome {
    fn on_success(&mut self) {
        debug!("{} {} succeeded", self.action, self.file_name);
    }

    fn on_failure(&mut self, error: &CommandError) {
        info!("{} {} failed: {}", self.action, self.file_name, error);
    }
}

/// Thread-safe access to the controller's model, tracking sets and command
/// queue
#[derive(Clone)]
pub struct ControllerHandle {
    model: Arc<Mutex<Model>>,
    persist: Arc<Mutex<ControllerPersist>>,
    status: Arc<Status>,
    command_tx: Sender<Command>,
}

impl ControllerHandle {
    pub fn files(&self) -> Vec<Arc<ModelFile>> {
        self.model.lock().files()
    }

    pub fn file(&self, name: &str) -> Option<Arc<ModelFile>> {
        self.model.lock().get_file(name).ok()
    }

    /// Register a listener and return the files it should start from. No
    /// change can fall between the snapshot and the registration.
    pub fn files_and_add_listener(&self, listener: Arc<dyn ModelListener>) -> Vec<Arc<ModelFile>> {
        let mut model = self.model.lock();
        model.add_listener(listener);
        model.files()
    }

    pub fn add_listener(&self, listener: Arc<dyn ModelListener>) {
        self.model.lock().add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ModelListener>) -> bool {
        self.model.lock().remove_listener(listener)
    }

    pub fn is_file_stopped(&self, name: &str) -> bool {
        self.persist.lock().stopped.contains(name)
    }

    pub fn is_file_downloaded(&self, name: &str) -> bool {
        self.persist.lock().downloaded.contains(name)
    }

    pub fn is_file_imported(&self, name: &str) -> bool {
        self.persist.lock().imported.contains(name)
    }

    /// Hand a command to the reconciliation thread. If the controller is
    /// gone the command fails straight away.
    pub fn queue_command(&self, command: Command) {
        if let Err(SendError(command)) = self.command_tx.send(command) {
            command.complete(&Err(CommandError::internal("controller is not running")));
        }
    }

    pub fn submit(&self, action: Action, file_name: impl Into<String>) -> CommandCompletion {
        let mut command = Command::new(action, file_name);
        let completion = command.completion();
        self.queue_command(command);
        completion
    }

    /// Issue `action` for every name, then wait up to `timeout` on each.
    pub fn run_bulk<I, S>(&self, action: Action, names: I, timeout: Duration) -> Vec<BulkOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let completions: Vec<CommandCompletion> = names
            .into_iter()
            .map(|name| {
                let mut command = Command::new(action, name);
                command.add_callback(Box::new(LogOutcome {
                    action,
                    file_name: command.file_name.clone(),
                }));
                let completion = command.completion();
                self.queue_command(command);
                completion
            })
            .collect();

        completions
            .into_iter()
            .map(|completion| {
                let outcome = completion.wait_timeout(timeout);
                if outcome.is_none() {
                    warn!(
                        "{} {} still pending after {:?}",
                        action,
                        completion.file_name(),
                        timeout
                    );
                }
                BulkOutcome {
                    file_name: completion.file_name().to_string(),
                    outcome,
                }
            })
            .collect()
    }

    pub fn status(&self) -> &Arc<Status> {
        &self.status
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Copy of the tracking sets, for saving
    pub fn persist_snapshot(&self) -> ControllerPersist {
        self.persist.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::scanner::{ScanResults, SystemFile};
    use crate::controller::transfer::{JobKind, TransferError, TransferState};
    use crate::controller::extract::ExtractError;
    use crate::controller::command::CommandErrorKind;
    use crate::utils::EventQueue;
    use crate::model::ModelEvent;
    use std::io;

    #[derive(Default)]
    struct Shared {
        remote: Option<ScanResult>,
        local: Option<ScanResult>,
        active_names: Vec<String>,
        forced_local: usize,
        forced_remote: usize,
        fatal: Option<String>,
        statuses: Vec<TransferJobStatus>,
        status_error: bool,
        queued: Vec<String>,
        killed: Vec<String>,
        extract_requests: Vec<String>,
        extract_statuses: Option<Vec<ExtractStatus>>,
        completed: Vec<ExtractResult>,
        deleted: Vec<String>,
        /// Make every delegated queue/kill/extract/delete fail
        refuse: bool,
    }

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "refused")
    }

    type Fakes = Arc<Mutex<Shared>>;

    struct FakeScans(Fakes);
    struct FakeTransfer(Fakes);
    struct FakeExtractor(Fakes);
    struct FakeDeleter(Fakes);

    impl ScanSource for FakeScans {
        fn pop_latest_results(&mut self) -> ScanResults {
            let mut s = self.0.lock();
            ScanResults {
                remote: s.remote.take(),
                local: s.local.take(),
                active: None,
            }
        }

        fn update_active_files(&mut self, names: Vec<String>) {
            self.0.lock().active_names = names;
        }

        fn force_local_scan(&self) {
            self.0.lock().forced_local += 1;
        }

        fn force_remote_scan(&self) {
            self.0.lock().forced_remote += 1;
        }

        fn propagate_error(&self) -> anyhow::Result<()> {
            match &self.0.lock().fatal {
                Some(msg) => Err(anyhow::anyhow!("{}", msg)),
                None => Ok(()),
            }
        }
    }

    impl TransferClient for FakeTransfer {
        fn queue(&mut self, name: &str, _is_dir: bool) -> Result<(), TransferError> {
            let mut s = self.0.lock();
            if s.refuse {
                return Err(TransferError::Spawn {
                    name: name.to_string(),
                    source: refused(),
                });
            }
            s.queued.push(name.to_string());
            Ok(())
        }

        fn kill(&mut self, name: &str) -> Result<(), TransferError> {
            let mut s = self.0.lock();
            if s.refuse {
                return Err(TransferError::Kill {
                    name: name.to_string(),
                    source: refused(),
                });
            }
            s.killed.push(name.to_string());
            Ok(())
        }

        fn status(&mut self) -> Result<Vec<TransferJobStatus>, TransferError> {
            let s = self.0.lock();
            if s.status_error {
                return Err(TransferError::NoSuchJob("status".into()));
            }
            Ok(s.statuses.clone())
        }

        fn propagate_error(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl Extractor for FakeExtractor {
        fn extract(&mut self, file: &ModelFile) -> Result<(), ExtractError> {
            let mut s = self.0.lock();
            if s.refuse {
                return Err(ExtractError::WorkerGone);
            }
            s.extract_requests.push(file.name().to_string());
            Ok(())
        }

        fn pop_latest_statuses(&mut self) -> Option<Vec<ExtractStatus>> {
            self.0.lock().extract_statuses.take()
        }

        fn pop_completed(&mut self) -> Vec<ExtractResult> {
            std::mem::take(&mut self.0.lock().completed)
        }

        fn propagate_error(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl FileDeleter for FakeDeleter {
        fn delete_local(&self, name: &str) -> io::Result<DeleteOperation> {
            let mut s = self.0.lock();
            if s.refuse {
                return Err(refused());
            }
            s.deleted.push(name.to_string());
            DeleteOperation::spawn(name, ScanTarget::Local, || Ok(()))
        }

        fn delete_remote(&self, name: &str) -> io::Result<DeleteOperation> {
            let mut s = self.0.lock();
            if s.refuse {
                return Err(refused());
            }
            s.deleted.push(name.to_string());
            DeleteOperation::spawn(name, ScanTarget::Remote, || Ok(()))
        }
    }

    fn controller_with(persist: ControllerPersist) -> (Controller, Fakes) {
        let fakes: Fakes = Arc::new(Mutex::new(Shared::default()));
        let controller = Controller::new(
            Collaborators {
                scans: Box::new(FakeScans(fakes.clone())),
                transfer: Box::new(FakeTransfer(fakes.clone())),
                extractor: Box::new(FakeExtractor(fakes.clone())),
                deleter: Box::new(FakeDeleter(fakes.clone())),
            },
            persist,
            Arc::new(Status::new()),
            ControllerOptions {
                cache_ttl: Duration::from_secs(1800),
                memory_log_interval: Duration::from_secs(3600),
            },
        );
        (controller, fakes)
    }

    fn controller() -> (Controller, Fakes) {
        controller_with(ControllerPersist::new(100))
    }

    fn scans(fakes: &Fakes, remote: Option<Vec<SystemFile>>, local: Option<Vec<SystemFile>>) {
        let mut s = fakes.lock();
        s.remote = remote.map(ScanResult::ok);
        s.local = local.map(ScanResult::ok);
    }

    fn running(name: &str, size_local: u64, speed: u64) -> TransferJobStatus {
        TransferJobStatus {
            job_id: 1,
            kind: JobKind::Pget,
            state: JobState::Running,
            name: name.to_string(),
            flags: String::new(),
            total_transfer_state: Some(TransferState {
                size_local: Some(size_local),
                speed: Some(speed),
                ..Default::default()
            }),
            active_file_transfer_states: Vec::new(),
        }
    }

    fn queued(name: &str) -> TransferJobStatus {
        TransferJobStatus {
            state: JobState::Queued,
            total_transfer_state: None,
            ..running(name, 0, 0)
        }
    }

    fn run(c: &mut Controller, action: Action, name: &str) -> CommandOutcome {
        let completion = c.handle().submit(action, name);
        c.process().unwrap();
        completion.wait()
    }

    fn state(handle: &ControllerHandle, name: &str) -> FileState {
        handle.file(name).unwrap().state
    }

    #[test]
    fn test_download_then_complete_is_tracked() {
        let (mut c, fakes) = controller();
        let handle = c.handle();

        scans(&fakes, Some(vec![SystemFile::file("movie.mkv", 1000)]), Some(vec![]));
        fakes.lock().statuses = vec![running("movie.mkv", 400, 100)];
        c.process().unwrap();

        let file = handle.file("movie.mkv").unwrap();
        assert_eq!(file.state, FileState::Downloading);
        assert_eq!(file.eta, Some(6));
        assert!(!handle.is_file_downloaded("movie.mkv"));
        assert_eq!(fakes.lock().active_names, vec!["movie.mkv".to_string()]);

        scans(&fakes, None, Some(vec![SystemFile::file("movie.mkv", 1000)]));
        fakes.lock().statuses.clear();
        c.process().unwrap();

        assert_eq!(state(&handle, "movie.mkv"), FileState::Downloaded);
        assert!(handle.is_file_downloaded("movie.mkv"));
        assert!(fakes.lock().active_names.is_empty());
    }

    #[test]
    fn test_queue_without_remote_is_not_found() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(&fakes, Some(vec![]), Some(vec![SystemFile::file("local.mkv", 10)]));
        c.process().unwrap();

        let completion = handle.submit(Action::Queue, "local.mkv");
        c.process().unwrap();
        let err = completion.wait().unwrap_err();
        assert_eq!(err.kind.http_status(), 404);
        assert!(err.message.contains("does not exist remotely"));
        assert!(fakes.lock().queued.is_empty());
    }

    #[test]
    fn test_unknown_file_is_not_found() {
        let (mut c, _fakes) = controller();
        let completion = c.handle().submit(Action::Stop, "ghost");
        c.process().unwrap();
        assert_eq!(
            completion.wait(),
            Err(CommandError::not_found("File 'ghost' not found"))
        );
    }

    #[test]
    fn test_queue_and_stop_update_stopped_set() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(&fakes, Some(vec![SystemFile::file("a", 100)]), Some(vec![]));
        c.process().unwrap();

        let stop = handle.submit(Action::Stop, "a");
        c.process().unwrap();
        assert_eq!(stop.wait().unwrap_err().kind.http_status(), 409);

        let queue = handle.submit(Action::Queue, "a");
        c.process().unwrap();
        queue.wait().unwrap();
        assert_eq!(fakes.lock().queued, vec!["a".to_string()]);

        fakes.lock().statuses = vec![running("a", 0, 0)];
        c.process().unwrap();
        assert_eq!(state(&handle, "a"), FileState::Downloading);

        let stop = handle.submit(Action::Stop, "a");
        c.process().unwrap();
        stop.wait().unwrap();
        assert!(handle.is_file_stopped("a"));
        assert_eq!(fakes.lock().killed, vec!["a".to_string()]);

        let queue = handle.submit(Action::Queue, "a");
        c.process().unwrap();
        queue.wait().unwrap();
        assert!(!handle.is_file_stopped("a"));
    }

    #[test]
    fn test_deleted_then_pruned() {
        let mut persist = ControllerPersist::new(100);
        persist.downloaded.add("old.mkv".to_string());
        let (mut c, fakes) = controller_with(persist);
        let handle = c.handle();

        scans(&fakes, Some(vec![SystemFile::file("old.mkv", 100)]), Some(vec![]));
        c.process().unwrap();
        assert_eq!(state(&handle, "old.mkv"), FileState::Deleted);
        assert!(handle.is_file_downloaded("old.mkv"));

        scans(&fakes, Some(vec![]), None);
        c.process().unwrap();
        assert!(handle.file("old.mkv").is_none());
        assert!(!handle.is_file_downloaded("old.mkv"));
    }

    #[test]
    fn test_no_pruning_before_remote_scan() {
        let mut persist = ControllerPersist::new(100);
        persist.downloaded.add("a".to_string());
        let (mut c, fakes) = controller_with(persist);
        let handle = c.handle();

        scans(&fakes, None, Some(vec![SystemFile::file("b", 1)]));
        c.process().unwrap();
        assert!(handle.is_file_downloaded("a"));

        fakes.lock().remote = Some(ScanResult::failed("connection refused"));
        c.process().unwrap();
        assert!(handle.is_file_downloaded("a"));
        let status = handle.status_snapshot().controller;
        assert_eq!(status.latest_remote_scan_failed, Some(true));
        assert_eq!(status.latest_remote_scan_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_failed_extraction_reverts_without_retry() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(
            &fakes,
            Some(vec![SystemFile::file("a.rar", 100)]),
            Some(vec![SystemFile::file("a.rar", 100)]),
        );
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Downloaded);

        let extract = handle.submit(Action::Extract, "a.rar");
        c.process().unwrap();
        extract.wait().unwrap();

        fakes.lock().extract_statuses = Some(vec![ExtractStatus {
            name: "a.rar".into(),
            is_dir: false,
            state: ExtractState::Extracting,
        }]);
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Extracting);

        fakes.lock().extract_statuses = Some(Vec::new());
        c.process().unwrap();
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Downloaded);
        assert_eq!(fakes.lock().extract_requests, vec!["a.rar".to_string()]);
    }

    #[test]
    fn test_completed_extraction_promotes() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(
            &fakes,
            Some(vec![SystemFile::file("a.rar", 100)]),
            Some(vec![SystemFile::file("a.rar", 100)]),
        );
        c.process().unwrap();

        fakes.lock().completed = vec![ExtractResult {
            name: "a.rar".into(),
            is_dir: false,
        }];
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Extracted);
        assert!(handle.persist_snapshot().extracted.contains("a.rar"));
    }

    #[test]
    fn test_extract_and_delete_local_rejected_while_busy() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(
            &fakes,
            Some(vec![
                SystemFile::file("q.mkv", 100),
                SystemFile::file("d.mkv", 100),
                SystemFile::file("x.rar", 100),
            ]),
            Some(vec![SystemFile::file("d.mkv", 10), SystemFile::file("x.rar", 100)]),
        );
        {
            let mut s = fakes.lock();
            s.statuses = vec![queued("q.mkv"), running("d.mkv", 10, 1)];
            s.extract_statuses = Some(vec![ExtractStatus {
                name: "x.rar".into(),
                is_dir: false,
                state: ExtractState::Extracting,
            }]);
        }
        c.process().unwrap();
        assert_eq!(state(&handle, "q.mkv"), FileState::Queued);
        assert_eq!(state(&handle, "d.mkv"), FileState::Downloading);
        assert_eq!(state(&handle, "x.rar"), FileState::Extracting);

        for name in ["q.mkv", "d.mkv", "x.rar"] {
            for action in [Action::Extract, Action::DeleteLocal] {
                let err = run(&mut c, action, name).unwrap_err();
                assert_eq!(err.kind, CommandErrorKind::Conflict, "{} {}", action, name);
                assert_eq!(err.kind.http_status(), 409);
            }
        }
        let s = fakes.lock();
        assert!(s.extract_requests.is_empty());
        assert!(s.deleted.is_empty());
        drop(s);
        assert!(!handle.is_file_stopped("d.mkv"));
    }

    #[test]
    fn test_extract_without_local_is_not_found() {
        let (mut c, fakes) = controller();
        scans(&fakes, Some(vec![SystemFile::file("a.rar", 100)]), Some(vec![]));
        c.process().unwrap();
        assert_eq!(state(&c.handle(), "a.rar"), FileState::Default);

        let err = run(&mut c, Action::Extract, "a.rar").unwrap_err();
        assert_eq!(err.kind.http_status(), 404);
        assert!(err.message.contains("does not exist locally"));

        let err = run(&mut c, Action::DeleteLocal, "a.rar").unwrap_err();
        assert_eq!(err.kind.http_status(), 404);
        assert!(fakes.lock().extract_requests.is_empty());
    }

    #[test]
    fn test_collaborator_failures_are_transient() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        fakes.lock().statuses = vec![running("d.mkv", 10, 1)];
        scans(
            &fakes,
            Some(vec![
                SystemFile::file("q.mkv", 100),
                SystemFile::file("d.mkv", 100),
                SystemFile::file("r.rar", 100),
            ]),
            Some(vec![SystemFile::file("r.rar", 100)]),
        );
        c.process().unwrap();
        fakes.lock().refuse = true;

        let cases = [
            (Action::Queue, "q.mkv", "Transfer error: "),
            (Action::Stop, "d.mkv", "Transfer error: "),
            (Action::Extract, "r.rar", "Extract error: "),
            (Action::DeleteLocal, "r.rar", "Delete error: "),
            (Action::DeleteRemote, "r.rar", "Delete error: "),
        ];
        for (action, name, prefix) in cases {
            let err = run(&mut c, action, name).unwrap_err();
            assert_eq!(err.kind, CommandErrorKind::Transient, "{} {}", action, name);
            assert_eq!(err.kind.http_status(), 500);
            assert!(err.message.starts_with(prefix), "{}", err.message);
        }

        // Nothing is recorded for a command the collaborator refused
        assert!(!handle.is_file_stopped("d.mkv"));
        assert!(!handle.is_file_stopped("r.rar"));
        assert_eq!(state(&handle, "d.mkv"), FileState::Downloading);
        assert_eq!(state(&handle, "r.rar"), FileState::Downloaded);
        let s = fakes.lock();
        assert_eq!((s.forced_local, s.forced_remote), (0, 0));
    }

    #[test]
    fn test_deleted_file_loses_extracted_mark_and_redownloads() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(
            &fakes,
            Some(vec![SystemFile::file("a.rar", 100)]),
            Some(vec![SystemFile::file("a.rar", 100)]),
        );
        c.process().unwrap();
        fakes.lock().completed = vec![ExtractResult {
            name: "a.rar".into(),
            is_dir: false,
        }];
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Extracted);

        scans(&fakes, None, Some(vec![]));
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Deleted);
        assert!(!handle.persist_snapshot().extracted.contains("a.rar"));
        assert!(handle.is_file_downloaded("a.rar"));

        run(&mut c, Action::DeleteRemote, "a.rar").unwrap();
        assert_eq!(fakes.lock().deleted, vec!["a.rar".to_string()]);

        scans(&fakes, None, Some(vec![SystemFile::file("a.rar", 100)]));
        c.process().unwrap();
        assert_eq!(state(&handle, "a.rar"), FileState::Downloaded);
    }

    #[test]
    fn test_model_error_keeps_live_model() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(&fakes, Some(vec![SystemFile::file("a", 100)]), Some(vec![]));
        c.process().unwrap();
        let before = handle.file("a").unwrap();

        scans(&fakes, None, Some(vec![SystemFile::dir("a", vec![])]));
        let err = c.process().unwrap_err();
        assert!(matches!(err, ControllerError::Model(ModelError::IsDirMismatch { .. })));
        assert!(!err.is_fatal());
        assert!(Arc::ptr_eq(&before, &handle.file("a").unwrap()));
    }

    #[test]
    fn test_collaborator_fault_is_fatal() {
        let (mut c, fakes) = controller();
        fakes.lock().fatal = Some("remote scanner died".into());
        let err = c.process().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transfer_status_error_is_skipped() {
        let (mut c, fakes) = controller();
        fakes.lock().status_error = true;
        scans(&fakes, Some(vec![SystemFile::file("a", 1)]), Some(vec![]));
        c.process().unwrap();
        assert!(c.handle().file("a").is_some());
    }

    #[test]
    fn test_delete_local_forces_local_scan() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(
            &fakes,
            Some(vec![SystemFile::file("a", 10)]),
            Some(vec![SystemFile::file("a", 10)]),
        );
        c.process().unwrap();

        let delete = handle.submit(Action::DeleteLocal, "a");
        c.process().unwrap();
        delete.wait().unwrap();
        assert!(handle.is_file_stopped("a"));

        for _ in 0..500 {
            c.process().unwrap();
            if fakes.lock().forced_local > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fakes.lock().forced_local, 1);
        assert_eq!(fakes.lock().forced_remote, 0);
    }

    #[test]
    fn test_delete_remote_requires_remote() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(&fakes, Some(vec![]), Some(vec![SystemFile::file("a", 10)]));
        c.process().unwrap();

        let delete = handle.submit(Action::DeleteRemote, "a");
        c.process().unwrap();
        assert_eq!(delete.wait().unwrap_err().kind.http_status(), 404);
        assert!(fakes.lock().deleted.is_empty());
    }

    #[test]
    fn test_listener_snapshot_then_events() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(&fakes, Some(vec![SystemFile::file("a", 1)]), Some(vec![]));
        c.process().unwrap();

        let queue = Arc::new(EventQueue::<ModelEvent>::new(10));
        let listener: Arc<dyn ModelListener> = queue.clone();
        let snapshot = handle.files_and_add_listener(listener.clone());
        assert_eq!(snapshot.len(), 1);

        scans(&fakes, Some(vec![SystemFile::file("a", 1), SystemFile::file("b", 1)]), None);
        c.process().unwrap();
        assert!(matches!(queue.next_event(), Some(ModelEvent::Added(f)) if f.name() == "b"));
        assert!(queue.next_event().is_none());
        assert!(handle.remove_listener(&listener));
    }

    #[test]
    fn test_bulk_timeout_leaves_command_queued() {
        let (mut c, fakes) = controller();
        let handle = c.handle();
        scans(&fakes, Some(vec![SystemFile::file("a", 1)]), Some(vec![]));
        c.process().unwrap();

        let outcomes = handle.run_bulk(Action::Queue, ["a"], Duration::from_millis(10));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome, None);

        c.process().unwrap();
        assert_eq!(fakes.lock().queued, vec!["a".to_string()]);
    }

    #[test]
    fn test_command_after_controller_dropped_fails() {
        let (c, _fakes) = controller();
        let handle = c.handle();
        drop(c);
        let err = handle.submit(Action::Queue, "a").wait().unwrap_err();
        assert_eq!(err.kind, crate::controller::command::CommandErrorKind::Internal);
    }
}
