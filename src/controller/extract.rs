use crate::model::ModelFile;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    Extracting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractStatus {
    pub name: String,
    pub is_dir: bool,
    pub state: ExtractState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractResult {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction worker is not running")]
    WorkerGone,
}

/// The extraction subsystem as the controller sees it
pub trait Extractor: Send {
    /// Request extraction; completion is reported later.
    fn extract(&mut self, file: &ModelFile) -> Result<(), ExtractError>;

    /// Newest in-progress statuses, if they changed since the last call
    fn pop_latest_statuses(&mut self) -> Option<Vec<ExtractStatus>>;

    fn pop_completed(&mut self) -> Vec<ExtractResult>;

    fn propagate_error(&mut self) -> anyhow::Result<()>;
}

fn archive_patterns() -> &'static Option<(Regex, Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let archive = Regex::new(
            r"(?i)\.(rar|zip|7z|tar|tgz|tar\.gz|tar\.bz2|tar\.xz|gz|bz2|xz|lzma|r\d{2}|7z\.\d{3})$",
        )
        .ok()?;
        let continuation =
            Regex::new(r"(?i)(\.r\d{2}|\.part0*([2-9]|[1-9]\d+)\.rar|\.7z\.0*([2-9]|[1-9]\d+))$")
                .ok()?;
        Some((archive, continuation))
    })
}

/// Whether the name looks like an archive, judged by extension only
pub fn is_archive(name: &str) -> bool {
    archive_patterns()
        .as_ref()
        .map_or(false, |(archive, _)| archive.is_match(name))
}

/// Later volumes of a split archive; extracting the first volume covers them
fn is_continuation_volume(name: &str) -> bool {
    archive_patterns()
        .as_ref()
        .map_or(false, |(_, continuation)| continuation.is_match(name))
}

#[derive(Debug, Clone)]
struct Request {
    name: String,
    is_dir: bool,
}

#[derive(Default)]
struct Shared {
    /// Requests not yet finished, head is in progress
    queue: VecDeque<ExtractStatus>,
    statuses_changed: bool,
    completed: Vec<ExtractResult>,
}

impl Shared {
    fn publish(&mut self) {
        self.statuses_changed = true;
    }
}

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub local_path: PathBuf,
    pub out_dir: PathBuf,
    pub command: String,
}

/// Extracts archives one request at a time on a worker thread
pub struct ExtractProcess {
    tx: Option<Sender<Request>>,
    shared: Arc<Mutex<Shared>>,
    handle: Option<JoinHandle<()>>,
}

impl ExtractProcess {
    pub fn start(settings: ExtractSettings) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Request>();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let handle = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("extract".to_string())
                .spawn(move || run_worker(settings, rx, shared))?
        };
        Ok(Self {
            tx: Some(tx),
            shared,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Extract worker panicked");
            }
        }
    }
}

impl Drop for ExtractProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Extractor for ExtractProcess {
    fn extract(&mut self, file: &ModelFile) -> Result<(), ExtractError> {
        let tx = self.tx.as_ref().ok_or(ExtractError::WorkerGone)?;
        {
            let mut shared = self.shared.lock();
            if shared.queue.iter().any(|s| s.name == file.name()) {
                debug!("{} is already queued for extraction", file.name());
                return Ok(());
            }
            shared.queue.push_back(ExtractStatus {
                name: file.name().to_string(),
                is_dir: file.is_dir(),
                state: ExtractState::Extracting,
            });
            shared.publish();
        }
        tx.send(Request {
            name: file.name().to_string(),
            is_dir: file.is_dir(),
        })
        .map_err(|_| ExtractError::WorkerGone)
    }

    fn pop_latest_statuses(&mut self) -> Option<Vec<ExtractStatus>> {
        let mut shared = self.shared.lock();
        if !shared.statuses_changed {
            return None;
        }
        shared.statuses_changed = false;
        Some(shared.queue.iter().cloned().collect())
    }

    fn pop_completed(&mut self) -> Vec<ExtractResult> {
        std::mem::take(&mut self.shared.lock().completed)
    }

    fn propagate_error(&mut self) -> anyhow::Result<()> {
        let alive = self.handle.as_ref().map_or(true, |h| !h.is_finished());
        if self.tx.is_some() && !alive {
            anyhow::bail!("extract worker exited unexpectedly");
        }
        Ok(())
    }
}

fn run_worker(settings: ExtractSettings, rx: Receiver<Request>, shared: Arc<Mutex<Shared>>) {
    for request in rx.iter() {
        let result = extract_request(&settings, &request);
        let mut shared = shared.lock();
        shared.queue.retain(|s| s.name != request.name);
        shared.publish();
        match result {
            Ok(count) => {
                info!("Extracted {} ({} archive(s))", request.name, count);
                shared.completed.push(ExtractResult {
                    name: request.name,
                    is_dir: request.is_dir,
                });
            }
            Err(e) => warn!("Failed to extract {}: {:#}", request.name, e),
        }
    }
    debug!("Extract worker exiting");
}

fn archives_in(root: &Path) -> Vec<PathBuf> {
    let mut archives: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            is_archive(&name) && !is_continuation_volume(&name)
        })
        .map(|e| e.into_path())
        .collect();
    archives.sort();
    archives
}

fn extract_request(settings: &ExtractSettings, request: &Request) -> anyhow::Result<usize> {
    let source = settings.local_path.join(&request.name);
    let jobs: Vec<(PathBuf, PathBuf)> = if request.is_dir {
        archives_in(&source)
            .into_iter()
            .map(|archive| {
                let relative_dir = archive
                    .parent()
                    .and_then(|p| p.strip_prefix(&settings.local_path).ok())
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                (archive, settings.out_dir.join(relative_dir))
            })
            .collect()
    } else {
        vec![(source, settings.out_dir.clone())]
    };

    if jobs.is_empty() {
        anyhow::bail!("no archives found in {}", request.name);
    }

    for (archive, out_dir) in &jobs {
        std::fs::create_dir_all(out_dir)?;
        debug!("Extracting {} into {}", archive.display(), out_dir.display());
        let output = Command::new(&settings.command)
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", out_dir.display()))
            .arg(archive)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                settings.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
    Ok(jobs.len())
}
