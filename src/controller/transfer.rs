use super::ssh::RemoteEndpoint;
use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Single file
    Pget,
    /// Directory
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferState {
    pub size_local: Option<u64>,
    pub size_remote: Option<u64>,
    pub percent_local: Option<u8>,
    pub speed: Option<u64>,
    pub eta: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJobStatus {
    pub job_id: u64,
    pub kind: JobKind,
    pub state: JobState,
    pub name: String,
    pub flags: String,
    pub total_transfer_state: Option<TransferState>,
    /// Per-file progress, keyed by path below the job's root
    pub active_file_transfer_states: Vec<(String, TransferState)>,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to start transfer of '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no transfer job for '{0}'")]
    NoSuchJob(String),

    #[error("failed to stop transfer of '{name}': {source}")]
    Kill {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// The download manager as the controller sees it
pub trait TransferClient: Send {
    fn queue(&mut self, name: &str, is_dir: bool) -> Result<(), TransferError>;

    fn kill(&mut self, name: &str) -> Result<(), TransferError>;

    fn status(&mut self) -> Result<Vec<TransferJobStatus>, TransferError>;

    /// Faults that should stop the service
    fn propagate_error(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RsyncSettings {
    pub endpoint: RemoteEndpoint,
    pub local_path: PathBuf,
    pub max_parallel: usize,
}

#[derive(Debug, Default)]
struct Progress {
    total: TransferState,
    current_file: Option<String>,
}

struct Job {
    id: u64,
    name: String,
    is_dir: bool,
    child: Option<Child>,
    progress: Arc<Mutex<Progress>>,
}

/// Runs one rsync process per queued root-level file.
///
/// At most `max_parallel` run at once; the rest wait in queue order and
/// are reported as queued.
pub struct RsyncTransfer {
    settings: RsyncSettings,
    jobs: IndexMap<String, Job>,
    next_id: u64,
    pending_error: Option<String>,
}

impl RsyncTransfer {
    pub fn new(settings: RsyncSettings) -> Self {
        Self {
            settings,
            jobs: IndexMap::new(),
            next_id: 1,
            pending_error: None,
        }
    }

    fn running_count(&self) -> usize {
        self.jobs.values().filter(|j| j.child.is_some()).count()
    }

    fn build_command(&self, name: &str) -> Command {
        let mut cmd = Command::new("rsync");
        cmd.args([
            "-a",
            "--no-perms",
            "--no-owner",
            "--no-group",
            "--partial",
            "--inplace",
            "--protect-args",
            "--info=progress2",
            "--itemize-changes",
        ]);
        cmd.arg("-e").arg(self.settings.endpoint.rsync_shell());
        cmd.arg(format!(
            "{}:{}",
            self.settings.endpoint.login,
            self.settings.endpoint.file_path(name)
        ));
        cmd.arg(&self.settings.local_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn spawn(&self, job: &mut Job) -> Result<(), TransferError> {
        let mut child = self
            .build_command(&job.name)
            .spawn()
            .map_err(|source| TransferError::Spawn {
                name: job.name.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            let progress = job.progress.clone();
            let root = job.name.clone();
            let is_dir = job.is_dir;
            std::thread::spawn(move || read_progress(stdout, &root, is_dir, &progress));
        }
        if let Some(mut stderr) = child.stderr.take() {
            let name = job.name.clone();
            std::thread::spawn(move || {
                let mut text = String::new();
                if stderr.read_to_string(&mut text).is_ok() {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        warn!("rsync [{}]: {}", name, line);
                    }
                }
            });
        }

        info!("Started transfer {} for {}", job.id, job.name);
        job.child = Some(child);
        Ok(())
    }

    /// Drop finished jobs and start waiting ones while slots are free.
    fn advance(&mut self) {
        self.jobs.retain(|name, job| {
            let Some(child) = job.child.as_mut() else {
                return true;
            };
            match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) if status.success() => {
                    info!("Transfer of {} finished", name);
                    false
                }
                Ok(Some(status)) => {
                    warn!("Transfer of {} exited with {}", name, status);
                    false
                }
                Err(e) => {
                    warn!("Lost track of transfer {}: {}", name, e);
                    false
                }
            }
        });

        let mut free = self.settings.max_parallel.saturating_sub(self.running_count());
        let waiting: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.child.is_none())
            .map(|(name, _)| name.clone())
            .collect();

        for name in waiting {
            if free == 0 {
                break;
            }
            let Some(mut job) = self.jobs.shift_remove(&name) else {
                continue;
            };
            match self.spawn(&mut job) {
                Ok(()) => {
                    free -= 1;
                    self.jobs.insert(name, job);
                }
                Err(e) => {
                    error!("{}", e);
                    self.pending_error = Some(e.to_string());
                }
            }
        }
    }
}

impl TransferClient for RsyncTransfer {
    fn queue(&mut self, name: &str, is_dir: bool) -> Result<(), TransferError> {
        if self.jobs.contains_key(name) {
            debug!("{} is already queued", name);
            return Ok(());
        }
        let mut job = Job {
            id: self.next_id,
            name: name.to_string(),
            is_dir,
            child: None,
            progress: Arc::new(Mutex::new(Progress::default())),
        };
        self.next_id += 1;

        if self.running_count() < self.settings.max_parallel {
            self.spawn(&mut job)?;
        } else {
            info!("Queued transfer {} for {}", job.id, name);
        }
        self.jobs.insert(name.to_string(), job);
        Ok(())
    }

    fn kill(&mut self, name: &str) -> Result<(), TransferError> {
        let mut job = self
            .jobs
            .shift_remove(name)
            .ok_or_else(|| TransferError::NoSuchJob(name.to_string()))?;
        if let Some(mut child) = job.child.take() {
            child.kill().map_err(|source| TransferError::Kill {
                name: name.to_string(),
                source,
            })?;
            let _ = child.wait();
        }
        info!("Stopped transfer {} for {}", job.id, name);
        self.advance();
        Ok(())
    }

    fn status(&mut self) -> Result<Vec<TransferJobStatus>, TransferError> {
        self.advance();
        Ok(self
            .jobs
            .values()
            .map(|job| {
                let progress = job.progress.lock();
                let running = job.child.is_some();
                let active_files = match (&progress.current_file, running) {
                    (Some(path), true) => vec![(
                        path.clone(),
                        TransferState {
                            speed: progress.total.speed,
                            ..TransferState::default()
                        },
                    )],
                    _ => Vec::new(),
                };
                TransferJobStatus {
                    job_id: job.id,
                    kind: if job.is_dir { JobKind::Mirror } else { JobKind::Pget },
                    state: if running { JobState::Running } else { JobState::Queued },
                    name: job.name.clone(),
                    flags: String::new(),
                    total_transfer_state: running.then(|| progress.total.clone()),
                    active_file_transfer_states: active_files,
                }
            })
            .collect())
    }

    fn propagate_error(&mut self) -> anyhow::Result<()> {
        match self.pending_error.take() {
            Some(msg) => Err(anyhow::anyhow!("transfer manager failed: {}", msg)),
            None => Ok(()),
        }
    }
}

impl Drop for RsyncTransfer {
    fn drop(&mut self) {
        for job in self.jobs.values_mut() {
            if let Some(child) = job.child.as_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn output_patterns() -> &'static Option<(Regex, Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // `    123,456,789  45%   12.34MB/s    0:01:23 (xfr#3, to-chk=10/20)`
        let progress = Regex::new(
            r"^\s*([\d,]+)\s+(\d{1,3})%\s+([\d.,]+)([kMG]?B)/s\s+(?:(\d+):(\d{2}):(\d{2})|\S+)",
        )
        .ok()?;
        // `>f+++++++++ show/e01.mkv`
        let itemized = Regex::new(r"^>f\S{9}\s+(.+)$").ok()?;
        Some((progress, itemized))
    })
}

/// rsync redraws progress with `\r`, so split on both line endings.
fn read_progress(stdout: impl Read, root: &str, is_dir: bool, progress: &Mutex<Progress>) {
    for chunk in BufReader::new(stdout).split(b'\r') {
        let Ok(chunk) = chunk else {
            break;
        };
        for line in String::from_utf8_lossy(&chunk).lines() {
            apply_line(line, root, is_dir, progress);
        }
    }
}

fn apply_line(line: &str, root: &str, is_dir: bool, progress: &Mutex<Progress>) {
    if let Some(state) = parse_progress_line(line) {
        progress.lock().total = state;
    } else if let Some(path) = parse_itemized_path(line) {
        // Paths are reported from the source's parent; strip the root
        let below_root = if is_dir {
            path.strip_prefix(root)
                .and_then(|p| p.strip_prefix('/'))
                .map(str::to_string)
        } else {
            None
        };
        progress.lock().current_file = below_root;
    }
}

/// Parse a `--info=progress2` line into the job's aggregate state.
pub(crate) fn parse_progress_line(line: &str) -> Option<TransferState> {
    let (pattern, _) = output_patterns().as_ref()?;
    let caps = pattern.captures(line)?;

    let bytes = caps[1].replace(',', "").parse::<u64>().ok()?;
    let percent = caps[2].parse::<u8>().ok()?.min(100);
    let value: f64 = caps[3].replace(',', "").parse().ok()?;
    let unit = match &caps[4] {
        "GB" => 1_073_741_824.0,
        "MB" => 1_048_576.0,
        "kB" => 1024.0,
        _ => 1.0,
    };
    let eta = match (caps.get(5), caps.get(6), caps.get(7)) {
        (Some(h), Some(m), Some(s)) => {
            let field = |c: &str| c.parse::<u64>().ok();
            Some(field(h.as_str())? * 3600 + field(m.as_str())? * 60 + field(s.as_str())?)
        }
        _ => None,
    };

    let size_remote = (percent > 0).then(|| bytes * 100 / percent as u64);

    Some(TransferState {
        size_local: Some(bytes),
        size_remote,
        percent_local: Some(percent),
        speed: Some((value * unit) as u64),
        eta,
    })
}

/// Path of an itemized line for a received file
pub(crate) fn parse_itemized_path(line: &str) -> Option<&str> {
    let (_, pattern) = output_patterns().as_ref()?;
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
