use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// One entry of a scanned tree. Directory sizes are the sum of their
/// descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFile {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub timestamp_created: Option<i64>,
    pub timestamp_modified: Option<i64>,
    pub children: Vec<SystemFile>,
}

impl SystemFile {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            size,
            timestamp_created: None,
            timestamp_modified: None,
            children: Vec::new(),
        }
    }

    pub fn dir(name: impl Into<String>, children: Vec<SystemFile>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            size: children.iter().map(|c| c.size).sum(),
            timestamp_created: None,
            timestamp_modified: None,
            children,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub timestamp: DateTime<Utc>,
    pub failed: bool,
    pub error_message: Option<String>,
    pub files: Vec<SystemFile>,
}

impl ScanResult {
    pub fn ok(files: Vec<SystemFile>) -> Self {
        Self {
            timestamp: Utc::now(),
            failed: false,
            error_message: None,
            files,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            failed: true,
            error_message: Some(message.into()),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    /// Reported as a failed result; scanning continues
    #[error("{0}")]
    Recoverable(String),

    /// Stops the scanner and is raised to the controller
    #[error("{0}")]
    Fatal(String),
}

pub trait Scanner: Send {
    fn scan(&mut self) -> Result<Vec<SystemFile>, ScanError>;
}

/// A scanned path before it is placed in the tree
#[derive(Debug, Clone)]
pub(crate) struct FlatEntry {
    /// `/`-separated, relative to the scanned root
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub timestamp_created: Option<i64>,
    pub timestamp_modified: Option<i64>,
}

/// Assemble flat entries into trees of root-level files.
///
/// Entries whose parent is missing from the listing are dropped.
pub(crate) fn build_tree(mut entries: Vec<FlatEntry>) -> Vec<SystemFile> {
    // A parent's path is a prefix of its children's, so it sorts first
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut index: HashMap<String, usize> = HashMap::with_capacity(entries.len());
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    let mut roots = Vec::new();
    let mut kept = vec![true; entries.len()];

    for (i, entry) in entries.iter().enumerate() {
        match entry.path.rsplit_once('/') {
            Some((parent, _)) => match index.get(parent) {
                Some(&p) => children[p].push(i),
                None => {
                    debug!("Dropping orphan scan entry {}", entry.path);
                    kept[i] = false;
                    continue;
                }
            },
            None => roots.push(i),
        }
        index.insert(entry.path.clone(), i);
    }

    // Children always have larger indices, so build from the back
    let mut built: Vec<Option<SystemFile>> = vec![None; entries.len()];
    for i in (0..entries.len()).rev() {
        if !kept[i] {
            continue;
        }
        let entry = &entries[i];
        let name = entry
            .path
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&entry.path)
            .to_string();
        let kids: Vec<SystemFile> = children[i].iter().filter_map(|&c| built[c].take()).collect();
        let size = if entry.is_dir {
            kids.iter().map(|c| c.size).sum()
        } else {
            entry.size
        };
        built[i] = Some(SystemFile {
            name,
            is_dir: entry.is_dir,
            size,
            timestamp_created: entry.timestamp_created,
            timestamp_modified: entry.timestamp_modified,
            children: kids,
        });
    }

    roots.into_iter().filter_map(|r| built[r].take()).collect()
}

/// Runs one scanner on its own thread at a fixed interval.
///
/// Only the newest unconsumed result is kept.
pub struct ScannerProcess {
    name: &'static str,
    latest: Arc<Mutex<Option<ScanResult>>>,
    error: Arc<Mutex<Option<String>>>,
    force_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScannerProcess {
    pub fn start(
        name: &'static str,
        mut scanner: Box<dyn Scanner>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let latest = Arc::new(Mutex::new(None));
        let error = Arc::new(Mutex::new(None));
        let (force_tx, force_rx) = bounded::<()>(1);

        let handle = {
            let latest = latest.clone();
            let error = error.clone();
            std::thread::Builder::new()
                .name(format!("{}-scanner", name))
                .spawn(move || {
                    info!("{} scanner started, interval {:?}", name, interval);
                    loop {
                        let started = Instant::now();
                        let result = match scanner.scan() {
                            Ok(files) => ScanResult::ok(files),
                            Err(ScanError::Recoverable(msg)) => {
                                warn!("{} scan failed: {}", name, msg);
                                ScanResult::failed(msg)
                            }
                            Err(ScanError::Fatal(msg)) => {
                                error!("{} scanner stopped: {}", name, msg);
                                *error.lock() = Some(msg);
                                break;
                            }
                        };
                        debug!("{} scan finished in {:?}", name, started.elapsed());
                        *latest.lock() = Some(result);

                        let wait = interval.saturating_sub(started.elapsed());
                        match force_rx.recv_timeout(wait) {
                            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    debug!("{} scanner exiting", name);
                })?
        };

        Ok(Self {
            name,
            latest,
            error,
            force_tx: Some(force_tx),
            handle: Some(handle),
        })
    }

    pub fn pop_latest_result(&self) -> Option<ScanResult> {
        self.latest.lock().take()
    }

    /// Skip the rest of the current wait. A pending request absorbs repeats.
    pub fn force_scan(&self) {
        if let Some(tx) = &self.force_tx {
            let _ = tx.try_send(());
        }
    }

    pub fn propagate_error(&self) -> anyhow::Result<()> {
        match self.error.lock().as_ref() {
            Some(msg) => Err(anyhow::anyhow!("{} scanner failed: {}", self.name, msg)),
            None => Ok(()),
        }
    }

    /// Stop after the scan in progress, if any.
    pub fn stop(&mut self) {
        self.force_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} scanner thread panicked", self.name);
            }
        }
    }
}

impl Drop for ScannerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
pub struct ScanResults {
    pub remote: Option<ScanResult>,
    pub local: Option<ScanResult>,
    pub active: Option<ScanResult>,
}

/// What the controller needs from the scanning side
pub trait ScanSource: Send {
    fn pop_latest_results(&mut self) -> ScanResults;

    /// Names the active scanner should watch
    fn update_active_files(&mut self, names: Vec<String>);

    fn force_local_scan(&self);

    fn force_remote_scan(&self);

    fn propagate_error(&self) -> anyhow::Result<()>;
}

/// Owns the remote, local and active scanner threads
pub struct ScanManager {
    remote: ScannerProcess,
    local: ScannerProcess,
    active: ScannerProcess,
    active_files: super::scanners::ActiveFiles,
}

impl ScanManager {
    pub fn new(
        remote: ScannerProcess,
        local: ScannerProcess,
        active: ScannerProcess,
        active_files: super::scanners::ActiveFiles,
    ) -> Self {
        Self {
            remote,
            local,
            active,
            active_files,
        }
    }

    pub fn stop(&mut self) {
        self.active.stop();
        self.local.stop();
        self.remote.stop();
    }
}

impl ScanSource for ScanManager {
    fn pop_latest_results(&mut self) -> ScanResults {
        ScanResults {
            remote: self.remote.pop_latest_result(),
            local: self.local.pop_latest_result(),
            active: self.active.pop_latest_result(),
        }
    }

    fn update_active_files(&mut self, names: Vec<String>) {
        self.active_files.set(names);
    }

    fn force_local_scan(&self) {
        self.local.force_scan();
    }

    fn force_remote_scan(&self) {
        self.remote.force_scan();
    }

    fn propagate_error(&self) -> anyhow::Result<()> {
        self.active.propagate_error()?;
        self.local.propagate_error()?;
        self.remote.propagate_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(path: &str, is_dir: bool, size: u64) -> FlatEntry {
        FlatEntry {
            path: path.to_string(),
            is_dir,
            size,
            timestamp_created: None,
            timestamp_modified: Some(7),
        }
    }

    #[test]
    fn test_build_tree_sums_directories() {
        let tree = build_tree(vec![
            entry("show/s01/e02.mkv", false, 20),
            entry("show", true, 4096),
            entry("show/s01", true, 4096),
            entry("show/s01/e01.mkv", false, 10),
            entry("show/notes.txt", false, 1),
            entry("movie.mkv", false, 100),
        ]);

        assert_eq!(tree.len(), 2);
        let movie = tree.iter().find(|f| f.name == "movie.mkv").unwrap();
        assert_eq!(movie.size, 100);
        assert_eq!(movie.timestamp_modified, Some(7));

        let show = tree.iter().find(|f| f.name == "show").unwrap();
        assert!(show.is_dir);
        assert_eq!(show.size, 31);
        let season = show.children.iter().find(|f| f.name == "s01").unwrap();
        assert_eq!(season.size, 30);
        let names: Vec<&str> = season.children.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["e01.mkv", "e02.mkv"]);
    }

    #[test]
    fn test_build_tree_drops_orphans() {
        let tree = build_tree(vec![entry("missing/child", false, 1), entry("a", false, 1)]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].name, "a");
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail_on: usize,
    }

    impl Scanner for Counting {
        fn scan(&mut self) -> Result<Vec<SystemFile>, ScanError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(ScanError::Fatal("disk vanished".into()));
            }
            if n % 2 == 0 {
                return Err(ScanError::Recoverable("timeout".into()));
            }
            Ok(vec![SystemFile::file(format!("f{}", n), n as u64)])
        }
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..500 {
            if let Some(v) = f() {
                return v;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for scanner");
    }

    #[test]
    fn test_process_publishes_latest_and_forces() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut process = ScannerProcess::start(
            "test",
            Box::new(Counting {
                calls: calls.clone(),
                fail_on: usize::MAX,
            }),
            Duration::from_secs(3600),
        )
        .unwrap();

        let first = wait_for(|| process.pop_latest_result());
        assert!(!first.failed);
        assert_eq!(first.files[0].name, "f1");
        assert!(process.pop_latest_result().is_none());

        process.force_scan();
        let second = wait_for(|| process.pop_latest_result());
        assert!(second.failed);
        assert_eq!(second.error_message.as_deref(), Some("timeout"));
        assert!(process.propagate_error().is_ok());

        process.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fatal_error_is_kept() {
        let process = ScannerProcess::start(
            "doomed",
            Box::new(Counting {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_on: 1,
            }),
            Duration::from_millis(5),
        )
        .unwrap();

        wait_for(|| process.propagate_error().err());
        assert!(process.pop_latest_result().is_none());
    }
}
