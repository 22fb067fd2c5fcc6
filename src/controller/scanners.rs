use super::scanner::{build_tree, FlatEntry, ScanError, Scanner, SystemFile};
use super::ssh::{shell_quote, RemoteEndpoint};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// rsync's in-flight temp files: `.name.XXXXXX`, where the suffix comes
/// from mkstemp and so is not a plain lowercase word like `.notes.backup`.
fn is_transfer_temp(name: &str) -> bool {
    static TEMP: OnceLock<Option<Regex>> = OnceLock::new();
    TEMP.get_or_init(|| Regex::new(r"^\..+\.([A-Za-z0-9]{6})$").ok())
        .as_ref()
        .and_then(|re| re.captures(name))
        .and_then(|caps| caps.get(1))
        .map_or(false, |suffix| suffix.as_str().chars().any(|c| !c.is_ascii_lowercase()))
}

fn epoch_secs(time: io::Result<SystemTime>) -> Option<i64> {
    time.ok().map(|t| DateTime::<Utc>::from(t).timestamp())
}

/// Walk everything below `root` into flat entries, paths relative to `root`.
fn walk(root: &Path, prefix: &str) -> Result<Vec<FlatEntry>, ScanError> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_transfer_temp(&e.file_name().to_string_lossy()));

    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            // Entries can vanish between listing and stat
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                debug!("Entry vanished during scan: {}", e);
                continue;
            }
            Err(e) => return Err(ScanError::Recoverable(format!("walk {}: {}", root.display(), e))),
        };
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let path = if prefix.is_empty() {
            relative
        } else {
            format!("{}/{}", prefix, relative)
        };
        entries.push(FlatEntry {
            path,
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            timestamp_created: epoch_secs(metadata.created()),
            timestamp_modified: epoch_secs(metadata.modified()),
        });
    }
    Ok(entries)
}

/// Scans the whole local download directory
pub struct LocalScanner {
    local_path: PathBuf,
}

impl LocalScanner {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
        }
    }
}

impl Scanner for LocalScanner {
    fn scan(&mut self) -> Result<Vec<SystemFile>, ScanError> {
        if !self.local_path.is_dir() {
            return Err(ScanError::Fatal(format!(
                "local path {} does not exist",
                self.local_path.display()
            )));
        }
        Ok(build_tree(walk(&self.local_path, "")?))
    }
}

/// Names currently downloading or extracting, shared with the active scanner
#[derive(Debug, Clone, Default)]
pub struct ActiveFiles(Arc<Mutex<Vec<String>>>);

impl ActiveFiles {
    pub fn set(&self, names: Vec<String>) {
        *self.0.lock() = names;
    }

    pub fn get(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Scans only the active root-level names, so it can run often
pub struct ActiveScanner {
    local_path: PathBuf,
    active: ActiveFiles,
}

impl ActiveScanner {
    pub fn new(local_path: impl Into<PathBuf>, active: ActiveFiles) -> Self {
        Self {
            local_path: local_path.into(),
            active,
        }
    }
}

impl Scanner for ActiveScanner {
    fn scan(&mut self) -> Result<Vec<SystemFile>, ScanError> {
        let mut entries = Vec::new();
        for name in self.active.get() {
            let path = self.local_path.join(&name);
            let metadata = match std::fs::metadata(&path) {
                Ok(m) => m,
                // Not created yet
                Err(_) => continue,
            };
            entries.push(FlatEntry {
                path: name.clone(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                timestamp_created: epoch_secs(metadata.created()),
                timestamp_modified: epoch_secs(metadata.modified()),
            });
            if metadata.is_dir() {
                entries.extend(walk(&path, &name)?);
            }
        }
        Ok(build_tree(entries))
    }
}

/// Lists the remote directory with `find` over ssh
pub struct RemoteScanner {
    endpoint: RemoteEndpoint,
}

impl RemoteScanner {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self { endpoint }
    }

    fn listing_command(&self) -> String {
        let path = if self.endpoint.path.is_empty() {
            "/".to_string()
        } else {
            self.endpoint.path.clone()
        };
        format!(
            r"find {} -mindepth 1 -printf '%y\t%s\t%T@\t%P\n'",
            shell_quote(&path)
        )
    }
}

impl Scanner for RemoteScanner {
    fn scan(&mut self) -> Result<Vec<SystemFile>, ScanError> {
        let output = self
            .endpoint
            .command(&self.listing_command())
            .output()
            .map_err(|e| ScanError::Fatal(format!("failed to run ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Recoverable(format!(
                "remote listing failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(build_tree(parse_find_listing(&stdout)))
    }
}

/// Parse `%y\t%s\t%T@\t%P` lines. Anything but files and directories is skipped.
pub(crate) fn parse_find_listing(listing: &str) -> Vec<FlatEntry> {
    let mut entries = Vec::new();
    for line in listing.lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, '\t');
        let (Some(kind), Some(size), Some(mtime), Some(path)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            warn!("Unparseable remote listing line: {:?}", line);
            continue;
        };
        let is_dir = match kind {
            "d" => true,
            "f" => false,
            _ => continue,
        };
        let Ok(size) = size.parse::<u64>() else {
            warn!("Bad size in remote listing line: {:?}", line);
            continue;
        };
        let modified = mtime
            .split('.')
            .next()
            .and_then(|secs| secs.parse::<i64>().ok());
        entries.push(FlatEntry {
            path: path.to_string(),
            is_dir,
            size: if is_dir { 0 } else { size },
            timestamp_created: None,
            timestamp_modified: modified,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_temp_file_pattern() {
        assert!(is_transfer_temp(".movie.mkv.a1B2c3"));
        assert!(!is_transfer_temp("movie.mkv"));
        assert!(is_transfer_temp(".e01.mkv.x9y8z7"));
        assert!(!is_transfer_temp(".hidden"));
        assert!(!is_transfer_temp(".notes.backup"));
        assert!(!is_transfer_temp(".bashrc.config"));
    }

    #[test]
    fn test_local_scan_builds_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("movie.mkv"), vec![0u8; 10]).unwrap();
        fs::create_dir_all(dir.path().join("show/s01")).unwrap();
        fs::write(dir.path().join("show/s01/e01.mkv"), vec![0u8; 5]).unwrap();
        fs::write(dir.path().join("show/s01/.e02.mkv.Xy12ab"), vec![0u8; 3]).unwrap();
        fs::write(dir.path().join(".notes.backup"), vec![0u8; 1]).unwrap();

        let mut files = LocalScanner::new(dir.path()).scan().unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 3);
        assert_eq!(files[0].name, ".notes.backup");
        assert_eq!(files[1].name, "movie.mkv");
        assert_eq!(files[1].size, 10);
        assert!(files[1].timestamp_modified.is_some());
        assert_eq!(files[2].name, "show");
        assert_eq!(files[2].size, 5);
        assert_eq!(files[2].children[0].children.len(), 1);
    }

    #[test]
    fn test_local_scan_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut scanner = LocalScanner::new(dir.path().join("nope"));
        assert!(matches!(scanner.scan(), Err(ScanError::Fatal(_))));
    }

    #[test]
    fn test_active_scan_only_named_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 4]).unwrap();
        fs::write(dir.path().join("b.bin"), vec![0u8; 4]).unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/x"), vec![0u8; 2]).unwrap();

        let active = ActiveFiles::default();
        let mut scanner = ActiveScanner::new(dir.path(), active.clone());
        assert!(scanner.scan().unwrap().is_empty());

        active.set(vec!["a.bin".into(), "d".into(), "not-yet".into()]);
        let mut files = scanner.scan().unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.bin");
        assert_eq!(files[1].name, "d");
        assert_eq!(files[1].size, 2);
        assert_eq!(files[1].children[0].name, "x");
    }

    #[test]
    fn test_parse_find_listing() {
        let listing = "d\t4096\t1700000000.123\tshow\n\
                       f\t10\t1700000001.5\tshow/e01.mkv\n\
                       l\t7\t1700000002.0\tlink\n\
                       f\t3\t1700000003.0\tshow/.notes.backup\n\
                       garbage\n\
                       f\t99\t1700000004.0\tname with\ttab.bin\n";
        let entries = parse_find_listing(listing);
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["show", "show/e01.mkv", "show/.notes.backup", "name with\ttab.bin"]);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[1].timestamp_modified, Some(1_700_000_001));

        let tree = build_tree(entries);
        let show = tree.iter().find(|f| f.name == "show").unwrap();
        assert_eq!(show.size, 13);
    }

    #[test]
    fn test_listing_command_quotes_path() {
        let scanner = RemoteScanner::new(RemoteEndpoint {
            login: "u@h".into(),
            port: 22,
            path: "/srv/it's done".into(),
        });
        assert_eq!(
            scanner.listing_command(),
            r"find '/srv/it'\''s done' -mindepth 1 -printf '%y\t%s\t%T@\t%P\n'"
        );
    }
}
