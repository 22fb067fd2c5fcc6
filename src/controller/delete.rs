use super::ssh::{shell_quote, RemoteEndpoint};
use std::io;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::info;

/// Which scan to force once an operation is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    Local,
    Remote,
}

/// A one-shot background operation started by a command
pub struct DeleteOperation {
    pub name: String,
    pub rescan: ScanTarget,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl DeleteOperation {
    pub fn spawn<F>(name: impl Into<String>, rescan: ScanTarget, work: F) -> io::Result<Self>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let handle = std::thread::Builder::new()
            .name(format!("delete-{:?}", rescan).to_lowercase())
            .spawn(work)?;
        Ok(Self {
            name,
            rescan,
            handle,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Outcome of the work. A panic inside it is reported as an error too.
    pub fn join(self) -> anyhow::Result<()> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("delete of '{}' panicked", self.name)),
        }
    }
}

pub trait FileDeleter: Send {
    fn delete_local(&self, name: &str) -> io::Result<DeleteOperation>;
    fn delete_remote(&self, name: &str) -> io::Result<DeleteOperation>;
}

/// Deletes from the local directory, and from the remote over ssh
pub struct Deleter {
    local_path: PathBuf,
    endpoint: RemoteEndpoint,
}

impl Deleter {
    pub fn new(local_path: impl Into<PathBuf>, endpoint: RemoteEndpoint) -> Self {
        Self {
            local_path: local_path.into(),
            endpoint,
        }
    }
}

impl FileDeleter for Deleter {
    fn delete_local(&self, name: &str) -> io::Result<DeleteOperation> {
        let path = self.local_path.join(name);
        DeleteOperation::spawn(name, ScanTarget::Local, move || {
            let metadata = std::fs::symlink_metadata(&path)?;
            if metadata.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            info!("Deleted local {}", path.display());
            Ok(())
        })
    }

    fn delete_remote(&self, name: &str) -> io::Result<DeleteOperation> {
        let remote_path = self.endpoint.file_path(name);
        let mut cmd = self
            .endpoint
            .command(&format!("rm -rf -- {}", shell_quote(&remote_path)));
        DeleteOperation::spawn(name, ScanTarget::Remote, move || {
            let output = cmd.output()?;
            if !output.status.success() {
                anyhow::bail!(
                    "remote delete of {} failed ({}): {}",
                    remote_path,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            info!("Deleted remote {}", remote_path);
            Ok(())
        })
    }
}
