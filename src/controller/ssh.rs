use crate::utils::config::Config;
use std::process::Command;

/// Where and how to reach the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub login: String,
    pub port: u16,
    pub path: String,
}

impl RemoteEndpoint {
    pub fn from_config(config: &Config) -> Self {
        Self {
            login: config.remote_login(),
            port: config.remote_port,
            path: config.remote_path.trim_end_matches('/').to_string(),
        }
    }

    /// Path of a root-level entry on the remote side
    pub fn file_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.path, name)
        }
    }

    /// `ssh` invocation that runs `remote_command` through the remote shell.
    /// Never prompts; key-based auth only.
    pub fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=15"])
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.login)
            .arg(remote_command);
        cmd
    }

    /// Value for rsync's `-e`
    pub fn rsync_shell(&self) -> String {
        format!("ssh -o BatchMode=yes -p {}", self.port)
    }
}

/// Quote for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
