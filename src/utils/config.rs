use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("remote_address is required")]
    MissingRemote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory downloads land in
    pub local_path: PathBuf,

    /// Remote host, reached over ssh
    pub remote_address: String,

    pub remote_username: String,

    pub remote_port: u16,

    /// Directory on the remote host whose entries are mirrored
    pub remote_path: String,

    /// Where archives are extracted to, unless `use_local_path_as_extract_path`
    pub extract_path: PathBuf,

    pub use_local_path_as_extract_path: bool,

    /// Extractor program, invoked as `<cmd> x -y -o<out dir> <archive>`
    pub extract_command: String,

    /// Jobs beyond this are reported as queued
    pub num_max_parallel_downloads: usize,

    pub interval_ms_remote_scan: u64,

    pub interval_ms_local_scan: u64,

    pub interval_ms_downloading_scan: u64,

    /// Reconciliation tick interval
    pub tick_interval_ms: u64,

    /// Capacity of each tracking set
    pub max_tracked_files: usize,

    pub model_cache_ttl_secs: u64,

    pub database_url: String,

    pub persist_interval_secs: u64,

    pub memory_log_interval_secs: u64,

    /// Per-listener event buffer
    pub event_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/home"));
        let local_path = home.join("downloads");

        Self {
            extract_path: local_path.clone(),
            local_path,
            remote_address: String::new(),
            remote_username: whoami_fallback(),
            remote_port: 22,
            remote_path: "/".to_string(),
            use_local_path_as_extract_path: true,
            extract_command: "7z".to_string(),
            num_max_parallel_downloads: 2,
            interval_ms_remote_scan: 30_000,
            interval_ms_local_scan: 10_000,
            interval_ms_downloading_scan: 1_000,
            tick_interval_ms: 500,
            max_tracked_files: crate::utils::bounded_set::DEFAULT_MAX_LEN,
            model_cache_ttl_secs: 30 * 60,
            database_url: "sqlite://mirror_sync.db?mode=rwc".to_string(),
            persist_interval_secs: 30,
            memory_log_interval_secs: 300,
            event_queue_size: crate::utils::event_queue::DEFAULT_QUEUE_SIZE,
        }
    }
}

fn whoami_fallback() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

impl Config {
    /// Load config: defaults, then the optional config file, then environment.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = std::env::var("MIRROR_SYNC_CONFIG").unwrap_or_else(|_| "mirror-sync".to_string());

        let loaded: Config = ::config::Config::builder()
            .add_source(::config::File::with_name(&file).required(false))
            .add_source(::config::Environment::with_prefix("MIRROR_SYNC").try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("num_max_parallel_downloads", self.num_max_parallel_downloads as u64),
            ("interval_ms_remote_scan", self.interval_ms_remote_scan),
            ("interval_ms_local_scan", self.interval_ms_local_scan),
            ("interval_ms_downloading_scan", self.interval_ms_downloading_scan),
            ("tick_interval_ms", self.tick_interval_ms),
            ("max_tracked_files", self.max_tracked_files as u64),
            ("model_cache_ttl_secs", self.model_cache_ttl_secs),
            ("persist_interval_secs", self.persist_interval_secs),
            ("event_queue_size", self.event_queue_size as u64),
            ("memory_log_interval_secs", self.memory_log_interval_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::NotPositive { field });
        }
        if self.remote_address.trim().is_empty() {
            return Err(ConfigError::MissingRemote);
        }
        Ok(())
    }

    pub fn extract_out_dir(&self) -> PathBuf {
        if self.use_local_path_as_extract_path {
            self.local_path.clone()
        } else {
            self.extract_path.clone()
        }
    }

    /// `user@host`, as passed to ssh and rsync
    pub fn remote_login(&self) -> String {
        format!("{}@{}", self.remote_username, self.remote_address)
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
