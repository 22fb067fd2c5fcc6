use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(300);
const MAX_HISTORY: usize = 100;

type SizeFn = Box<dyn Fn() -> usize + Send>;

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub timestamp: DateTime<Utc>,
    pub process_memory_mb: f64,
    pub sources: BTreeMap<String, usize>,
}

/// Periodically logs process memory and the sizes of structures that
/// could grow without bound.
pub struct MemoryMonitor {
    interval: Duration,
    last_log: Option<Instant>,
    sources: Vec<(String, SizeFn)>,
    history: VecDeque<MemoryStats>,
    system: System,
    pid: Option<Pid>,
}

impl MemoryMonitor {
    pub fn new(interval: Duration) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Process memory unavailable: {}", e);
                None
            }
        };
        Self {
            interval,
            last_log: None,
            sources: Vec::new(),
            history: VecDeque::with_capacity(MAX_HISTORY),
            system: System::new(),
            pid,
        }
    }

    pub fn register_data_source(&mut self, name: impl Into<String>, size: impl Fn() -> usize + Send + 'static) {
        self.sources.push((name.into(), Box::new(size)));
    }

    fn process_memory_mb(&mut self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        if !self.system.refresh_process(pid) {
            return 0.0;
        }
        self.system
            .process(pid)
            .map(|p| p.memory() as f64 / 1_048_576.0)
            .unwrap_or(0.0)
    }

    pub fn collect_stats(&mut self) -> MemoryStats {
        let sources = self
            .sources
            .iter()
            .map(|(name, size)| (name.clone(), size()))
            .collect();
        let stats = MemoryStats {
            timestamp: Utc::now(),
            process_memory_mb: self.process_memory_mb(),
            sources,
        };
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(stats.clone());
        stats
    }

    /// Returns true if a sample was taken and logged.
    pub fn log_stats_if_due(&mut self) -> bool {
        if let Some(last) = self.last_log {
            if last.elapsed() < self.interval {
                return false;
            }
        }
        self.last_log = Some(Instant::now());
        let stats = self.collect_stats();

        let sizes: Vec<String> = stats
            .sources
            .iter()
            .map(|(name, size)| format!("{}={}", name, size))
            .collect();
        info!(
            "Memory stats: process={:.1}MB, {}",
            stats.process_memory_mb,
            sizes.join(", ")
        );

        for name in stats.sources.keys() {
            if let Some(growth) = self.growth_trend(name, 10) {
                if growth > 0.0 {
                    debug!("{} grew by {:.1} per sample over the last 10 samples", name, growth);
                }
            }
        }
        true
    }

    pub fn force_log_stats(&mut self) {
        self.last_log = None;
        self.log_stats_if_due();
    }

    pub fn history(&self) -> impl Iterator<Item = &MemoryStats> {
        self.history.iter()
    }

    pub fn latest(&self) -> Option<&MemoryStats> {
        self.history.back()
    }

    /// Average change per sample of a source (or `process_memory`) over the
    /// last `window` samples; `None` without enough data.
    pub fn growth_trend(&self, source: &str, window: usize) -> Option<f64> {
        if window < 2 || self.history.len() < window {
            return None;
        }
        let values: Vec<f64> = self
            .history
            .iter()
            .skip(self.history.len() - window)
            .map(|s| {
                if source == "process_memory" {
                    Some(s.process_memory_mb)
                } else {
                    s.sources.get(source).map(|&v| v as f64)
                }
            })
            .collect::<Option<_>>()?;
        let total: f64 = values.windows(2).map(|w| w[1] - w[0]).sum();
        Some(total / (values.len() - 1) as f64)
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_interval_gates_logging() {
        let mut monitor = MemoryMonitor::new(Duration::from_secs(3600));
        assert!(monitor.log_stats_if_due());
        assert!(!monitor.log_stats_if_due());
        monitor.force_log_stats();
        assert_eq!(monitor.history().count(), 2);
    }

    #[test]
    fn test_growth_trend() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut monitor = MemoryMonitor::new(Duration::ZERO);
        {
            let counter = counter.clone();
            monitor.register_data_source("downloaded", move || counter.load(Ordering::SeqCst));
        }

        for i in 0..10 {
            counter.store(i * 3, Ordering::SeqCst);
            monitor.collect_stats();
        }
        assert_eq!(monitor.growth_trend("downloaded", 10), Some(3.0));
        assert_eq!(monitor.growth_trend("downloaded", 11), None);
        assert_eq!(monitor.growth_trend("unknown", 5), None);
        assert_eq!(monitor.latest().unwrap().sources["downloaded"], 27);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut monitor = MemoryMonitor::new(Duration::ZERO);
        for _ in 0..(MAX_HISTORY + 5) {
            monitor.collect_stats();
        }
        assert_eq!(monitor.history().count(), MAX_HISTORY);
    }
}
