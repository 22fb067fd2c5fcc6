use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

/// Told which property of a component changed
pub trait StatusComponentListener: Send + Sync {
    fn notify(&self, name: &str);
}

/// Told that something, anywhere in the status, changed
pub trait StatusListener: Send + Sync {
    fn notify(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub up: bool,
    pub error_msg: Option<String>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            up: true,
            error_msg: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub latest_local_scan_time: Option<DateTime<Utc>>,
    pub latest_remote_scan_time: Option<DateTime<Utc>>,
    pub latest_remote_scan_failed: Option<bool>,
    pub latest_remote_scan_error: Option<String>,
}

type StatusListeners = Arc<Mutex<Vec<Arc<dyn StatusListener>>>>;

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// One independently-observable section of the status
pub struct StatusComponent<T> {
    value: RwLock<T>,
    listeners: Mutex<Vec<Arc<dyn StatusComponentListener>>>,
    status_listeners: StatusListeners,
}

impl<T: Clone> StatusComponent<T> {
    fn new(value: T, status_listeners: StatusListeners) -> Self {
        Self {
            value: RwLock::new(value),
            listeners: Mutex::new(Vec::new()),
            status_listeners,
        }
    }

    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Change one property and notify listeners of `name`.
    ///
    /// Listeners are copied under the lock and called after it is released,
    /// so a listener may read the status or register others.
    pub fn set(&self, name: &str, update: impl FnOnce(&mut T)) {
        {
            let mut value = self.value.write();
            update(&mut *value);
        }

        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.notify(name);
        }
        let status_listeners = self.status_listeners.lock().clone();
        for listener in &status_listeners {
            listener.notify();
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusComponentListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StatusComponentListener>) {
        self.listeners.lock().retain(|l| !same_listener(l, listener));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub server: ServerStatus,
    pub controller: ControllerStatus,
}

/// Shared status context; constructed once and passed to whoever reports
/// or observes.
pub struct Status {
    pub server: StatusComponent<ServerStatus>,
    pub controller: StatusComponent<ControllerStatus>,
    listeners: StatusListeners,
}

impl Status {
    pub fn new() -> Self {
        let listeners: StatusListeners = Arc::new(Mutex::new(Vec::new()));
        Self {
            server: StatusComponent::new(ServerStatus::default(), listeners.clone()),
            controller: StatusComponent::new(ControllerStatus::default(), listeners.clone()),
            listeners,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StatusListener>) {
        self.listeners.lock().retain(|l| !same_listener(l, listener));
    }

    /// Deep copy of every component's values
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            server: self.server.get(),
            controller: self.controller.get(),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Names(Mutex<Vec<String>>);

    impl StatusComponentListener for Names {
        fn notify(&self, name: &str) {
            self.0.lock().push(name.to_string());
        }
    }

    #[derive(Default)]
    struct Count(AtomicUsize);

    impl StatusListener for Count {
        fn notify(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_component_and_status_listeners() {
        let status = Status::new();
        let names = Arc::new(Names::default());
        let count = Arc::new(Count::default());
        status.controller.add_listener(names.clone());
        status.add_listener(count.clone());

        status
            .controller
            .set("latest_remote_scan_failed", |c| c.latest_remote_scan_failed = Some(true));
        status.server.set("up", |s| s.up = false);

        assert_eq!(*names.0.lock(), vec!["latest_remote_scan_failed".to_string()]);
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_listener_registered_once() {
        let status = Status::new();
        let names: Arc<dyn StatusComponentListener> = Arc::new(Names::default());
        status.server.add_listener(names.clone());
        status.server.add_listener(names.clone());
        status.server.set("error_msg", |s| s.error_msg = Some("x".into()));

        status.server.remove_listener(&names);
        status.server.set("up", |s| s.up = true);
        assert_eq!(status.server.listeners.lock().len(), 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let status = Status::new();
        let before = status.snapshot();
        status.controller.set("latest_remote_scan_error", |c| {
            c.latest_remote_scan_error = Some("timeout".into())
        });
        assert_eq!(before.controller.latest_remote_scan_error, None);
        assert_eq!(
            status.snapshot().controller.latest_remote_scan_error.as_deref(),
            Some("timeout")
        );
        assert!(status.snapshot().server.up);
    }
}
