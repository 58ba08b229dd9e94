//! File-backed resource config with mtime-polling hot reload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::BudgetConfig;
use crate::error::Result;
use crate::providers::{ResourceConfig, SubscriptionId, Subscribers};
use crate::quota::EventSink;

/// [`ResourceConfig`] backed by the config file.
///
/// Holds the last accepted value. A successful reload stores the new value
/// and sends a configuration-change notification to every subscriber.
#[derive(Debug)]
pub struct FileResourceConfig {
    path: PathBuf,
    default_quota: AtomicU64,
    subscribers: Subscribers,
}

impl FileResourceConfig {
    pub fn new(path: impl Into<PathBuf>, initial: &BudgetConfig) -> Self {
        Self {
            path: path.into(),
            default_quota: AtomicU64::new(initial.resources.default_daily_quota_bytes),
            subscribers: Subscribers::new(),
        }
    }

    /// Load `path` (or defaults when missing) and wrap it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = BudgetConfig::load_or_default(&path)?;
        Ok(Self::new(path, &config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file. On error the running value is kept.
    pub fn reload(&self) -> Result<()> {
        let mut config = BudgetConfig::load_from_path(&self.path)?;
        config.apply_env_overrides();
        self.apply(&config);
        Ok(())
    }

    /// Adopt `config` and notify subscribers.
    pub fn apply(&self, config: &BudgetConfig) {
        let bytes = config.resources.default_daily_quota_bytes;
        let previous = self.default_quota.swap(bytes, Ordering::SeqCst);
        info!(
            path = %self.path.display(),
            previous,
            default_daily_quota_bytes = bytes,
            "Resource config reloaded"
        );
        for sink in self.subscribers.sinks() {
            sink.config_changed();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl ResourceConfig for FileResourceConfig {
    fn default_quota_bytes(&self) -> u64 {
        self.default_quota.load(Ordering::SeqCst)
    }

    fn subscribe(&self, sink: EventSink) -> SubscriptionId {
        self.subscribers.add(sink)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}

/// Polling-based config watcher.
pub struct ConfigWatcher {
    poll_interval: Duration,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            last_mtime: None,
        }
    }

    /// Run [`watch`](Self::watch) on a new task.
    pub fn spawn(
        self,
        target: Arc<FileResourceConfig>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.watch(target, shutdown_rx))
    }

    /// Poll `target`'s file until `shutdown_rx` turns `true`, reloading on
    /// every mtime change.
    pub async fn watch(
        mut self,
        target: Arc<FileResourceConfig>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.last_mtime = read_mtime(target.path());
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Config watcher shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if *shutdown_rx.borrow() {
                return;
            }

            let current = read_mtime(target.path());
            let changed = match (self.last_mtime, current) {
                (Some(prev), Some(next)) => next != prev,
                (None, Some(_)) => true,
                _ => false,
            };
            if !changed {
                continue;
            }

            self.last_mtime = current;
            debug!(path = %target.path().display(), "Config file changed, reloading");
            if let Err(err) = target.reload() {
                warn!(
                    path = %target.path().display(),
                    error = %err,
                    "Config reload rejected; keeping running configuration"
                );
            }
        }
    }
}

fn read_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::events::{Command, TrackerEvent};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn write_quota(path: &Path, bytes: u64) {
        std::fs::write(
            path,
            format!(r#"{{"resources":{{"default_daily_quota_bytes":{bytes}}}}}"#),
        )
        .unwrap();
    }

    #[test]
    fn test_reload_notifies_subscribers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        write_quota(&path, 10_000_000);

        let resources = FileResourceConfig::load(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resources.subscribe(EventSink::new(tx));

        write_quota(&path, 16_000_000);
        resources.reload().unwrap();

        assert_eq!(resources.default_quota_bytes(), 16_000_000);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Command::Event(TrackerEvent::ConfigChanged)
        ));
    }

    #[test]
    fn test_invalid_reload_keeps_running_value() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        write_quota(&path, 10_000_000);

        let resources = FileResourceConfig::load(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resources.subscribe(EventSink::new(tx));

        write_quota(&path, 0);
        assert!(resources.reload().is_err());
        assert_eq!(resources.default_quota_bytes(), 10_000_000);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let resources = FileResourceConfig::new("unused.json", &BudgetConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = resources.subscribe(EventSink::new(tx));
        resources.unsubscribe(id);
        assert_eq!(resources.subscriber_count(), 0);

        resources.apply(&BudgetConfig::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watcher_reloads_on_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        write_quota(&path, 10_000_000);

        let resources = Arc::new(FileResourceConfig::load(&path).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        resources.subscribe(EventSink::new(tx));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            ConfigWatcher::new(Duration::from_millis(25)).spawn(resources.clone(), shutdown_rx);

        // Coarse filesystem mtime granularity.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        write_quota(&path, 16_000_000);

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Command::Event(TrackerEvent::ConfigChanged)));
        assert_eq!(resources.default_quota_bytes(), 16_000_000);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }
}
