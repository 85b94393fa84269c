//! Polling watcher: a scanner task detects changed memory files and hands
//! them over a channel to an indexer task that applies them to the store.

use crate::config::WatcherConfig;
use crate::error::MemoryError;
use crate::persist::{self, WatcherState};
use crate::scan::{self, ChangeKind, ChangeSet};
use crate::store::{IndexStore, UpdateSummary};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherPhase {
    Idle,
    Scanning,
    Updating,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherStatus {
    pub scanning: bool,
    pub updating: bool,
    pub scans: u64,
    /// Change sets applied successfully.
    pub applied: u64,
    pub last_error: Option<String>,
}

impl WatcherStatus {
    pub fn phase(&self) -> WatcherPhase {
        if self.updating {
            WatcherPhase::Updating
        } else if self.scanning {
            WatcherPhase::Scanning
        } else {
            WatcherPhase::Idle
        }
    }
}

pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    trigger: Arc<Notify>,
    status: watch::Receiver<WatcherStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Ask for a scan now. A request made while a scan runs is served right after it.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn phase(&self) -> WatcherPhase {
        self.status.borrow().phase()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatcherStatus> {
        self.status.clone()
    }

    /// Stop both tasks and wait for them. An update already handed to the
    /// blocking pool finishes and publishes atomically.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "watcher task ended abnormally");
            }
        }
    }
}

/// Start watching the store's memory directory. Must run inside a tokio runtime.
pub fn spawn_watcher(store: Arc<IndexStore>, config: &WatcherConfig) -> WatcherHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = Arc::new(Notify::new());
    let (status_tx, status_rx) = watch::channel(WatcherStatus::default());
    let status_tx = Arc::new(status_tx);
    // One pending change set; the scanner waits while the indexer is busy.
    let (tx, rx) = mpsc::channel::<ChangeSet>(1);

    // The published snapshot is the baseline; a saved state may describe an
    // index that has since been lost or replaced.
    let last_check = persist::load_watcher_state(store.paths()).map(|s| s.last_check).unwrap_or(0);
    let initial = WatcherState { last_check, files: store.snapshot().file_stamps() };
    let state = Arc::new(Mutex::new(initial));
    let interval = Duration::from_secs(config.interval_secs.max(1));

    let scanner = tokio::spawn(scan_loop(
        store.clone(),
        state.clone(),
        tx,
        trigger.clone(),
        status_tx.clone(),
        shutdown_rx.clone(),
        interval,
    ));
    let indexer = tokio::spawn(index_loop(store, state, rx, trigger.clone(), status_tx, shutdown_rx));
    info!(interval_secs = interval.as_secs(), "memory watcher started");

    WatcherHandle { shutdown: shutdown_tx, trigger, status: status_rx, tasks: vec![scanner, indexer] }
}

async fn scan_loop(
    store: Arc<IndexStore>,
    state: Arc<Mutex<WatcherState>>,
    tx: mpsc::Sender<ChangeSet>,
    trigger: Arc<Notify>,
    status: Arc<watch::Sender<WatcherStatus>>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
        }

        status.send_modify(|s| s.scanning = true);
        let known = state.lock().files.clone();
        let layout = store.layout().clone();
        let verify = store.verify_hash();
        let scanned = tokio::task::spawn_blocking(move || scan::detect_changes(&layout, &known, verify)).await;
        status.send_modify(|s| {
            s.scanning = false;
            s.scans += 1;
        });

        let changes = match scanned {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "memory scan panicked");
                continue;
            }
        };
        state.lock().last_check = OffsetDateTime::now_utc().unix_timestamp() * 1000;
        if changes.is_empty() {
            continue;
        }
        debug!(changes = changes.changes.len(), "memory files changed");
        tokio::select! {
            _ = stop.changed() => break,
            sent = tx.send(changes) => if sent.is_err() { break },
        }
    }
    debug!("watcher scan loop exiting");
}

async fn index_loop(
    store: Arc<IndexStore>,
    state: Arc<Mutex<WatcherState>>,
    mut rx: mpsc::Receiver<ChangeSet>,
    trigger: Arc<Notify>,
    status: Arc<watch::Sender<WatcherStatus>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let changes = tokio::select! {
            _ = stop.changed() => break,
            msg = rx.recv() => match msg {
                Some(changes) => changes,
                None => break,
            },
        };

        status.send_modify(|s| s.updating = true);
        let worker = store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let summary = worker.apply_changes(&changes);
            (summary, changes)
        })
        .await;

        let (applied, error) = match result {
            Ok((Ok(summary), changes)) => {
                advance_state(&store, &state, &changes, &summary);
                (true, None)
            }
            Ok((Err(MemoryError::ConcurrentUpdateConflict { retry_after }), _)) => {
                info!(retry_after_ms = retry_after.as_millis() as u64, "index busy, deferring watcher update");
                let trigger = trigger.clone();
                let mut stop = stop.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = tokio::time::sleep(retry_after) => trigger.notify_one(),
                    }
                });
                (false, None)
            }
            Ok((Err(e), _)) => {
                warn!(error = %e, "watcher update failed");
                (false, Some(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "watcher update panicked");
                (false, Some(e.to_string()))
            }
        };
        status.send_modify(|s| {
            s.updating = false;
            if applied {
                s.applied += 1;
                s.last_error = None;
            } else if error.is_some() {
                s.last_error = error;
            }
        });
    }
    debug!("watcher index loop exiting");
}

/// Record the stamps of everything that was applied, and persist them.
fn advance_state(store: &IndexStore, state: &Mutex<WatcherState>, changes: &ChangeSet, summary: &UpdateSummary) {
    let snapshot = {
        let mut state = state.lock();
        for change in &changes.changes {
            if summary.skipped.contains(&change.key) {
                continue;
            }
            match (&change.kind, &change.stamp) {
                (ChangeKind::Removed, _) => {
                    state.files.remove(&change.key);
                }
                (_, Some(stamp)) => {
                    state.files.insert(change.key.clone(), stamp.clone());
                }
                (_, None) => {}
            }
        }
        state.clone()
    };
    if let Err(e) = persist::save_watcher_state(store.paths(), &snapshot) {
        warn!(error = %e, "failed to persist watcher state");
    }
    if !summary.is_noop() {
        info!(
            added = summary.files_added,
            changed = summary.files_changed,
            removed = summary.files_removed,
            "watcher applied memory changes"
        );
    }
}
