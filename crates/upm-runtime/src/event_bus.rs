//! In-process fan-out of domain events.
//!
//! Delivery is at-least-once. `publish` never blocks: each live subscriber
//! owns an unbounded queue, so a slow subscriber lags but does not lose
//! events. Redelivery can happen (a producer retrying a publish, or a journal
//! being replayed), so [`EventSubscription::recv`] drops any event whose id it
//! has already seen within a bounded window.

use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use upm_core::UpmEvent;
use uuid::Uuid;

/// Event ids remembered per subscriber for deduplication.
pub const DEFAULT_DEDUPE_WINDOW: usize = 4096;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<UpmEvent>>>>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live subscriber. Closed subscribers are pruned.
    pub fn publish(&self, event: UpmEvent) {
        debug!(
            event = event.name(),
            event_id = %event.id,
            trainer = %event.trainer_id,
            "Publishing event"
        );
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with_window(DEFAULT_DEDUPE_WINDOW)
    }

    pub fn subscribe_with_window(&self, window: usize) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        EventSubscription::new(rx, window)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.len())
            .unwrap_or_default()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Receiving side of an [`EventBus`] subscription.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<UpmEvent>,
    seen: FxHashSet<Uuid>,
    order: VecDeque<Uuid>,
    window: usize,
    duplicates: u64,
}

impl EventSubscription {
    fn new(rx: mpsc::UnboundedReceiver<UpmEvent>, window: usize) -> Self {
        Self {
            rx,
            seen: FxHashSet::default(),
            order: VecDeque::new(),
            window: window.max(1),
            duplicates: 0,
        }
    }

    /// Next unseen event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<UpmEvent> {
        loop {
            let event = self.rx.recv().await?;
            if self.first_sighting(event.id) {
                return Some(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<UpmEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if self.first_sighting(event.id) {
                return Some(event);
            }
        }
        None
    }

    /// Drain every event currently queued.
    pub fn drain(&mut self) -> Vec<UpmEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates
    }

    fn first_sighting(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            self.duplicates += 1;
            debug!(event_id = %id, "Dropping duplicate event delivery");
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.window {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Append-only JSON-lines journal of every published event.
///
/// Serves as the audit trail and the hand-off point to an external bus.
pub struct JsonlEventJournal {
    file: Mutex<File>,
    path: PathBuf,
    /// Total events written to this journal.
    pub events_total: AtomicU64,
}

impl JsonlEventJournal {
    /// Open (or create) a journal file at the given path.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            events_total: AtomicU64::new(0),
        })
    }

    pub fn append(&self, event: &UpmEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{}", line)?;
        file.flush()?;
        self.events_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    /// Read a journal back. Lines that fail to parse are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> std::io::Result<Vec<UpmEvent>> {
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Write every event from `subscription` until the bus closes.
    pub fn spawn(self: Arc<Self>, mut subscription: EventSubscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(e) = self.append(&event) {
                    warn!(
                        path = %self.path.display(),
                        event_id = %event.id,
                        "Failed to journal event: {}",
                        e
                    );
                }
            }
        })
    }
}
