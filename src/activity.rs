//! Operation history.
//!
//! A timestamped, newest-first feed of what the manager has done: reads,
//! writes, notification deliveries, lifecycle milestones, and every failure.
//! Entries are bounded; once the capacity is reached the oldest fall off.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Default number of entries kept before the oldest are dropped.
pub const DEFAULT_ACTIVITY_CAPACITY: usize = 256;

/// Category of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ActivityKind {
    /// A characteristic value was read.
    Read,
    /// A value was written to a characteristic.
    Write,
    /// A subscribed characteristic pushed a value.
    Notification,
    /// A lifecycle milestone.
    Info,
    /// A failure.
    Error,
}

impl ActivityKind {
    /// Short uppercase label used when rendering entries.
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Read => "READ",
            ActivityKind::Write => "WRITE",
            ActivityKind::Notification => "NOTIFY",
            ActivityKind::Info => "INFO",
            ActivityKind::Error => "ERROR",
        }
    }
}

/// A single timestamped entry.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActivityEntry {
    /// Local time the entry was recorded.
    pub at: DateTime<Local>,
    /// What kind of activity this was.
    pub kind: ActivityKind,
    /// The device the entry relates to, when known.
    pub device_id: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.format("%H:%M:%S"),
            self.kind.label(),
            self.message
        )
    }
}

/// Bounded, newest-first operation history.
pub struct ActivityLog {
    entries: RwLock<VecDeque<ActivityEntry>>,
    capacity: usize,
    entry_tx: broadcast::Sender<ActivityEntry>,
}

impl ActivityLog {
    /// Creates a log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ACTIVITY_CAPACITY)
    }

    /// Creates a log bounded to `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        let (entry_tx, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            entry_tx,
        }
    }

    /// Records an entry, timestamped now.
    pub fn record(&self, kind: ActivityKind, device_id: Option<&str>, message: impl Into<String>) {
        let entry = ActivityEntry {
            at: Local::now(),
            kind,
            device_id: device_id.map(str::to_string),
            message: message.into(),
        };
        {
            let mut entries = self.entries.write();
            entries.push_front(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_back();
            }
        }
        let _ = self.entry_tx.send(entry);
    }

    /// All entries, newest first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// The most recent entry, if any.
    pub fn latest(&self) -> Option<ActivityEntry> {
        self.entries.read().front().cloned()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Subscribes to entries as they are recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEntry> {
        self.entry_tx.subscribe()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keeps_entries_newest_first() {
        let log = ActivityLog::new();
        log.record(ActivityKind::Info, None, "first");
        log.record(ActivityKind::Read, Some("dev-1"), "second");
        log.record(ActivityKind::Write, Some("dev-1"), "third");

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "third");
        assert_eq!(entries[1].message, "second");
        assert_eq!(entries[2].message, "first");
        assert_eq!(log.latest().map(|e| e.message), Some("third".to_string()));
    }

    #[test]
    fn oldest_entries_fall_off_at_capacity() {
        let log = ActivityLog::with_capacity(3);
        for i in 0..5 {
            log.record(ActivityKind::Info, None, format!("entry {i}"));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 4");
        assert_eq!(entries[2].message, "entry 2");
    }

    #[test]
    fn renders_with_time_and_label() {
        let log = ActivityLog::new();
        log.record(ActivityKind::Notification, Some("dev-1"), "72 bpm");

        let rendered = log.latest().map(|e| e.to_string()).unwrap_or_default();
        // e.g. "14:05:33 [NOTIFY] 72 bpm"
        assert!(rendered.ends_with("[NOTIFY] 72 bpm"));
        assert_eq!(rendered.split(' ').next().map(|t| t.len()), Some(8));
    }

    #[test]
    fn observers_receive_entries_as_recorded() {
        let log = ActivityLog::new();
        let mut rx = log.subscribe();

        log.record(ActivityKind::Error, Some("dev-1"), "Read failed");

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.kind, ActivityKind::Error);
        assert_eq!(entry.device_id.as_deref(), Some("dev-1"));
        assert_eq!(entry.message, "Read failed");
    }

    #[test]
    fn clear_drops_everything() {
        let log = ActivityLog::new();
        log.record(ActivityKind::Info, None, "something");
        assert!(!log.is_empty());

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
        assert!(log.latest().is_none());
    }
}
