//! Change notifications for host UIs.
//!
//! `emit()` runs inside every write and must not stall the engine:
//!
//! - never blocks (`try_send`)
//! - never fails (full or disconnected buffers only bump the drop counter)
//!
//! The host drains the paired `ChangeReceiver` at its own pace, usually after
//! each `settle()`.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use serde_json::Value;

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    User,
    Formula,
    Criteria,
    Structure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    Value { old: Value, new: Value },
    Activation { active: bool },
    /// Row count of an array after an add, remove or move.
    Shape { rows: usize },
}

/// One change, keyed by dotted path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub path: String,
    pub source: ChangeSource,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn value(path: impl Into<String>, source: ChangeSource, old: Value, new: Value) -> Self {
        Self {
            path: path.into(),
            source,
            kind: ChangeKind::Value { old, new },
        }
    }

    pub fn activation(path: impl Into<String>, active: bool) -> Self {
        Self {
            path: path.into(),
            source: ChangeSource::Criteria,
            kind: ChangeKind::Activation { active },
        }
    }

    pub fn shape(path: impl Into<String>, rows: usize) -> Self {
        Self {
            path: path.into(),
            source: ChangeSource::Structure,
            kind: ChangeKind::Shape { rows },
        }
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Bounded, non-blocking change emitter. A disabled emitter counts nothing and
/// sends nothing.
pub struct ChangeEmitter {
    sender: Option<Sender<ChangeEvent>>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ChangeEmitter {
    pub fn new(buffer_size: usize) -> (Self, ChangeReceiver) {
        let (sender, receiver) = bounded(buffer_size);
        let emitter = Self {
            sender: Some(sender),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (emitter, ChangeReceiver { receiver: Some(receiver) })
    }

    pub fn disabled() -> (Self, ChangeReceiver) {
        let emitter = Self {
            sender: None,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (emitter, ChangeReceiver { receiver: None })
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    #[inline]
    pub fn emit(&self, event: ChangeEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ChangeEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEmitter")
            .field("enabled", &self.is_enabled())
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitterStats {
    pub emitted: u64,
    /// Buffer full or receiver gone.
    pub dropped: u64,
}

impl EmitterStats {
    pub fn drop_rate(&self) -> f64 {
        let total = self.emitted + self.dropped;
        if total == 0 {
            0.0
        } else {
            self.dropped as f64 / total as f64
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChangeReceiver {
    receiver: Option<Receiver<ChangeEvent>>,
}

impl ChangeReceiver {
    pub fn try_recv(&self) -> Option<ChangeEvent> {
        self.receiver.as_ref()?.try_recv().ok()
    }

    /// Everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        match &self.receiver {
            Some(receiver) => receiver.try_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.as_ref().map_or(0, Receiver::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
