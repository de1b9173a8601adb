//! Operation lifecycle tracking and the typed event stream.
//!
//! Every user-visible action is an `Event` variant (not a dynamically named
//! string, per the design note against stringly-typed event buses) and is
//! published on a broadcast channel any number of subscribers can drain.
//! The tracker also owns the active-operation map so progress events can be
//! throttled per operation and callers can introspect in-flight work.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Classification;

/// Default minimum interval between progress events for the same
/// operation.
pub const DEFAULT_PROGRESS_THROTTLE: Duration = Duration::from_millis(100);

/// Capacity of the in-memory event history ring buffer.
const EVENT_HISTORY_CAPACITY: usize = 1000;

/// Kind of a tracked operation, used both for event labeling and for
/// associating adaptive-controller feedback with the right transfer
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// OPEN.
    Open,
    /// CLOSE.
    Close,
    /// READ.
    Read,
    /// WRITE.
    Write,
    /// STAT or LSTAT.
    Stat,
    /// SETSTAT.
    Setstat,
    /// OPENDIR.
    Opendir,
    /// READDIR (possibly several, as part of one LIST).
    Readdir,
    /// REMOVE.
    Remove,
    /// RENAME.
    Rename,
    /// MKDIR.
    Mkdir,
    /// RMDIR.
    Rmdir,
    /// REALPATH.
    Realpath,
    /// `fsync@openssh.com`.
    Fsync,
    /// Whole-file upload helper.
    Put,
    /// Whole-file download helper.
    Get,
    /// Append helper.
    Append,
    /// Recursive directory upload.
    UploadDir,
    /// Recursive directory download.
    DownloadDir,
}

/// Direction an adaptive-controller change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Upload (client → server).
    Upload,
    /// Download (server → client).
    Download,
}

/// Why a limit-triggered reconnect fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// The server appears to cap the number of operations per connection.
    OperationCount,
    /// The server appears to cap total bytes transferred per connection.
    ByteCount,
}

/// The event stream's variants. Each maps to one row of spec.md §4.H's
/// event kind list.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection attempt began.
    ConnectionStart,
    /// SSH authentication is in progress.
    ConnectionAuthenticating,
    /// The SFTP session is ready for operations.
    ConnectionReady,
    /// The connection failed.
    ConnectionError {
        /// Human-readable description.
        message: String,
    },
    /// An operation was created.
    OperationStart {
        /// Unique id for this operation's lifecycle.
        operation_id: Uuid,
        /// What kind of operation this is.
        kind: OperationKind,
        /// Remote path involved, if any.
        remote_path: Option<String>,
    },
    /// A throttled progress update.
    OperationProgress {
        /// Operation this progress belongs to.
        operation_id: Uuid,
        /// Bytes transferred so far.
        bytes_transferred: u64,
        /// Total expected bytes, if known up front.
        total_bytes: Option<u64>,
    },
    /// An operation finished successfully.
    OperationComplete {
        /// Operation that completed.
        operation_id: Uuid,
        /// Wall-clock duration from start to completion.
        duration: Duration,
    },
    /// An operation finished with an error.
    OperationError {
        /// Operation that failed.
        operation_id: Uuid,
        /// Error classification surfaced to the caller.
        classification: Classification,
        /// Human-readable description.
        message: String,
    },
    /// An operation is being retried.
    OperationRetry {
        /// Operation being retried.
        operation_id: Uuid,
        /// 1-based retry attempt number.
        attempt: u32,
        /// Why the retry is happening.
        reason: String,
    },
    /// The adaptive controller changed its chunk size, concurrency, or
    /// timeout policy.
    AdaptiveChange {
        /// Which transfer direction this change applies to.
        direction: Direction,
        /// Chunk size before the change.
        old_chunk_size: u32,
        /// Chunk size after the change.
        new_chunk_size: u32,
        /// Why the controller made this change.
        reason: String,
    },
    /// A periodic snapshot of observed throughput and latency.
    PerformanceMetrics {
        /// Rolling average throughput, megabits per second.
        avg_throughput_mbps: f64,
        /// Rolling average response time, milliseconds.
        avg_response_ms: f64,
    },
    /// The adaptive controller inferred a server-side operation or byte
    /// limit from an observed timeout.
    ServerLimitDetected {
        /// Which kind of limit this is.
        kind: LimitKind,
        /// Operations completed before the limit was hit.
        ops: u64,
        /// Bytes transferred before the limit was hit.
        bytes: u64,
    },
    /// A transfer-triggered reconnect occurred mid-operation.
    AutoReconnect {
        /// Why the reconnect was triggered.
        reason: String,
    },
    /// A keepalive probe result.
    Keepalive {
        /// Whether the probe succeeded.
        healthy: bool,
    },
    /// A health-check probe result.
    HealthCheck {
        /// Whether the probe succeeded.
        healthy: bool,
    },
    /// An exponential-backoff reconnect attempt started.
    ReconnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A reconnect attempt succeeded.
    ReconnectSuccess,
    /// A single reconnect attempt failed (more attempts may follow).
    ReconnectError {
        /// Human-readable description.
        message: String,
    },
    /// All reconnect attempts were exhausted; the close is now fatal.
    ReconnectFailed,
    /// A completed upload's post-write `stat` reported a size different
    /// from what was written. Non-fatal by design (Open Question decision,
    /// see DESIGN.md) — surfaced so a caller that wants strict behavior can
    /// act on it.
    VerificationMismatch {
        /// Operation this verification belongs to.
        operation_id: Uuid,
        /// Size that was written.
        expected_bytes: u64,
        /// Size the server reported via `stat` after the transfer.
        actual_bytes: u64,
    },
}

/// A tracked operation's lifecycle state, owned by the [`Tracker`] from
/// creation until its terminal event is emitted.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// Unique id.
    pub id: Uuid,
    /// What kind of operation this is.
    pub kind: OperationKind,
    /// Remote path involved, if any.
    pub remote_path: Option<String>,
    /// Local path involved, if any (upload/download helpers).
    pub local_path: Option<String>,
    /// Wall-clock start time.
    pub start_time: DateTime<Utc>,
    /// Total expected bytes, if known up front.
    pub total_bytes: Option<u64>,
    /// Bytes transferred so far.
    pub bytes_transferred: Option<u64>,
}

struct TrackerState {
    active: HashMap<Uuid, OperationRecord>,
    last_progress_emit: HashMap<Uuid, Instant>,
    history: std::collections::VecDeque<Event>,
}

/// Owns the active-operation map and the broadcast event stream.
pub struct Tracker {
    sender: broadcast::Sender<Event>,
    state: Mutex<TrackerState>,
    progress_throttle: Duration,
}

impl Tracker {
    /// Construct a tracker with the given progress-throttle interval.
    #[must_use]
    pub fn new(progress_throttle: Duration) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            state: Mutex::new(TrackerState {
                active: HashMap::new(),
                last_progress_emit: HashMap::new(),
                history: std::collections::VecDeque::with_capacity(EVENT_HISTORY_CAPACITY),
            }),
            progress_throttle,
        }
    }

    /// Subscribe to the event stream. Events published before subscription
    /// are not replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    fn emit(&self, event: Event) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.history.len() == EVENT_HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        drop(state);
        // No receivers is a normal, non-error condition.
        let _ = self.sender.send(event);
    }

    /// Register a new operation and emit `OperationStart`.
    pub fn start(
        &self,
        kind: OperationKind,
        remote_path: Option<String>,
        local_path: Option<String>,
        total_bytes: Option<u64>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let record = OperationRecord {
            id,
            kind,
            remote_path: remote_path.clone(),
            local_path,
            start_time: Utc::now(),
            total_bytes,
            bytes_transferred: None,
        };
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.active.insert(id, record);
        }
        self.emit(Event::OperationStart {
            operation_id: id,
            kind,
            remote_path,
        });
        id
    }

    /// Report progress, throttled to at most one emission per
    /// `progress_throttle` for a given operation. Always updates the active
    /// record's byte count even when the event itself is suppressed.
    pub fn progress(&self, id: Uuid, bytes_transferred: u64, total_bytes: Option<u64>) {
        let should_emit = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(record) = state.active.get_mut(&id) {
                record.bytes_transferred = Some(bytes_transferred);
                if total_bytes.is_some() {
                    record.total_bytes = total_bytes;
                }
            } else {
                // Operation already terminated; never emit progress for it.
                return;
            }
            let now = Instant::now();
            let throttled = state
                .last_progress_emit
                .get(&id)
                .is_some_and(|last| now.duration_since(*last) < self.progress_throttle);
            if !throttled {
                state.last_progress_emit.insert(id, now);
            }
            !throttled
        };
        if should_emit {
            self.emit(Event::OperationProgress {
                operation_id: id,
                bytes_transferred,
                total_bytes,
            });
        }
    }

    /// Emit the terminal success event and release ownership of the
    /// operation record.
    pub fn complete(&self, id: Uuid) {
        let duration = {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let record = state.active.remove(&id);
            state.last_progress_emit.remove(&id);
            record.map_or(Duration::ZERO, |r| {
                (Utc::now() - r.start_time).to_std().unwrap_or(Duration::ZERO)
            })
        };
        self.emit(Event::OperationComplete {
            operation_id: id,
            duration,
        });
    }

    /// Emit the terminal error event and release ownership of the operation
    /// record.
    pub fn error(&self, id: Uuid, err: &crate::Error) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.active.remove(&id);
            state.last_progress_emit.remove(&id);
        }
        self.emit(Event::OperationError {
            operation_id: id,
            classification: err.classify(),
            message: err.to_string(),
        });
    }

    /// Emit a non-terminal retry notice; the operation remains active.
    pub fn retry(&self, id: Uuid, attempt: u32, reason: impl Into<String>) {
        self.emit(Event::OperationRetry {
            operation_id: id,
            attempt,
            reason: reason.into(),
        });
    }

    /// Emit an arbitrary, non-operation-scoped event (adaptive changes,
    /// reconnect lifecycle, keepalive/health results, metrics snapshots).
    pub fn emit_event(&self, event: Event) {
        self.emit(event);
    }

    /// Number of operations currently active (created but not yet
    /// terminated).
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).active.len()
    }

    /// Snapshot of currently active operation records, for a caller
    /// building a status display.
    #[must_use]
    pub fn active_operations(&self) -> Vec<OperationRecord> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .active
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_complete_emits_exactly_one_terminal_event() {
        let tracker = Tracker::new(DEFAULT_PROGRESS_THROTTLE);
        let mut rx = tracker.subscribe();
        let id = tracker.start(OperationKind::Put, Some("/tmp/x".into()), None, Some(42));
        tracker.complete(id);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Event::OperationStart { .. }));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, Event::OperationComplete { .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn progress_after_completion_is_a_no_op() {
        let tracker = Tracker::new(Duration::ZERO);
        let mut rx = tracker.subscribe();
        let id = tracker.start(OperationKind::Get, None, None, None);
        tracker.complete(id);
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        tracker.progress(id, 10, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn progress_is_throttled_within_the_interval() {
        let tracker = Tracker::new(Duration::from_secs(10));
        let mut rx = tracker.subscribe();
        let id = tracker.start(OperationKind::Get, None, None, Some(100));
        let _ = rx.try_recv(); // OperationStart

        tracker.progress(id, 10, None);
        tracker.progress(id, 20, None);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Event::OperationProgress { bytes_transferred: 10, .. }));
        assert!(rx.try_recv().is_err());
    }
}
