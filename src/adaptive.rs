//! Adaptive controller: chunk-size, concurrency, throttle, and timeout
//! policy driven by observed transfer behavior.
//!
//! One [`Controller`] is created per transfer direction per file transfer
//! (the transfer engine owns it) and is the only thing that mutates its
//! [`AdaptiveState`] — reports arrive exclusively from the transfer engine
//! via `record_success`/`record_failure`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::events::{Direction, LimitKind};

const UPLOAD_INITIAL_CHUNK: u32 = 8 * 1024;
const DOWNLOAD_INITIAL_CHUNK: u32 = 8 * 1024;

/// Cumulative-bytes thresholds past which a download is allowed to grow its
/// chunk size, provided the recent success rate stays healthy.
const DOWNLOAD_GROWTH_THRESHOLDS: [u64; 2] = [256 * 1024, 1024 * 1024];

const CONCURRENCY_INITIAL_CAP: u32 = 8;
const CONCURRENCY_MAX: u32 = 12;
const CONCURRENCY_MIN: u32 = 2;
const ROLLING_WINDOW_MIN: usize = 5;
const ROLLING_WINDOW_CAP: usize = 20;

/// Target fraction of the current send window to keep in flight.
const WINDOW_TARGET_NUM: i64 = 80;
const WINDOW_TARGET_DEN: i64 = 100;

/// Consecutive failures at a size before the controller gives up growing
/// past it for the remainder of this transfer.
const PERSISTENT_LIMIT_STREAK: u32 = 3;

/// Why a chunk attempt failed, distinguished because only timeouts feed the
/// server-limit heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The per-chunk deadline elapsed.
    Timeout,
    /// Any other failure (status error, connection issue local to the
    /// chunk).
    Other,
}

/// What the caller should do after a chunk (or whole batch) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Retry at `retry_size`, which is `<=` the size that just failed.
    Retry {
        /// Size to use for the retry attempt.
        retry_size: u32,
    },
    /// Retries at a reduced size have been exhausted; fall through to
    /// sequential mode or propagate the error.
    Exhausted,
}

/// Which class of operation a timeout is being computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Metadata/control operations (stat, mkdir, rename, ...).
    Control,
    /// Data-carrying operations (read, write).
    Data,
    /// Connection-level operations (connect, subsystem handshake).
    Connection,
}

/// File-size class, used by the download throttle policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// < 1 MiB.
    Small,
    /// 1-10 MiB.
    Medium,
    /// > 10 MiB.
    Large,
}

impl SizeClass {
    /// Classify a total transfer size.
    #[must_use]
    pub fn of(total_bytes: u64) -> Self {
        const MIB: u64 = 1024 * 1024;
        if total_bytes < MIB {
            SizeClass::Small
        } else if total_bytes <= 10 * MIB {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }
}

/// Adaptive state, mirroring spec.md §3's "Adaptive state" record.
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    /// Successful chunks observed so far.
    pub successes: u64,
    /// Chunk timeouts observed so far.
    pub timeouts: u64,
    /// Rolling average throughput.
    pub avg_throughput_mbps: f64,
    /// Rolling average response time.
    pub avg_response_ms: f64,
    /// Largest size at which a streak of successes was last observed.
    pub stable_chunk_size: u32,
    /// Size to use for the next chunk.
    pub current_chunk_size: u32,
    /// Operation count at which a server limit was inferred, if any.
    pub detected_op_limit: Option<u64>,
    /// Byte count at which a server limit was inferred, if any.
    pub detected_byte_limit: Option<u64>,
    /// When the controller last changed its chunk size.
    pub last_adjustment_time: Instant,
}

/// Drives chunk-size, concurrency, throttle, and timeout decisions for one
/// transfer.
pub struct Controller {
    direction: Direction,
    max_safe_chunk_size: u32,
    state: AdaptiveState,
    failures_at_current_size: u32,
    growth_stopped: bool,
    rolling_outcomes: VecDeque<bool>,
    concurrency_cap: u32,
    chunks_since_throttle: u32,
    ops_so_far: u64,
    bytes_so_far: u64,
}

impl Controller {
    /// Construct a controller for one transfer direction, bounded by the
    /// channel's current `max_safe_chunk_size`.
    #[must_use]
    pub fn new(direction: Direction, max_safe_chunk_size: u32) -> Self {
        let initial = match direction {
            Direction::Upload => UPLOAD_INITIAL_CHUNK,
            Direction::Download => DOWNLOAD_INITIAL_CHUNK,
        }
        .min(max_safe_chunk_size);
        Self {
            direction,
            max_safe_chunk_size,
            state: AdaptiveState {
                successes: 0,
                timeouts: 0,
                avg_throughput_mbps: 0.0,
                avg_response_ms: 0.0,
                stable_chunk_size: initial,
                current_chunk_size: initial,
                detected_op_limit: None,
                detected_byte_limit: None,
                last_adjustment_time: Instant::now(),
            },
            failures_at_current_size: 0,
            growth_stopped: false,
            rolling_outcomes: VecDeque::with_capacity(ROLLING_WINDOW_CAP),
            concurrency_cap: CONCURRENCY_INITIAL_CAP,
            chunks_since_throttle: 0,
            ops_so_far: 0,
            bytes_so_far: 0,
        }
    }

    /// A read-only snapshot of the adaptive state, for event reporting.
    #[must_use]
    pub fn state(&self) -> &AdaptiveState {
        &self.state
    }

    /// The chunk size to use for the next batch. For uploads this is
    /// whatever `record_*` already grew or shrank it to; for downloads,
    /// growth is additionally gated on cumulative bytes transferred.
    pub fn next_chunk_size(&mut self, bytes_so_far: u64) -> u32 {
        if self.direction == Direction::Download && !self.growth_stopped {
            let crossed = DOWNLOAD_GROWTH_THRESHOLDS
                .iter()
                .filter(|&&t| bytes_so_far >= t)
                .count();
            let healthy = self.recent_success_rate().is_none_or(|rate| rate > 0.95);
            if crossed > 0 && healthy && self.state.current_chunk_size < self.max_safe_chunk_size {
                let grown = (self.state.current_chunk_size * 2).min(self.max_safe_chunk_size);
                if grown > self.state.current_chunk_size {
                    self.state.current_chunk_size = grown;
                    self.state.last_adjustment_time = Instant::now();
                }
            }
        }
        self.state.current_chunk_size
    }

    /// Record a successful chunk transfer at `size`, taking `duration`.
    /// Uploads double their chunk size after every success until the safe
    /// ceiling or a failure at the current size.
    pub fn record_chunk_success(&mut self, size: u32, duration: Duration, total_bytes_hint: Option<u64>) {
        self.state.successes += 1;
        self.ops_so_far += 1;
        self.bytes_so_far += u64::from(size);
        self.update_rolling_averages(size, duration);
        self.push_outcome(true);

        if size >= self.state.stable_chunk_size {
            self.state.stable_chunk_size = size;
        }
        self.failures_at_current_size = 0;

        if self.direction == Direction::Upload && !self.growth_stopped && size == self.state.current_chunk_size {
            let grown = (size.saturating_mul(2)).min(self.max_safe_chunk_size);
            if grown > size {
                self.state.current_chunk_size = grown;
                self.state.last_adjustment_time = Instant::now();
                debug!(old_size = size, new_size = grown, direction = ?self.direction, "chunk size grew after success");
            }
        }
        let _ = total_bytes_hint;
    }

    /// Record a failed chunk at `size`. Returns the decision the transfer
    /// engine should act on.
    pub fn record_chunk_failure(&mut self, size: u32, reason: FailureReason) -> FailureDecision {
        if reason == FailureReason::Timeout {
            self.state.timeouts += 1;
            self.record_server_limit_sample();
        }
        self.push_outcome(false);

        let stable = self.state.stable_chunk_size;
        if size > stable {
            self.failures_at_current_size += 1;
            self.state.current_chunk_size = stable;
            self.state.last_adjustment_time = Instant::now();
            if self.failures_at_current_size >= PERSISTENT_LIMIT_STREAK {
                self.growth_stopped = true;
                info!(
                    size,
                    stable_size = stable,
                    "treating {size} as a persistent upper bound after repeated failures; growth stopped"
                );
            }
            FailureDecision::Retry { retry_size: stable }
        } else {
            FailureDecision::Exhausted
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.rolling_outcomes.len() == ROLLING_WINDOW_CAP {
            self.rolling_outcomes.pop_front();
        }
        self.rolling_outcomes.push_back(success);
        self.adjust_concurrency_cap();
    }

    fn recent_success_rate(&self) -> Option<f64> {
        if self.rolling_outcomes.len() < ROLLING_WINDOW_MIN {
            return None;
        }
        let successes = self.rolling_outcomes.iter().filter(|&&ok| ok).count();
        #[allow(clippy::cast_precision_loss)]
        Some(successes as f64 / self.rolling_outcomes.len() as f64)
    }

    fn adjust_concurrency_cap(&mut self) {
        let Some(rate) = self.recent_success_rate() else {
            return;
        };
        if rate > 0.95 {
            self.concurrency_cap = (self.concurrency_cap + 2).min(CONCURRENCY_MAX);
        } else if rate < 0.80 {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let reduced = ((f64::from(self.concurrency_cap) * 0.7).floor() as u32).max(CONCURRENCY_MIN);
            self.concurrency_cap = reduced;
        }
    }

    /// Number of chunks to issue concurrently in the next batch, bounded
    /// both by the learned cap and by 80% of the current send window.
    #[must_use]
    pub fn concurrency(&self, send_window: i64, chunk_size: u32) -> u32 {
        if chunk_size == 0 {
            return 1;
        }
        let window_target = (send_window.max(0) * WINDOW_TARGET_NUM / WINDOW_TARGET_DEN) as u64 / u64::from(chunk_size);
        #[allow(clippy::cast_possible_truncation)]
        let window_cap = window_target.min(u64::from(CONCURRENCY_MAX)) as u32;
        self.concurrency_cap.min(window_cap.max(1)).max(1)
    }

    /// Timeout to apply to the next operation of this kind.
    #[must_use]
    pub fn timeout(&self, kind: TimeoutKind, size_bytes: u64) -> Duration {
        match kind {
            TimeoutKind::Control => {
                Duration::from_millis((20.0 * self.state.avg_response_ms).max(5_000.0) as u64)
            }
            TimeoutKind::Connection => {
                Duration::from_millis((100.0 * self.state.avg_response_ms).max(15_000.0) as u64)
            }
            TimeoutKind::Data => {
                let size_kb = (size_bytes as f64 / 1024.0).max(1.0);
                let mut ms = (size_kb.log10().max(0.1) * 1000.0).max(1_000.0);
                if self.state.avg_response_ms > 1_000.0 {
                    ms *= 2.0;
                }
                Duration::from_millis(ms as u64)
            }
        }
    }

    /// Delay to insert after the next chunk, if the throttle policy calls
    /// for one at this point in the download.
    pub fn throttle_delay(&mut self, size_class: SizeClass) -> Option<Duration> {
        if self.direction != Direction::Download {
            return None;
        }
        self.chunks_since_throttle += 1;

        let (every, delay_ms) = match size_class {
            SizeClass::Small => (u32::MAX, 0),
            SizeClass::Medium => (8, 50),
            SizeClass::Large => (6, 80),
        };
        let stressed = self.state.avg_response_ms > 50.0 && self.recent_success_rate().is_none_or(|r| r > 0.9);

        if self.chunks_since_throttle >= every {
            self.chunks_since_throttle = 0;
            return Some(Duration::from_millis(delay_ms));
        }
        if stressed && self.chunks_since_throttle % 10 == 0 {
            return Some(Duration::from_millis(200));
        }
        None
    }

    fn update_rolling_averages(&mut self, size: u32, duration: Duration) {
        let secs = duration.as_secs_f64().max(0.000_1);
        let mbps = (f64::from(size) * 8.0 / 1_000_000.0) / secs;
        let ms = duration.as_secs_f64() * 1000.0;
        const ALPHA: f64 = 0.2;
        self.state.avg_throughput_mbps = if self.state.successes <= 1 {
            mbps
        } else {
            ALPHA * mbps + (1.0 - ALPHA) * self.state.avg_throughput_mbps
        };
        self.state.avg_response_ms = if self.state.successes <= 1 {
            ms
        } else {
            ALPHA * ms + (1.0 - ALPHA) * self.state.avg_response_ms
        };
    }

    fn record_server_limit_sample(&mut self) {
        self.state.detected_op_limit = Some(self.ops_so_far);
        self.state.detected_byte_limit = Some(self.bytes_so_far);
    }

    /// Whether the transfer engine should proactively reconnect because the
    /// current position is approaching 90% of a previously detected
    /// server-side operation or byte limit. Returns which dimension is the
    /// trigger so the caller can report `operation_limit` vs `byte_limit`
    /// distinctly (operation count takes priority when both cross at once,
    /// since it is the tighter, more specific signal).
    #[must_use]
    pub fn approaching_detected_limit(&self) -> Option<LimitKind> {
        const TRIGGER_NUM: u64 = 9;
        const TRIGGER_DEN: u64 = 10;
        let op_trigger = self
            .state
            .detected_op_limit
            .is_some_and(|limit| self.ops_so_far * TRIGGER_DEN >= limit * TRIGGER_NUM);
        let byte_trigger = self
            .state
            .detected_byte_limit
            .is_some_and(|limit| self.bytes_so_far * TRIGGER_DEN >= limit * TRIGGER_NUM);
        if op_trigger {
            Some(LimitKind::OperationCount)
        } else if byte_trigger {
            Some(LimitKind::ByteCount)
        } else {
            None
        }
    }

    /// Reset operation/byte counters after a reconnect, as required by
    /// spec: "Operation counters are reset."
    pub fn reset_counters_after_reconnect(&mut self) {
        self.ops_so_far = 0;
        self.bytes_so_far = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_chunk_size_doubles_on_success_up_to_ceiling() {
        let mut ctl = Controller::new(Direction::Upload, 32 * 1024);
        assert_eq!(ctl.next_chunk_size(0), 8 * 1024);
        ctl.record_chunk_success(8 * 1024, Duration::from_millis(10), None);
        assert_eq!(ctl.next_chunk_size(0), 16 * 1024);
        ctl.record_chunk_success(16 * 1024, Duration::from_millis(10), None);
        assert_eq!(ctl.next_chunk_size(0), 32 * 1024);
        ctl.record_chunk_success(32 * 1024, Duration::from_millis(10), None);
        // Already at the safe ceiling; no further growth.
        assert_eq!(ctl.next_chunk_size(0), 32 * 1024);
    }

    #[test]
    fn timeout_above_stable_size_reverts_and_retries_at_stable() {
        let mut ctl = Controller::new(Direction::Upload, 64 * 1024);
        ctl.record_chunk_success(8 * 1024, Duration::from_millis(5), None);
        // current_chunk_size is now 16 KiB; stable is 8 KiB.
        let decision = ctl.record_chunk_failure(16 * 1024, FailureReason::Timeout);
        assert_eq!(decision, FailureDecision::Retry { retry_size: 8 * 1024 });
        assert_eq!(ctl.next_chunk_size(0), 8 * 1024);
    }

    #[test]
    fn three_consecutive_failures_stop_growth_permanently() {
        let mut ctl = Controller::new(Direction::Upload, 64 * 1024);
        ctl.record_chunk_success(8 * 1024, Duration::from_millis(5), None);
        for _ in 0..3 {
            ctl.record_chunk_failure(16 * 1024, FailureReason::Timeout);
            ctl.record_chunk_success(8 * 1024, Duration::from_millis(5), None);
        }
        assert!(ctl.growth_stopped);
    }

    #[test]
    fn concurrency_never_exceeds_the_learned_cap() {
        let ctl = Controller::new(Direction::Upload, 32 * 1024);
        let c = ctl.concurrency(1 << 30, 32 * 1024);
        assert!(c <= CONCURRENCY_MAX);
    }

    #[test]
    fn approaching_detected_limit_triggers_at_ninety_percent() {
        let mut ctl = Controller::new(Direction::Download, 32 * 1024);
        ctl.record_chunk_failure(8 * 1024, FailureReason::Timeout);
        ctl.ops_so_far = 100;
        ctl.state.detected_op_limit = Some(100);
        assert_eq!(ctl.approaching_detected_limit(), Some(LimitKind::OperationCount));
    }

    #[test]
    fn approaching_detected_limit_distinguishes_byte_count() {
        let mut ctl = Controller::new(Direction::Download, 32 * 1024);
        ctl.record_chunk_failure(8 * 1024, FailureReason::Timeout);
        ctl.bytes_so_far = 900;
        ctl.state.detected_byte_limit = Some(1000);
        assert_eq!(ctl.approaching_detected_limit(), Some(LimitKind::ByteCount));
    }

    #[test]
    fn reset_counters_clears_ops_and_bytes() {
        let mut ctl = Controller::new(Direction::Download, 32 * 1024);
        ctl.ops_so_far = 10;
        ctl.bytes_so_far = 1000;
        ctl.reset_counters_after_reconnect();
        assert_eq!(ctl.ops_so_far, 0);
        assert_eq!(ctl.bytes_so_far, 0);
    }
}
