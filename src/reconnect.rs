//! Keepalive, health-check, and reconnect policy.
//!
//! These are plain policy/state objects (not tasks themselves); the public
//! facade in `client` drives their timers from its own loop and calls back
//! into them, the same single-caller discipline used by `channel` and
//! `multiplexer`.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::{AutoReconnectConfig, HealthCheckConfig, KeepaliveConfig};

/// Keepalive probe tracker.
pub struct Keepalive {
    config: KeepaliveConfig,
    consecutive_misses: u32,
}

/// What the caller should do after feeding a keepalive tick's outcome in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// Nothing to do; the probe succeeded (or keepalive is disabled).
    Healthy,
    /// The probe failed but `max_missed` has not yet been reached.
    Missed {
        /// Consecutive misses so far.
        count: u32,
    },
    /// `max_missed` consecutive probes have failed; the caller must force a
    /// disconnect.
    Exhausted,
}

impl Keepalive {
    /// Construct a tracker from configuration.
    #[must_use]
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            consecutive_misses: 0,
        }
    }

    /// Whether the keepalive timer should run at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Interval between probes.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Record the outcome of one probe (the transport's `ping`).
    pub fn record(&mut self, succeeded: bool) -> KeepaliveOutcome {
        if succeeded {
            self.consecutive_misses = 0;
            return KeepaliveOutcome::Healthy;
        }
        self.consecutive_misses += 1;
        if self.consecutive_misses >= self.config.max_missed {
            warn!(misses = self.consecutive_misses, "keepalive exhausted; forcing disconnect");
            KeepaliveOutcome::Exhausted
        } else {
            KeepaliveOutcome::Missed {
                count: self.consecutive_misses,
            }
        }
    }
}

/// Health-check probe tracker.
pub struct HealthCheck {
    config: HealthCheckConfig,
    unhealthy: bool,
}

impl HealthCheck {
    /// Construct a tracker from configuration.
    #[must_use]
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            unhealthy: false,
        }
    }

    /// Whether the health-check timer should run at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Interval between probes.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Probe method to use.
    #[must_use]
    pub fn method(&self) -> crate::config::HealthCheckMethod {
        self.config.method
    }

    /// Record the outcome of one probe. Returns `true` if this transitioned
    /// the connection from healthy to unhealthy (the caller should consider
    /// initiating a reconnect when auto-reconnect is enabled).
    pub fn record(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.unhealthy = false;
            false
        } else {
            let became_unhealthy = !self.unhealthy;
            self.unhealthy = true;
            became_unhealthy
        }
    }

    /// Current health state.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }
}

/// Exponential-backoff reconnect state machine, driven by the facade after
/// an unplanned transport close.
pub struct ReconnectManager {
    config: AutoReconnectConfig,
    attempt: u32,
}

/// What the caller should do next, after `ReconnectManager` state mutation.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectStep {
    /// Wait `delay`, then try connecting again.
    Attempt {
        /// 1-based attempt number about to be made.
        attempt: u32,
        /// Delay to wait before this attempt.
        delay: Duration,
    },
    /// All attempts have been exhausted; the close is now fatal.
    GiveUp,
}

impl ReconnectManager {
    /// Construct a reconnect manager from configuration.
    #[must_use]
    pub fn new(config: AutoReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Whether auto-reconnect is enabled at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Compute the next step: either schedule another attempt with its
    /// backed-off delay, or signal that attempts are exhausted.
    pub fn next_step(&mut self) -> ReconnectStep {
        if self.attempt >= self.config.max_attempts {
            return ReconnectStep::GiveUp;
        }
        self.attempt += 1;
        #[allow(clippy::cast_precision_loss)]
        let factor = self.config.backoff_multiplier.powi(i32::try_from(self.attempt - 1).unwrap_or(i32::MAX));
        let delay_ms = (self.config.initial_delay.as_millis() as f64 * factor) as u64;
        ReconnectStep::Attempt {
            attempt: self.attempt,
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Reset the attempt counter after a successful reconnect.
    pub fn record_success(&mut self) {
        if self.attempt > 0 {
            info!(attempts_used = self.attempt, "reconnect succeeded");
        }
        self.attempt = 0;
    }

    /// Attempts made so far in the current backoff sequence.
    #[must_use]
    pub fn attempts_used(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_exhausts_after_max_missed_consecutive_failures() {
        let mut ka = Keepalive::new(KeepaliveConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            max_missed: 3,
        });
        assert_eq!(ka.record(false), KeepaliveOutcome::Missed { count: 1 });
        assert_eq!(ka.record(false), KeepaliveOutcome::Missed { count: 2 });
        assert_eq!(ka.record(false), KeepaliveOutcome::Exhausted);
    }

    #[test]
    fn keepalive_success_resets_miss_counter() {
        let mut ka = Keepalive::new(KeepaliveConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            max_missed: 2,
        });
        assert_eq!(ka.record(false), KeepaliveOutcome::Missed { count: 1 });
        assert_eq!(ka.record(true), KeepaliveOutcome::Healthy);
        assert_eq!(ka.record(false), KeepaliveOutcome::Missed { count: 1 });
    }

    #[test]
    fn health_check_reports_transition_only_once() {
        let mut hc = HealthCheck::new(HealthCheckConfig {
            enabled: true,
            method: crate::config::HealthCheckMethod::Ping,
            interval: Duration::from_secs(1),
        });
        assert!(hc.record(false));
        assert!(!hc.record(false));
        assert!(hc.is_unhealthy());
        assert!(!hc.record(true));
        assert!(!hc.is_unhealthy());
    }

    #[test]
    fn reconnect_backoff_grows_by_multiplier_and_stops_at_max_attempts() {
        let mut mgr = ReconnectManager::new(AutoReconnectConfig {
            enabled: true,
            max_attempts: 2,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        });
        match mgr.next_step() {
            ReconnectStep::Attempt { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(100));
            }
            ReconnectStep::GiveUp => panic!("expected an attempt"),
        }
        match mgr.next_step() {
            ReconnectStep::Attempt { attempt, delay } => {
                assert_eq!(attempt, 2);
                assert_eq!(delay, Duration::from_millis(200));
            }
            ReconnectStep::GiveUp => panic!("expected a second attempt"),
        }
        assert!(matches!(mgr.next_step(), ReconnectStep::GiveUp));
    }

    #[test]
    fn reconnect_success_resets_attempt_counter() {
        let mut mgr = ReconnectManager::new(AutoReconnectConfig {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        });
        let _ = mgr.next_step();
        let _ = mgr.next_step();
        mgr.record_success();
        assert_eq!(mgr.attempts_used(), 0);
    }
}
