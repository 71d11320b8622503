//! Per-connection lifecycle state and response-time smoothing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smoothing factor for the response-time moving average.
pub const EMA_ALPHA: f64 = 0.1;

/// Lifecycle of a supervised connection.
///
/// ```text
/// configuring -> connecting -> connected | error
/// connected | healthy | unhealthy -> healthy | unhealthy | error
/// error -> connecting (reconnect attempt) | failed
/// connecting -> healthy (reconnect succeeded)
/// ```
/// `failed` is terminal; the connection has to be removed and created again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Configuring,
    Connecting,
    Connected,
    Healthy,
    Unhealthy,
    Error,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Configuring => "configuring",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Healthy => "healthy",
            ConnectionStatus::Unhealthy => "unhealthy",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Configuring, Connecting)
                | (Connecting, Connected)
                | (Connecting, Healthy)
                | (Connecting, Error)
                | (Connected, Healthy)
                | (Connected, Unhealthy)
                | (Connected, Error)
                | (Healthy, Healthy)
                | (Healthy, Unhealthy)
                | (Healthy, Error)
                | (Unhealthy, Healthy)
                | (Unhealthy, Unhealthy)
                | (Unhealthy, Error)
                | (Error, Connecting)
                | (Error, Failed)
        )
    }

    /// Established and eligible for scheduled health checks.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Healthy | ConnectionStatus::Unhealthy
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Failed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential moving average seeded by its first sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResponseTimeEma {
    value: Option<f64>,
}

impl ResponseTimeEma {
    pub fn record(&mut self, sample_ms: f64) -> f64 {
        let next = match self.value {
            None => sample_ms,
            Some(avg) => EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * avg,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// Mutable bookkeeping for one connection, guarded by the registry entry lock.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_activity: DateTime<Utc>,
    pub query_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub response_time: ResponseTimeEma,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Configuring,
            last_activity: Utc::now(),
            query_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            reconnect_attempts: 0,
            response_time: ResponseTimeEma::default(),
            last_error: None,
        }
    }

    /// Moves to `next` if the lifecycle allows it and returns the old status.
    pub fn transition(&mut self, next: ConnectionStatus) -> Result<ConnectionStatus, InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        Ok(std::mem::replace(&mut self.status, next))
    }

    pub fn record_success(&mut self, latency_ms: f64) {
        self.response_time.record(latency_ms);
        self.last_activity = Utc::now();
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, reason: Option<String>) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.last_activity = Utc::now();
        if reason.is_some() {
            self.last_error = reason;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionState, ConnectionStatus, ResponseTimeEma, EMA_ALPHA};

    #[test]
    fn ema_is_seeded_by_first_sample() {
        let samples = [120.0, 80.0, 200.0, 40.0, 95.5];
        let mut ema = ResponseTimeEma::default();
        assert_eq!(ema.value(), None);

        let mut expected = samples[0];
        ema.record(samples[0]);
        for sample in &samples[1..] {
            expected = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * expected;
            ema.record(*sample);
        }
        let value = ema.value().expect("ema should hold a value");
        assert!((value - expected).abs() < 1e-9);
    }

    #[test]
    fn follows_the_lifecycle() {
        let mut state = ConnectionState::new();
        assert_eq!(state.status, ConnectionStatus::Configuring);
        assert!(state.transition(ConnectionStatus::Healthy).is_err());

        state.transition(ConnectionStatus::Connecting).unwrap();
        state.transition(ConnectionStatus::Connected).unwrap();
        state.transition(ConnectionStatus::Healthy).unwrap();
        state.transition(ConnectionStatus::Unhealthy).unwrap();
        state.transition(ConnectionStatus::Error).unwrap();
        state.transition(ConnectionStatus::Connecting).unwrap();
        state.transition(ConnectionStatus::Error).unwrap();
        let previous = state.transition(ConnectionStatus::Failed).unwrap();
        assert_eq!(previous, ConnectionStatus::Error);
    }

    #[test]
    fn failed_is_terminal() {
        let all = [
            ConnectionStatus::Configuring,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Healthy,
            ConnectionStatus::Unhealthy,
            ConnectionStatus::Error,
            ConnectionStatus::Failed,
        ];
        for next in all {
            assert!(!ConnectionStatus::Failed.can_transition_to(next));
        }
        assert!(ConnectionStatus::Failed.is_terminal());
        assert!(!ConnectionStatus::Error.is_active());
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut state = ConnectionState::new();
        state.record_failure(Some("timeout".into()));
        state.record_failure(None);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.error_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));

        state.record_success(12.0);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.error_count, 2);
        assert_eq!(state.response_time.value(), Some(12.0));
    }
}
