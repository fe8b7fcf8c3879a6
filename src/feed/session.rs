//! Feed Session Management
//!
//! - State machine with validated transitions
//! - Exponential backoff with jitter for reconnects
//! - Per-session counters

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeat envelopes while open
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,

    /// Reconnect after a transport fault instead of stopping in `Error`
    pub reconnect: bool,
    /// Give up after this many consecutive failed attempts (`None` = never)
    pub max_reconnect_attempts: Option<u32>,

    // Backoff parameters
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),

            reconnect: true,
            max_reconnect_attempts: None,

            // Backoff: 500ms base, 2x multiplier, 30s cap, ±20% jitter
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Initial state before any connection attempt
    Disconnected,
    /// TCP + TLS + WebSocket upgrade in progress
    Connecting,
    /// Subscribed; frames flow and heartbeats are sent
    Open,
    /// Transport fault, waiting for the backoff timer
    Reconnecting,
    /// Server closed the connection normally
    Closed,
    /// Unrecoverable fault
    Error,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed | Error, _) => false,
            (_, Error) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Open | Reconnecting) => true,
            (Open, Closed | Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Reason for state transition (for logging/metrics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    Handshake,
    ConnectFailed,
    ServerClose,
    NetworkError,
    HeartbeatFailed,
    BackoffElapsed,
    ReconnectDisabled,
    AttemptsExhausted,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Handshake => write!(f, "handshake_ok"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::ServerClose => write!(f, "server_close"),
            Self::NetworkError => write!(f, "network_error"),
            Self::HeartbeatFailed => write!(f, "heartbeat_failed"),
            Self::BackoffElapsed => write!(f, "backoff_elapsed"),
            Self::ReconnectDisabled => write!(f, "reconnect_disabled"),
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
        }
    }
}

// =============================================================================
// EXPONENTIAL BACKOFF WITH JITTER
// =============================================================================

#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
}

impl BackoffCalculator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms as f64,
            max_ms: config.backoff_max_ms as f64,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
        }
    }

    /// Compute next backoff duration with jitter
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.base_ms * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(self.base_ms);

        self.attempt = self.attempt.saturating_add(1);

        Duration::from_millis(final_ms as u64)
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connects_attempted: AtomicU64,
    pub connects_succeeded: AtomicU64,
    pub reconnects: AtomicU64,
    pub subscriptions_sent: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub text_frames_ignored: AtomicU64,
}

impl SessionMetrics {
    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            connects_attempted: self.connects_attempted.load(Ordering::Relaxed),
            connects_succeeded: self.connects_succeeded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            subscriptions_sent: self.subscriptions_sent.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            text_frames_ignored: self.text_frames_ignored.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetricsSnapshot {
    pub connects_attempted: u64,
    pub connects_succeeded: u64,
    pub reconnects: u64,
    pub subscriptions_sent: u64,
    pub heartbeats_sent: u64,
    pub text_frames_ignored: u64,
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: RwLock<ConnectionState>,
    backoff: RwLock<BackoffCalculator>,
    metrics: SessionMetrics,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let backoff = BackoffCalculator::new(&config);
        Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            backoff: RwLock::new(backoff),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move to `next`. Transitions the state machine does not allow are
    /// refused and logged; returns whether the state changed.
    pub fn transition(&self, next: ConnectionState, reason: TransitionReason) -> bool {
        let prev = {
            let mut state = self.state.write();
            let prev = *state;
            if !prev.can_transition_to(next) {
                drop(state);
                warn!(from = %prev, to = %next, reason = %reason, "invalid session transition refused");
                return false;
            }
            *state = next;
            prev
        };

        match next {
            ConnectionState::Connecting => {
                self.metrics.connects_attempted.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionState::Open => {
                self.metrics.connects_succeeded.fetch_add(1, Ordering::Relaxed);
                self.backoff.write().reset();
            }
            ConnectionState::Reconnecting => {
                self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        info!(from = %prev, to = %next, reason = %reason, "session_transition");
        true
    }

    /// Next reconnect delay, or `None` when attempts are exhausted.
    pub fn next_backoff(&self) -> Option<Duration> {
        let mut backoff = self.backoff.write();
        if let Some(max) = self.config.max_reconnect_attempts {
            if backoff.attempt() >= max {
                return None;
            }
        }
        Some(backoff.next_backoff())
    }

    pub fn backoff_attempt(&self) -> u32 {
        self.backoff.read().attempt()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

// =============================================================================
// TESTS
// =============================================================================
