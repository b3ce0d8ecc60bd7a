// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers in front of the remote store.
//!
//! While the remote is down, every table's sync and every push would
//! otherwise wait out its full timeout. The circuit fails those calls fast
//! instead; the sync engine treats a rejection as a transient network error,
//! so callers see the same "retry later" signal either way.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use replica_engine::circuit_breaker::{RemoteCircuit, CircuitError};
//! # async fn example() {
//! let circuit = RemoteCircuit::default();
//!
//! match circuit.reads.call(|| async { Ok::<u32, String>(1) }).await {
//!     Ok(_) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, try later */ }
//!     Err(CircuitError::Inner(_e)) => { /* remote error */ }
//! }
//! # }
//! ```

use crate::config::PushConfig;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Settings for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure rate over the window (0.0-1.0) that opens the circuit.
    pub failure_rate: f32,
    /// Calls observed (closed state) before the rate is evaluated.
    pub window: usize,
    /// Trial calls allowed while half-open.
    pub half_open_probes: usize,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            window: 20,
            half_open_probes: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Derive from push settings.
    pub fn from_push(push: &PushConfig) -> Self {
        Self {
            failure_rate: push.circuit_failure_rate.clamp(0.0, 1.0),
            window: push.circuit_window.max(1),
            half_open_probes: 3,
            recovery_timeout: push.circuit_recovery(),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window)
            .half_open_len(config.half_open_probes)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run an operation through the circuit. The closure is only invoked
    /// when the circuit admits the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => Ok(result),
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_rejection(&self.name);
                warn!(circuit = %self.name, "Circuit open, call rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Read (fetch) and write (push) circuits for the remote store.
pub struct RemoteCircuit {
    pub reads: CircuitBreaker,
    pub writes: CircuitBreaker,
}

impl Default for RemoteCircuit {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl RemoteCircuit {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            reads: CircuitBreaker::new("remote_reads", config.clone()),
            writes: CircuitBreaker::new("remote_writes", config),
        }
    }

    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            reads_total: self.reads.calls_total(),
            reads_failures: self.reads.failures(),
            reads_rejections: self.reads.rejections(),
            writes_total: self.writes.calls_total(),
            writes_failures: self.writes.failures(),
            writes_rejections: self.writes.rejections(),
        }
    }
}

/// Snapshot of both circuits' counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub reads_total: u64,
    pub reads_failures: u64,
    pub reads_rejections: u64,
    pub writes_total: u64,
    pub writes_failures: u64,
    pub writes_rejections: u64,
}
