//! Engine lifecycle state with in-flight exchange tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for accurate in-flight tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Engine lifecycle state.
///
/// State machine: Starting -> Started -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Routes may be added; exchanges are rejected.
    Starting,
    /// Consumers are running and exchanges are accepted.
    Started,
    /// No new exchanges are accepted; in-flight ones are finishing.
    Draining,
    /// Consumers are stopped.
    Stopped,
}

/// Coordinates engine shutdown:
/// 1. `submit` checks `state()` before admitting an exchange
/// 2. `trigger_shutdown()` moves to `Draining` and signals listeners
/// 3. `wait_for_drain()` waits until in-flight exchanges complete
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<EngineState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(EngineState::Starting)),
        }
    }

    pub fn set_started(&self) {
        self.state.store(Arc::new(EngineState::Started));
        let _ = self.shutdown_signal.send(false);
    }

    /// Returns a receiver notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals all shutdown receivers.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(EngineState::Draining));
        // Receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
    }

    pub fn set_stopped(&self) {
        self.state.store(Arc::new(EngineState::Stopped));
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state() == EngineState::Started
    }

    /// Creates an RAII guard counting one in-flight exchange. The counter is
    /// decremented when the guard drops, including during unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight exchanges to complete, up to `timeout`.
    ///
    /// Returns `true` when everything drained, `false` when the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
