//! Completion barrier for parallel fan-out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_core::{Exchange, RouteError};
use tokio::sync::oneshot;

/// Collects branch results and releases them, in index order, exactly once:
/// when every branch has arrived and the branch count has been sealed.
///
/// `expected` stays at `usize::MAX` until [`seal`](Self::seal) so that early
/// arrivals can never fire the barrier while branches are still being
/// scheduled. Both `arrive` and `seal` may observe completion; `fired`
/// keeps the release single-shot.
pub(crate) struct AggregationBarrier {
    arrived: AtomicUsize,
    expected: AtomicUsize,
    fired: AtomicBool,
    slots: Mutex<BTreeMap<usize, Exchange>>,
    release: Mutex<Option<oneshot::Sender<Vec<Exchange>>>>,
}

impl AggregationBarrier {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Vec<Exchange>>) {
        let (tx, rx) = oneshot::channel();
        let barrier = Arc::new(Self {
            arrived: AtomicUsize::new(0),
            expected: AtomicUsize::new(usize::MAX),
            fired: AtomicBool::new(false),
            slots: Mutex::new(BTreeMap::new()),
            release: Mutex::new(Some(tx)),
        });
        (barrier, rx)
    }

    /// Registers branch `index`. `placeholder` is reported, marked failed, if
    /// the guard is dropped before the branch arrives.
    pub(crate) fn branch(self: &Arc<Self>, index: usize, placeholder: Exchange) -> BranchGuard {
        BranchGuard {
            barrier: Arc::clone(self),
            index,
            placeholder: Some(placeholder),
        }
    }

    pub(crate) fn seal(&self, count: usize) {
        self.expected.store(count, Ordering::SeqCst);
        if self.arrived.load(Ordering::SeqCst) == count {
            self.fire();
        }
    }

    fn arrive(&self, index: usize, exchange: Exchange) {
        self.slots.lock().insert(index, exchange);
        let arrived = self.arrived.fetch_add(1, Ordering::SeqCst) + 1;
        if arrived == self.expected.load(Ordering::SeqCst) {
            self.fire();
        }
    }

    fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let results: Vec<Exchange> = std::mem::take(&mut *self.slots.lock()).into_values().collect();
        if let Some(tx) = self.release.lock().take() {
            // The receiver is gone only if the fan-out itself was dropped.
            let _ = tx.send(results);
        }
    }
}

/// Arrival handle owned by one branch task.
pub(crate) struct BranchGuard {
    barrier: Arc<AggregationBarrier>,
    index: usize,
    placeholder: Option<Exchange>,
}

impl BranchGuard {
    pub(crate) fn arrive(mut self, exchange: Exchange) {
        self.placeholder = None;
        self.barrier.arrive(self.index, exchange);
    }
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        if let Some(mut placeholder) = self.placeholder.take() {
            tracing::warn!(branch = self.index, "fan-out branch terminated without completing");
            placeholder.set_exception(RouteError::aggregation(format!(
                "branch {} terminated without completing",
                self.index
            )));
            self.barrier.arrive(self.index, placeholder);
        }
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::{Body, ExchangeContext, TypeConverterRegistry};

    use super::*;

    fn exchange(body: &str) -> Exchange {
        let ctx = ExchangeContext::new(Arc::new(TypeConverterRegistry::empty()));
        Exchange::with_body(Arc::new(ctx), body)
    }

    fn bodies(results: &[Exchange]) -> Vec<&str> {
        results.iter().filter_map(|e| e.body().and_then(Body::as_str)).collect()
    }

    #[test]
    fn zero_branches_fire_on_seal() {
        let (barrier, mut rx) = AggregationBarrier::new();
        barrier.seal(0);
        assert!(rx.try_recv().unwrap().is_empty());
    }

    #[test]
    fn early_arrivals_wait_for_seal() {
        let (barrier, mut rx) = AggregationBarrier::new();
        let a = barrier.branch(0, exchange("a"));
        let b = barrier.branch(1, exchange("b"));
        b.arrive(exchange("B"));
        a.arrive(exchange("A"));
        assert!(rx.try_recv().is_err());
        barrier.seal(2);
        assert_eq!(bodies(&rx.try_recv().unwrap()), vec!["A", "B"]);
    }

    #[test]
    fn dropped_guard_reports_failure() {
        let (barrier, mut rx) = AggregationBarrier::new();
        let a = barrier.branch(0, exchange("a"));
        let b = barrier.branch(1, exchange("b"));
        barrier.seal(2);
        drop(a);
        b.arrive(exchange("B"));
        let results = rx.try_recv().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].exception().map(RouteError::kind),
            Some(switchyard_core::ErrorKind::Aggregation)
        );
        assert!(!results[1].is_failed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_arrivals_release_once() {
        let (barrier, rx) = AggregationBarrier::new();
        let mut handles = Vec::new();
        for i in 0..64 {
            let guard = barrier.branch(i, exchange("p"));
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                guard.arrive(exchange(&i.to_string()));
            }));
        }
        barrier.seal(64);
        for h in handles {
            h.await.unwrap();
        }
        let results = rx.await.unwrap();
        assert_eq!(results.len(), 64);
        assert_eq!(results[63].body().and_then(Body::as_str), Some("63"));
    }
}
