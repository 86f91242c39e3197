//! Multicast and split: route copies of one exchange through child
//! sub-graphs and merge the results back with an aggregation strategy.

use std::sync::Arc;

use switchyard_core::exchange::properties;
use switchyard_core::{Exchange, Outcome, RouteError};
use tracing::debug;

use crate::graph::{MulticastNode, NodeRef, SplitNode};
use crate::routing::aggregation::{merge, AggregationStrategy};
use crate::routing::barrier::{AggregationBarrier, BranchGuard};
use crate::routing::traversal::{drive, Advance, RouteScope, Traversal};

/// Child exchanges paired with the sub-graph each one runs through.
type Branches = Box<dyn Iterator<Item = (Exchange, NodeRef)> + Send>;

struct FanOut {
    scope: RouteScope,
    strategy: Arc<dyn AggregationStrategy>,
    stop_on_exception: bool,
}

pub(crate) fn multicast(scope: &RouteScope, node: &MulticastNode, original: Exchange) -> Outcome {
    let total = node.branches.len();
    let children: Vec<(Exchange, NodeRef)> = node
        .branches
        .iter()
        .enumerate()
        .map(|(index, branch)| {
            let mut child = original.copy();
            child.set_property(properties::MULTICAST_INDEX, index);
            child.set_property(properties::MULTICAST_COMPLETE, index + 1 == total);
            (child, Arc::clone(branch))
        })
        .collect();

    let fan_out = FanOut {
        scope: scope.clone(),
        strategy: Arc::clone(&node.strategy),
        stop_on_exception: node.stop_on_exception,
    };
    fan_out.run(original, Box::new(children.into_iter()), node.parallel)
}

pub(crate) fn split(scope: &RouteScope, node: &SplitNode, mut original: Exchange) -> Outcome {
    let parts = match node.expression.split(&original) {
        Ok(parts) => parts,
        Err(e) => {
            original.set_exception(e);
            return Outcome::Complete(original);
        }
    };

    let template = original.copy();
    let body = Arc::clone(&node.body);
    let mut parts = parts.peekable();
    let mut index = 0usize;
    let children = std::iter::from_fn(move || {
        let part = parts.next()?;
        let mut child = template.copy();
        child.set_body(part);
        child.set_property(properties::SPLIT_INDEX, index);
        let last = parts.peek().is_none();
        child.set_property(properties::SPLIT_COMPLETE, last);
        if last {
            child.set_property(properties::SPLIT_SIZE, index + 1);
        }
        index += 1;
        Some((child, Arc::clone(&body)))
    });

    let fan_out = FanOut {
        scope: scope.clone(),
        strategy: Arc::clone(&node.strategy),
        stop_on_exception: node.stop_on_exception,
    };
    fan_out.run(original, Box::new(children), node.parallel)
}

impl FanOut {
    fn run(self, original: Exchange, branches: Branches, parallel: bool) -> Outcome {
        if parallel {
            Outcome::Pending(Box::pin(self.parallel(original, branches)))
        } else {
            self.sequential(original, branches)
        }
    }

    /// Runs branches one after another on the caller's turn until one
    /// suspends; the rest then continue inside the returned future.
    fn sequential(self, mut original: Exchange, mut branches: Branches) -> Outcome {
        let mut done = Vec::new();
        while let Some((child, node)) = branches.next() {
            let mut traversal = Traversal::new(self.scope.clone(), node);
            match traversal.advance(child) {
                Advance::Finished(result) => {
                    let failed = result.is_failed();
                    done.push(result);
                    if failed && self.stop_on_exception {
                        break;
                    }
                }
                suspended @ Advance::Suspended(_) => {
                    return Outcome::Pending(Box::pin(async move {
                        let result = drive(traversal, suspended).await;
                        let failed = result.is_failed();
                        done.push(result);
                        if !(failed && self.stop_on_exception) {
                            while let Some((child, node)) = branches.next() {
                                let mut traversal = Traversal::new(self.scope.clone(), node);
                                let step = traversal.advance(child);
                                let result = drive(traversal, step).await;
                                let failed = result.is_failed();
                                done.push(result);
                                if failed && self.stop_on_exception {
                                    break;
                                }
                            }
                        }
                        merge(self.strategy.as_ref(), &mut original, done);
                        original
                    }));
                }
            }
        }
        merge(self.strategy.as_ref(), &mut original, done);
        Outcome::Complete(original)
    }

    /// Spawns every branch as its own task and waits for the barrier.
    async fn parallel(self, mut original: Exchange, branches: Branches) -> Exchange {
        let (barrier, released) = AggregationBarrier::new();
        let mut count = 0usize;
        for (index, (child, node)) in branches.enumerate() {
            let guard = barrier.branch(index, child.copy());
            tokio::spawn(run_branch(self.scope.clone(), node, child, guard));
            count += 1;
        }
        barrier.seal(count);
        debug!(route = %self.scope.route_id, branches = count, "parallel fan-out scheduled");

        match released.await {
            Ok(results) => merge(self.strategy.as_ref(), &mut original, results),
            Err(_) => original.set_exception(RouteError::aggregation(
                "fan-out barrier dropped before release",
            )),
        }
        original
    }
}

/// One parallel branch. A permit from the engine-wide limit is held only
/// while the traversal runs synchronous steps, never across a suspension, so
/// nested fan-outs cannot starve each other of permits.
async fn run_branch(scope: RouteScope, node: NodeRef, child: Exchange, guard: BranchGuard) {
    let limit = Arc::clone(&scope.parallel_limit);
    let route = scope.cancellation.clone();
    let mut traversal = Traversal::new(scope, node);
    let mut step = {
        let _permit = limit.acquire().await.ok();
        traversal.advance(child)
    };
    loop {
        match step {
            Advance::Finished(result) => {
                guard.arrive(result);
                return;
            }
            Advance::Suspended(suspension) => {
                let exchange = suspension.resolve(&route).await;
                let _permit = limit.acquire().await.ok();
                step = traversal.resume(exchange);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use switchyard_core::{
        async_processor, processor_fn, AsyncProcessor, Body, ErrorKind, ExchangeContext,
        TypeConverterRegistry, Value,
    };
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::graph::split::Tokenize;
    use crate::graph::Node;
    use crate::routing::aggregation::{CollectBodies, Join, UseLatest, UseOriginal};

    fn scope(limit: usize) -> RouteScope {
        RouteScope::new("fanout", CancellationToken::new(), Arc::new(Semaphore::new(limit)))
    }

    fn exchange(body: &str) -> Exchange {
        let ctx = ExchangeContext::new(Arc::new(TypeConverterRegistry::default()));
        Exchange::with_body(Arc::new(ctx), body)
    }

    fn set_body(text: &'static str) -> NodeRef {
        Arc::new(Node::Process {
            label: "set".into(),
            processor: processor_fn("set", move |ex| {
                ex.set_body(text);
                Ok(())
            }),
        })
    }

    fn upper() -> NodeRef {
        Arc::new(Node::Process {
            label: "upper".into(),
            processor: processor_fn("upper", |ex| {
                let text: String = ex.body_as()?;
                ex.set_body(text.to_uppercase());
                Ok(())
            }),
        })
    }

    struct Sleep(u64);

    #[async_trait::async_trait]
    impl AsyncProcessor for Sleep {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), RouteError> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            let text: String = exchange.body_as()?;
            exchange.set_body(format!("{text}@{}", self.0));
            Ok(())
        }
    }

    fn sleep(ms: u64) -> NodeRef {
        Arc::new(Node::Process {
            label: "sleep".into(),
            processor: async_processor("sleep", Sleep(ms)),
        })
    }

    fn complete(outcome: Outcome) -> Exchange {
        match outcome {
            Outcome::Complete(ex) => ex,
            Outcome::Pending(_) => panic!("expected synchronous completion"),
        }
    }

    async fn resolved(outcome: Outcome) -> Exchange {
        match outcome {
            Outcome::Complete(ex) => ex,
            Outcome::Pending(future) => future.await,
        }
    }

    struct Counting {
        calls: AtomicUsize,
        seen: AtomicUsize,
    }

    impl AggregationStrategy for Counting {
        fn aggregate(&self, _: &mut Exchange, branches: Vec<Exchange>) -> Result<(), RouteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.store(branches.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn sequential_multicast_completes_inline() {
        let node = MulticastNode {
            branches: vec![set_body("a"), set_body("b")],
            parallel: false,
            strategy: Arc::new(Join {
                delimiter: ",".into(),
            }),
            stop_on_exception: false,
        };
        let done = complete(multicast(&scope(2), &node, exchange("x")));
        assert_eq!(done.body().and_then(Body::as_str), Some("a,b"));
        assert_eq!(done.property(properties::AGGREGATED_SIZE), Some(&Value::Int(2)));
    }

    #[test]
    fn zero_branches_invoke_strategy_once() {
        let strategy = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            seen: AtomicUsize::new(99),
        });
        let node = MulticastNode {
            branches: Vec::new(),
            parallel: false,
            strategy: Arc::clone(&strategy) as Arc<dyn AggregationStrategy>,
            stop_on_exception: false,
        };
        complete(multicast(&scope(2), &node, exchange("x")));
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_multicast_aggregates_in_branch_order() {
        let strategy = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        });
        let node = MulticastNode {
            branches: vec![sleep(30), sleep(1), sleep(15)],
            parallel: true,
            strategy: Arc::clone(&strategy) as Arc<dyn AggregationStrategy>,
            stop_on_exception: false,
        };
        resolved(multicast(&scope(1), &node, exchange("x"))).await;
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.seen.load(Ordering::SeqCst), 3);

        let node = MulticastNode {
            branches: vec![sleep(30), sleep(1), sleep(15)],
            parallel: true,
            strategy: Arc::new(Join {
                delimiter: "|".into(),
            }),
            stop_on_exception: false,
        };
        let done = resolved(multicast(&scope(1), &node, exchange("x"))).await;
        assert_eq!(done.body().and_then(Body::as_str), Some("x@30|x@1|x@15"));
    }

    #[tokio::test]
    async fn parallel_zero_branches_release_immediately() {
        let node = MulticastNode {
            branches: Vec::new(),
            parallel: true,
            strategy: Arc::new(UseLatest),
            stop_on_exception: false,
        };
        let done = resolved(multicast(&scope(1), &node, exchange("x"))).await;
        assert_eq!(done.body().and_then(Body::as_str), Some("x"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nested_parallel_fan_out_does_not_deadlock_on_permits() {
        let inner: NodeRef = Arc::new(Node::Multicast(Arc::new(MulticastNode {
            branches: vec![sleep(2), sleep(2)],
            parallel: true,
            strategy: Arc::new(UseLatest),
            stop_on_exception: false,
        })));
        let node = MulticastNode {
            branches: vec![Arc::clone(&inner), Arc::clone(&inner), inner],
            parallel: true,
            strategy: Arc::new(CollectBodies),
            stop_on_exception: false,
        };
        let done = tokio::time::timeout(
            Duration::from_secs(5),
            resolved(multicast(&scope(1), &node, exchange("x"))),
        )
        .await
        .expect("nested fan-out must finish");
        assert!(!done.is_failed());
    }

    #[test]
    fn split_marks_index_and_completion() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record: NodeRef = {
            let seen = Arc::clone(&seen);
            Arc::new(Node::Process {
                label: "record".into(),
                processor: processor_fn("record", move |ex| {
                    seen.lock().push((
                        ex.property(properties::SPLIT_INDEX).cloned(),
                        ex.property(properties::SPLIT_COMPLETE).cloned(),
                    ));
                    Ok(())
                }),
            })
        };
        let node = SplitNode {
            expression: Arc::new(Tokenize { token: ",".into() }),
            body: record,
            parallel: false,
            strategy: Arc::new(UseOriginal),
            stop_on_exception: false,
        };
        let done = complete(split(&scope(1), &node, exchange("a,b,c")));
        assert_eq!(done.body().and_then(Body::as_str), Some("a,b,c"));
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (Some(Value::Int(0)), Some(Value::Bool(false))));
        assert_eq!(seen[2], (Some(Value::Int(2)), Some(Value::Bool(true))));
    }

    #[test]
    fn failing_branch_fails_parent_and_stops_when_asked() {
        let hits = Arc::new(AtomicUsize::new(0));
        let body: NodeRef = {
            let hits = Arc::clone(&hits);
            Arc::new(Node::Process {
                label: "maybe".into(),
                processor: processor_fn("maybe", move |ex| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if ex.body_as::<String>()? == "bad" {
                        return Err(RouteError::processing("maybe", "bad part"));
                    }
                    Ok(())
                }),
            })
        };
        let node = SplitNode {
            expression: Arc::new(Tokenize { token: ",".into() }),
            body,
            parallel: false,
            strategy: Arc::new(UseOriginal),
            stop_on_exception: true,
        };
        let done = complete(split(&scope(1), &node, exchange("ok,bad,never")));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(done.exception().map(RouteError::kind), Some(ErrorKind::Processing));
    }

    #[tokio::test]
    async fn sequential_split_continues_after_suspension() {
        let body: NodeRef = Arc::new(Node::Pipeline(vec![sleep(1), upper()].into()));
        let node = SplitNode {
            expression: Arc::new(Tokenize { token: " ".into() }),
            body,
            parallel: false,
            strategy: Arc::new(Join {
                delimiter: " ".into(),
            }),
            stop_on_exception: false,
        };
        let outcome = split(&scope(1), &node, exchange("a b c"));
        assert!(matches!(outcome, Outcome::Pending(_)));
        let done = resolved(outcome).await;
        assert_eq!(done.body().and_then(Body::as_str), Some("A@1 B@1 C@1"));
    }
}
