//! Explicit-continuation walk of a compiled route for one exchange.
//!
//! A [`Traversal`] owns a stack of frames instead of recursing through the
//! graph, so synchronous steps are trampolined in a loop and an asynchronous
//! step simply returns the stack to the caller as a [`Suspension`]. Resuming
//! hands the exchange back and the loop picks up at the next frame, on
//! whichever worker thread the continuation happens to run.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use switchyard_core::exchange::{headers, properties};
use switchyard_core::{Exchange, Message, Outcome, PendingExchange, RouteError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error_handler::policy::{Decision, MaxRedeliveries};
use crate::graph::{ErrorHandlerNode, Node, NodeRef};
use crate::routing::fanout;

/// Per-route facts every traversal of that route needs.
#[derive(Debug, Clone)]
pub struct RouteScope {
    pub route_id: Arc<str>,
    /// Cancelled when the route (or the whole engine) stops.
    pub cancellation: CancellationToken,
    /// Engine-wide bound on concurrently running parallel branches.
    pub parallel_limit: Arc<Semaphore>,
}

impl RouteScope {
    #[must_use]
    pub fn new(
        route_id: impl Into<Arc<str>>,
        cancellation: CancellationToken,
        parallel_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            cancellation,
            parallel_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    Running,
    Suspended,
    Done,
    Failed,
}

/// Result of running a traversal until it finishes or must wait.
#[derive(Debug)]
pub enum Advance {
    Finished(Exchange),
    Suspended(Suspension),
}

/// What a suspended traversal is waiting for.
pub enum Suspension {
    /// An asynchronous step that resolves to the exchange. `cancellation` is
    /// the exchange's token, which a stopping route triggers so the step can
    /// unwind.
    Pending {
        future: PendingExchange,
        cancellation: CancellationToken,
    },
    /// A scheduled redelivery. The exchange is held until the delay elapses
    /// or the exchange is cancelled, whichever comes first.
    Delay { delay: Duration, exchange: Exchange },
}

impl std::fmt::Debug for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suspension::Pending { .. } => f.write_str("Pending"),
            Suspension::Delay { delay, exchange } => f
                .debug_struct("Delay")
                .field("delay", delay)
                .field("exchange", &exchange.id())
                .finish(),
        }
    }
}

impl Suspension {
    /// Waits for the suspension to resolve and returns the exchange.
    pub async fn resolve(self, route: &CancellationToken) -> Exchange {
        match self {
            Suspension::Pending {
                mut future,
                cancellation,
            } => {
                tokio::select! {
                    exchange = &mut future => return exchange,
                    () = route.cancelled() => {}
                }
                cancellation.cancel();
                future.await
            }
            Suspension::Delay { delay, exchange } => {
                let token = exchange.context().cancellation.clone();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {}
                    () = route.cancelled() => {}
                }
                exchange
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardPhase {
    Guarding,
    DeadLettering,
}

struct Guard {
    handler: Arc<ErrorHandlerNode>,
    /// Input message at handler entry, restored on redelivery.
    snapshot: Message,
    attempts: u32,
    phase: GuardPhase,
}

enum Frame {
    Sequence { nodes: Arc<[NodeRef]>, next: usize },
    Enter(NodeRef),
    Guard(Guard),
}

enum Unwind {
    /// A handler pushed new frames; keep running.
    Continue,
    /// A handler scheduled a delayed redelivery.
    Delay(Duration),
    /// No handler took the failure, or the dead-letter channel itself failed.
    Finished,
}

pub struct Traversal {
    scope: RouteScope,
    frames: Vec<Frame>,
    state: TraversalState,
    /// Label of the node whose asynchronous result we are waiting for.
    pending_label: Option<String>,
}

impl Traversal {
    #[must_use]
    pub fn new(scope: RouteScope, root: NodeRef) -> Self {
        Self {
            scope,
            frames: vec![Frame::Enter(root)],
            state: TraversalState::Running,
            pending_label: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> TraversalState {
        self.state
    }

    #[must_use]
    pub fn scope(&self) -> &RouteScope {
        &self.scope
    }

    /// Continues after a suspension resolved.
    pub fn resume(&mut self, mut exchange: Exchange) -> Advance {
        exchange.promote_output();
        if let Some(label) = self.pending_label.take() {
            mark_failure_endpoint(&mut exchange, &label);
        }
        self.advance(exchange)
    }

    /// Runs frames until the traversal finishes or a step suspends.
    pub fn advance(&mut self, mut exchange: Exchange) -> Advance {
        self.state = TraversalState::Running;
        loop {
            if exchange.is_failed() {
                match self.unwind(&mut exchange) {
                    Unwind::Continue => continue,
                    Unwind::Delay(delay) => {
                        self.state = TraversalState::Suspended;
                        return Advance::Suspended(Suspension::Delay { delay, exchange });
                    }
                    Unwind::Finished => return self.finish(exchange),
                }
            }

            let Some(frame) = self.frames.pop() else {
                return self.finish(exchange);
            };

            match frame {
                Frame::Sequence { nodes, next } => {
                    if exchange.is_route_stopped() {
                        continue;
                    }
                    if let Some(node) = nodes.get(next) {
                        let node = Arc::clone(node);
                        self.frames.push(Frame::Sequence {
                            nodes,
                            next: next + 1,
                        });
                        self.frames.push(Frame::Enter(node));
                    }
                }
                Frame::Guard(guard) => {
                    if guard.phase == GuardPhase::DeadLettering {
                        // Dead-letter delivery succeeded: the exchange is handled.
                        self.frames.clear();
                        return self.finish(exchange);
                    }
                }
                Frame::Enter(node) => {
                    if let Some(reason) = self.cancellation_reason(&exchange) {
                        exchange.set_exception(RouteError::cancelled(reason));
                        continue;
                    }
                    let cancellation = exchange.context().cancellation.clone();
                    match self.enter(&node, exchange) {
                        Step::Continue(next) => exchange = next,
                        Step::Suspend(future) => {
                            self.pending_label = Some(node.label().to_string());
                            self.state = TraversalState::Suspended;
                            return Advance::Suspended(Suspension::Pending {
                                future,
                                cancellation,
                            });
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self, exchange: Exchange) -> Advance {
        self.state = if exchange.is_failed() {
            TraversalState::Failed
        } else {
            TraversalState::Done
        };
        Advance::Finished(exchange)
    }

    fn cancellation_reason(&self, exchange: &Exchange) -> Option<&'static str> {
        if exchange.is_cancelled() {
            Some("exchange cancelled")
        } else if self.scope.cancellation.is_cancelled() {
            Some("route stopped")
        } else {
            None
        }
    }

    fn enter(&mut self, node: &NodeRef, mut exchange: Exchange) -> Step {
        match node.as_ref() {
            Node::Pipeline(children) => {
                self.frames.push(Frame::Sequence {
                    nodes: Arc::clone(children),
                    next: 0,
                });
            }
            Node::Choice { when, otherwise } => {
                let mut chosen = None;
                for (predicate, branch) in when {
                    match predicate.matches(&exchange) {
                        Ok(true) => {
                            chosen = Some(branch);
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            exchange.set_exception(e);
                            mark_failure_endpoint(&mut exchange, "choice");
                            return Step::Continue(exchange);
                        }
                    }
                }
                if let Some(branch) = chosen.or(otherwise.as_ref()) {
                    self.frames.push(Frame::Enter(Arc::clone(branch)));
                }
            }
            Node::Filter(predicate) => match predicate.matches(&exchange) {
                Ok(matched) => {
                    exchange.set_property(properties::FILTER_MATCHED, matched);
                    if !matched {
                        debug!(
                            route = %self.scope.route_id,
                            exchange_id = %exchange.id(),
                            "filter rejected exchange"
                        );
                        exchange.stop_route();
                    }
                }
                Err(e) => {
                    exchange.set_exception(e);
                    mark_failure_endpoint(&mut exchange, "filter");
                }
            },
            Node::ErrorHandler(handler) => {
                self.frames.push(Frame::Guard(Guard {
                    handler: Arc::clone(handler),
                    snapshot: exchange.message().clone(),
                    attempts: 0,
                    phase: GuardPhase::Guarding,
                }));
                self.frames.push(Frame::Enter(Arc::clone(&handler.body)));
            }
            Node::Multicast(multicast) => {
                return settle(
                    fanout::multicast(&self.scope, multicast, exchange),
                    node.label(),
                );
            }
            Node::Split(split) => {
                return settle(fanout::split(&self.scope, split, exchange), node.label());
            }
            Node::Process { label, processor } => {
                return settle(processor.process(exchange), label);
            }
        }
        Step::Continue(exchange)
    }

    /// Pops frames up to the nearest guard that takes the failure.
    fn unwind(&mut self, exchange: &mut Exchange) -> Unwind {
        while let Some(frame) = self.frames.pop() {
            let Frame::Guard(mut guard) = frame else {
                continue;
            };
            if guard.phase == GuardPhase::DeadLettering {
                warn!(
                    route = %self.scope.route_id,
                    exchange_id = %exchange.id(),
                    "dead-letter delivery failed"
                );
                self.frames.clear();
                return Unwind::Finished;
            }

            let Some(error) = exchange.exception() else {
                return Unwind::Continue;
            };
            let handler = Arc::clone(&guard.handler);
            let decision =
                handler
                    .policy
                    .decide(error, guard.attempts, handler.dead_letter.is_some());

            match decision {
                Decision::Redeliver { delay } => {
                    self.redeliver(exchange, &mut guard);
                    self.frames.push(Frame::Guard(guard));
                    self.frames.push(Frame::Enter(Arc::clone(&handler.body)));
                    return if delay.is_zero() {
                        Unwind::Continue
                    } else {
                        Unwind::Delay(delay)
                    };
                }
                Decision::DeadLetter => {
                    let Some(dead_letter) = handler.dead_letter.clone() else {
                        continue;
                    };
                    self.dead_letter(exchange, &guard);
                    guard.phase = GuardPhase::DeadLettering;
                    self.frames.push(Frame::Guard(guard));
                    self.frames.push(Frame::Enter(dead_letter));
                    return Unwind::Continue;
                }
                Decision::Propagate => {
                    if guard.attempts > 0 && !error.is_cancellation() {
                        if let Some(last) = exchange.take_exception() {
                            exchange.set_exception(RouteError::RedeliveryExhausted {
                                attempts: guard.attempts,
                                last: Box::new(last),
                            });
                        }
                    }
                }
            }
        }
        Unwind::Finished
    }

    fn redeliver(&self, exchange: &mut Exchange, guard: &mut Guard) {
        let error = exchange.take_exception();
        if guard.handler.policy.restore_on_redelivery {
            exchange.set_message(guard.snapshot.clone());
        }
        exchange.clear_route_stop();
        exchange.remove_property(properties::FAILURE_ENDPOINT);

        guard.attempts += 1;
        exchange.set_property(properties::REDELIVERY_COUNTER, guard.attempts);
        exchange.set_property(properties::REDELIVERED, true);
        if let MaxRedeliveries::Limited(max) = guard.handler.policy.max_redeliveries {
            exchange.set_property(properties::REDELIVERY_MAX_COUNTER, max);
        }

        metrics::counter!("switchyard_redeliveries_total", "route" => self.scope.route_id.to_string())
            .increment(1);
        debug!(
            route = %self.scope.route_id,
            exchange_id = %exchange.id(),
            attempt = guard.attempts,
            error = ?error,
            "redelivering exchange"
        );
    }

    fn dead_letter(&self, exchange: &mut Exchange, guard: &Guard) {
        let Some(error) = exchange.take_exception() else {
            return;
        };
        let endpoint = exchange
            .property(properties::FAILURE_ENDPOINT)
            .map(ToString::to_string)
            .unwrap_or_default();

        if guard.handler.policy.use_original_message {
            exchange.set_message(guard.snapshot.clone());
        }
        let root = error.root();
        exchange.set_header(headers::FAILURE_KIND, root.kind().as_str());
        exchange.set_header(headers::FAILURE_MESSAGE, error.to_string());
        exchange.set_header(headers::FAILURE_ROUTE_ID, self.scope.route_id.to_string());
        exchange.set_header(headers::FAILURE_ENDPOINT, endpoint);
        exchange.set_header(headers::FAILURE_REDELIVERIES, guard.attempts);
        exchange.set_header(headers::FAILURE_TIMESTAMP, epoch_millis());
        exchange.set_property(properties::ERROR_HANDLED, true);
        exchange.clear_route_stop();

        metrics::counter!("switchyard_dead_letters_total", "route" => self.scope.route_id.to_string())
            .increment(1);
        warn!(
            route = %self.scope.route_id,
            exchange_id = %exchange.id(),
            attempts = guard.attempts,
            dead_letter = guard.handler.dead_letter_uri.as_deref().unwrap_or_default(),
            error = %error,
            "moving exchange to dead-letter channel"
        );
        exchange.set_caught_exception(error);
    }
}

enum Step {
    Continue(Exchange),
    Suspend(PendingExchange),
}

fn settle(outcome: Outcome, label: &str) -> Step {
    match outcome {
        Outcome::Complete(mut exchange) => {
            exchange.promote_output();
            mark_failure_endpoint(&mut exchange, label);
            Step::Continue(exchange)
        }
        Outcome::Pending(future) => Step::Suspend(future),
    }
}

fn mark_failure_endpoint(exchange: &mut Exchange, label: &str) {
    if exchange.is_failed() && exchange.property(properties::FAILURE_ENDPOINT).is_none() {
        exchange.set_property(properties::FAILURE_ENDPOINT, label);
    }
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Drives a traversal from `step` to completion, awaiting every suspension.
pub async fn drive(mut traversal: Traversal, mut step: Advance) -> Exchange {
    loop {
        match step {
            Advance::Finished(exchange) => return exchange,
            Advance::Suspended(suspension) => {
                let route = traversal.scope.cancellation.clone();
                let exchange = suspension.resolve(&route).await;
                step = traversal.resume(exchange);
            }
        }
    }
}

/// Runs `root` over `exchange` on a fresh traversal.
pub async fn run(scope: RouteScope, root: NodeRef, exchange: Exchange) -> Exchange {
    let mut traversal = Traversal::new(scope, root);
    let step = traversal.advance(exchange);
    drive(traversal, step).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use switchyard_core::{
        async_processor, processor_fn, AsyncProcessor, Body, ErrorKind, ExchangeContext,
        TypeConverterRegistry, Value,
    };

    use super::*;
    use crate::definition::Comparison;
    use crate::error_handler::policy::{Backoff, RedeliveryPolicy};
    use crate::graph::Predicate;

    fn scope() -> RouteScope {
        RouteScope::new("test", CancellationToken::new(), Arc::new(Semaphore::new(4)))
    }

    fn exchange(body: &str) -> Exchange {
        let ctx = ExchangeContext::new(Arc::new(TypeConverterRegistry::default()));
        Exchange::with_body(Arc::new(ctx), body)
    }

    fn process(
        label: &str,
        f: impl Fn(&mut Exchange) -> Result<(), RouteError> + Send + Sync + 'static,
    ) -> NodeRef {
        Arc::new(Node::Process {
            label: label.to_string(),
            processor: processor_fn(label, f),
        })
    }

    fn pipeline(nodes: Vec<NodeRef>) -> NodeRef {
        Arc::new(Node::Pipeline(nodes.into()))
    }

    fn counter(hits: &Arc<AtomicUsize>) -> NodeRef {
        let hits = Arc::clone(hits);
        process("count", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn always_fail(calls: &Arc<AtomicUsize>) -> NodeRef {
        let calls = Arc::clone(calls);
        process("fail", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RouteError::processing("fail", "boom"))
        })
    }

    fn guarded(body: NodeRef, max: u32, dead_letter: Option<NodeRef>) -> NodeRef {
        Arc::new(Node::ErrorHandler(Arc::new(ErrorHandlerNode {
            policy: RedeliveryPolicy {
                max_redeliveries: MaxRedeliveries::Limited(max),
                ..RedeliveryPolicy::default()
            },
            body,
            dead_letter_uri: dead_letter.as_ref().map(|_| "mock:dlq".to_string()),
            dead_letter,
        })))
    }

    fn finished(advance: Advance) -> Exchange {
        match advance {
            Advance::Finished(exchange) => exchange,
            Advance::Suspended(s) => panic!("expected synchronous completion, got {s:?}"),
        }
    }

    #[test]
    fn synchronous_pipeline_runs_in_order_without_suspending() {
        let trail = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let steps = (0..5)
            .map(|i| {
                let trail = Arc::clone(&trail);
                process("step", move |_| {
                    trail.lock().push(i);
                    Ok(())
                })
            })
            .collect();
        let mut traversal = Traversal::new(scope(), pipeline(steps));
        let done = finished(traversal.advance(exchange("x")));
        assert!(!done.is_failed());
        assert_eq!(traversal.state(), TraversalState::Done);
        assert_eq!(*trail.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn deep_pipelines_do_not_grow_the_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut root = counter(&hits);
        for _ in 0..1_000 {
            root = pipeline(vec![root]);
        }
        let steps = (0..10_000).map(|_| counter(&hits)).collect();
        let mut traversal = Traversal::new(scope(), pipeline(vec![root, pipeline(steps)]));
        finished(traversal.advance(exchange("x")));
        assert_eq!(hits.load(Ordering::SeqCst), 10_001);
    }

    #[test]
    fn output_is_promoted_between_steps() {
        let root = pipeline(vec![
            process("out", |ex| {
                ex.set_output(Message::with_body("replaced"));
                Ok(())
            }),
            process("check", |ex| {
                assert_eq!(ex.body().and_then(Body::as_str), Some("replaced"));
                Ok(())
            }),
        ]);
        let done = finished(Traversal::new(scope(), root).advance(exchange("x")));
        assert!(!done.is_failed());
    }

    #[test]
    fn failure_stops_pipeline_and_records_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let root = pipeline(vec![always_fail(&calls), counter(&hits)]);
        let mut traversal = Traversal::new(scope(), root);
        let done = finished(traversal.advance(exchange("x")));
        assert_eq!(traversal.state(), TraversalState::Failed);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(
            done.property(properties::FAILURE_ENDPOINT),
            Some(&Value::from("fail"))
        );
    }

    #[test]
    fn rejected_filter_stops_branch_without_failure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = pipeline(vec![
            Arc::new(Node::Filter(Predicate::BodyLength {
                op: Comparison::Gt,
                value: 3,
            })),
            counter(&hits),
        ]);
        let done = finished(Traversal::new(scope(), Arc::clone(&root)).advance(exchange("ab")));
        assert!(!done.is_failed());
        assert_eq!(done.property(properties::FILTER_MATCHED), Some(&Value::Bool(false)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        finished(Traversal::new(scope(), root).advance(exchange("abcd")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn choice_takes_first_match_then_otherwise() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));
        let root: NodeRef = Arc::new(Node::Choice {
            when: vec![
                (Predicate::BodyContains("a".into()), counter(&first)),
                (Predicate::BodyContains("ab".into()), counter(&second)),
            ],
            otherwise: Some(counter(&other)),
        });
        finished(Traversal::new(scope(), Arc::clone(&root)).advance(exchange("ab")));
        finished(Traversal::new(scope(), root).advance(exchange("zz")));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redelivery_then_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = guarded(always_fail(&calls), 2, None);
        let done = finished(Traversal::new(scope(), root).advance(exchange("x")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let Some(RouteError::RedeliveryExhausted { attempts, last }) = done.exception() else {
            panic!("expected exhaustion, got {:?}", done.exception());
        };
        assert_eq!(*attempts, 2);
        assert_eq!(last.kind(), ErrorKind::Processing);
        assert_eq!(done.property(properties::REDELIVERY_COUNTER), Some(&Value::Int(2)));
    }

    #[test]
    fn redelivery_restores_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let body = {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            process("mutate", move |ex| {
                seen.lock().push(ex.body_as::<String>()?);
                ex.set_body("mutated");
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RouteError::processing("mutate", "first attempt"))
                } else {
                    Ok(())
                }
            })
        };
        let done = finished(Traversal::new(scope(), guarded(body, 3, None)).advance(exchange("x")));
        assert!(!done.is_failed());
        assert_eq!(*seen.lock(), vec!["x", "x"]);
        assert_eq!(done.property(properties::REDELIVERED), Some(&Value::Bool(true)));
    }

    #[test]
    fn dead_letter_handles_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dead = Arc::new(parking_lot::Mutex::new(None));
        let dlq = {
            let dead = Arc::clone(&dead);
            process("dlq", move |ex| {
                *dead.lock() = ex.header(headers::FAILURE_KIND).cloned();
                Ok(())
            })
        };
        let hits = Arc::new(AtomicUsize::new(0));
        let root = pipeline(vec![guarded(always_fail(&calls), 1, Some(dlq)), counter(&hits)]);
        let mut traversal = Traversal::new(scope(), root);
        let done = finished(traversal.advance(exchange("x")));
        assert_eq!(traversal.state(), TraversalState::Done);
        assert!(!done.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*dead.lock(), Some(Value::from("processing")));
        assert!(done.caught_exception().is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_dead_letter_fails_the_exchange() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dlq_calls = Arc::new(AtomicUsize::new(0));
        let inner = guarded(always_fail(&calls), 0, Some(always_fail(&dlq_calls)));
        let outer_dlq_hits = Arc::new(AtomicUsize::new(0));
        let root = guarded(inner, 0, Some(counter(&outer_dlq_hits)));
        let mut traversal = Traversal::new(scope(), root);
        let done = finished(traversal.advance(exchange("x")));
        assert_eq!(traversal.state(), TraversalState::Failed);
        assert!(done.is_failed());
        assert_eq!(dlq_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outer_dlq_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rejecting_filter_inside_choice_stops_the_whole_branch() {
        let inside = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let choice = Arc::new(Node::Choice {
            when: vec![(
                Predicate::Constant(true),
                pipeline(vec![
                    Arc::new(Node::Filter(Predicate::Constant(false))),
                    counter(&inside),
                ]),
            )],
            otherwise: None,
        });
        let root = pipeline(vec![choice, counter(&after)]);
        let done = finished(Traversal::new(scope(), root).advance(exchange("x")));
        assert!(!done.is_failed());
        assert!(done.is_route_stopped());
        assert_eq!(inside.load(Ordering::SeqCst), 0);
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exhausted_inner_handler_is_not_retried_by_outer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = guarded(always_fail(&calls), 1, None);
        let root = guarded(inner, 5, None);
        let done = finished(Traversal::new(scope(), root).advance(exchange("x")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            done.exception().map(RouteError::kind),
            Some(ErrorKind::RedeliveryExhausted)
        );
    }

    #[test]
    fn cancelled_exchange_skips_remaining_nodes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = pipeline(vec![
            process("cancel", |ex| {
                ex.context().cancel();
                Ok(())
            }),
            counter(&hits),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let done = finished(
            Traversal::new(scope(), guarded(root, 3, Some(always_fail(&calls)))).advance(exchange("x")),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(done.exception().map(RouteError::kind), Some(ErrorKind::Cancellation));
    }

    struct Later;

    #[async_trait::async_trait]
    impl AsyncProcessor for Later {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), RouteError> {
            tokio::task::yield_now().await;
            let text: String = exchange.body_as()?;
            exchange.set_body(format!("{text}!"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn async_steps_suspend_and_resume() {
        let root = pipeline(vec![
            Arc::new(Node::Process {
                label: "later".into(),
                processor: async_processor("later", Later),
            }),
            process("upper", |ex| {
                let text: String = ex.body_as()?;
                ex.set_body(text.to_uppercase());
                Ok(())
            }),
        ]);
        let mut traversal = Traversal::new(scope(), root);
        let step = traversal.advance(exchange("hi"));
        assert!(matches!(step, Advance::Suspended(Suspension::Pending { .. })));
        assert_eq!(traversal.state(), TraversalState::Suspended);
        let done = drive(traversal, step).await;
        assert_eq!(done.body().and_then(Body::as_str), Some("HI!"));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_delay_is_scheduled_not_blocking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = Arc::new(Node::ErrorHandler(Arc::new(ErrorHandlerNode {
            policy: RedeliveryPolicy {
                max_redeliveries: MaxRedeliveries::Limited(1),
                backoff: Backoff::Fixed(Duration::from_secs(5)),
                ..RedeliveryPolicy::default()
            },
            body: always_fail(&calls),
            dead_letter: None,
            dead_letter_uri: None,
        })));
        let mut traversal = Traversal::new(scope(), root);
        let step = traversal.advance(exchange("x"));
        assert!(matches!(step, Advance::Suspended(Suspension::Delay { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let done = drive(traversal, step).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(done.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_redelivery_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let root = Arc::new(Node::ErrorHandler(Arc::new(ErrorHandlerNode {
            policy: RedeliveryPolicy {
                max_redeliveries: MaxRedeliveries::Unbounded,
                backoff: Backoff::Fixed(Duration::from_secs(3600)),
                ..RedeliveryPolicy::default()
            },
            body: always_fail(&calls),
            dead_letter: None,
            dead_letter_uri: None,
        })));
        let ex = exchange("x");
        let ctx = Arc::clone(ex.context());
        let handle = tokio::spawn(run(scope(), root, ex));
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        ctx.cancel();
        let done = handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(done.exception().map(RouteError::kind), Some(ErrorKind::Cancellation));
    }

    #[tokio::test]
    async fn route_stop_interrupts_pending_step_of_foreign_exchange() {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = pipeline(vec![
            Arc::new(Node::Process {
                label: "delay".into(),
                processor: crate::graph::steps::Delay::new(Duration::from_secs(60)),
            }),
            counter(&hits),
        ]);
        let route = CancellationToken::new();
        let scope = RouteScope::new("test", route.clone(), Arc::new(Semaphore::new(4)));
        // The exchange's token is not derived from the route's.
        let ex = exchange("x");
        let ctx = Arc::clone(ex.context());
        let handle = tokio::spawn(run(scope, root, ex));
        tokio::time::sleep(Duration::from_millis(20)).await;
        route.cancel();

        let done = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("route stop must end the delay")
            .unwrap();
        assert!(ctx.cancellation.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(done.exception().map(RouteError::kind), Some(ErrorKind::Cancellation));
    }
}
