//! End-to-end routing scenarios through the public engine API.

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::exchange::{headers, properties};
use switchyard_core::{
    async_processor, processor_fn, AsyncProcessor, Exchange, ExchangePattern, RouteError, Value,
};
use switchyard_engine::routing::aggregation::AggregationStrategy;
use switchyard_engine::{
    Beans, Completion, EngineConfig, EngineError, MockEndpoint, RoutingEngine,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn started(beans: Beans, routes: &str) -> RoutingEngine {
    let engine = RoutingEngine::builder().beans(beans).build();
    engine.add_routes_json(routes).unwrap();
    engine.start().await.unwrap();
    engine
}

fn mock(engine: &RoutingEngine, uri: &str) -> Arc<MockEndpoint> {
    engine.endpoint::<MockEndpoint>(uri).unwrap().unwrap()
}

fn text(exchange: &Exchange) -> String {
    exchange.body_as::<String>().unwrap_or_default()
}

/// Processor that records `tag` each time it runs.
fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn switchyard_core::Processor> {
    let log = Arc::clone(log);
    processor_fn(tag, move |_| {
        log.lock().push(tag);
        Ok(())
    })
}

struct SleepThenTag {
    millis: u64,
    tag: &'static str,
}

#[async_trait]
impl AsyncProcessor for SleepThenTag {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), RouteError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        exchange.set_body(self.tag);
        Ok(())
    }
}

/// Strategy that counts its invocations and the branches it was given.
#[derive(Default)]
struct CountingStrategy {
    calls: AtomicUsize,
    branches: Mutex<Vec<String>>,
}

impl AggregationStrategy for CountingStrategy {
    fn aggregate(&self, original: &mut Exchange, branches: Vec<Exchange>) -> Result<(), RouteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bodies: Vec<String> = branches.iter().map(text).collect();
        original.set_body(bodies.join("+"));
        *self.branches.lock() = bodies;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipelines and filters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_runs_each_step_once_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut beans = Beans::new();
    for tag in ["one", "two", "three", "four"] {
        beans.register_processor(tag, recorder(tag, &log));
    }
    let engine = started(
        beans,
        r#"[{ "id": "p", "from": "direct:p", "steps": [
            { "type": "process", "ref": "one" },
            { "type": "process", "ref": "two" },
            { "type": "process", "ref": "three" },
            { "type": "process", "ref": "four" }
        ]}]"#,
    )
    .await;

    engine.process("p", engine.create_exchange()).await.unwrap();
    assert_eq!(*log.lock(), vec!["one", "two", "three", "four"]);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn uppercase_filter_counter_scenario() {
    let counted = Arc::new(AtomicUsize::new(0));
    let mut beans = Beans::new();
    beans.register_processor(
        "uppercase",
        processor_fn("uppercase", |ex| {
            let upper = ex.body_as::<String>()?.to_uppercase();
            ex.set_body(upper);
            Ok(())
        }),
    );
    let seen = Arc::clone(&counted);
    beans.register_processor(
        "counter",
        processor_fn("counter", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let engine = started(
        beans,
        r#"{ "routes": [{ "id": "s", "from": "direct:s", "steps": [
            { "type": "process", "ref": "uppercase" },
            { "type": "filter", "predicate": { "type": "bodyLength", "op": "gt", "value": 3 } },
            { "type": "process", "ref": "counter" }
        ]}]}"#,
    )
    .await;

    let short = engine.process("s", engine.create_exchange_with_body("ab")).await.unwrap();
    assert_eq!(text(&short), "AB");
    assert!(!short.is_failed());
    assert_eq!(short.property(properties::FILTER_MATCHED), Some(&Value::Bool(false)));
    assert_eq!(counted.load(Ordering::SeqCst), 0);

    let long = engine.process("s", engine.create_exchange_with_body("abcd")).await.unwrap();
    assert_eq!(text(&long), "ABCD");
    assert_eq!(counted.load(Ordering::SeqCst), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn choice_takes_the_first_matching_branch() {
    let engine = started(
        Beans::new(),
        r#"[{ "id": "c", "from": "direct:c", "steps": [
            { "type": "choice",
              "when": [
                { "predicate": { "type": "headerEquals", "name": "kind", "value": "gold" },
                  "steps": [{ "type": "to", "uri": "mock:gold" }] },
                { "predicate": { "type": "headerExists", "name": "kind" },
                  "steps": [{ "type": "to", "uri": "mock:any" }] }
              ],
              "otherwise": [{ "type": "to", "uri": "mock:none" }] }
        ]}]"#,
    )
    .await;

    for kind in [Some("gold"), Some("silver"), None] {
        let mut ex = engine.create_exchange_with_body("x");
        if let Some(kind) = kind {
            ex.set_header("kind", kind);
        }
        engine.process("c", ex).await.unwrap();
    }
    assert_eq!(mock(&engine, "mock:gold").received_count(), 1);
    assert_eq!(mock(&engine, "mock:any").received_count(), 1);
    assert_eq!(mock(&engine, "mock:none").received_count(), 1);
    engine.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_multicast_aggregates_once_after_every_branch() {
    let strategy = Arc::new(CountingStrategy::default());
    let mut beans = Beans::new();
    beans.register_strategy("counting", Arc::clone(&strategy) as Arc<dyn AggregationStrategy>);
    for (name, millis) in [("slow", 40), ("medium", 20), ("fast", 1)] {
        beans.register_processor(name, async_processor(name, SleepThenTag { millis, tag: name }));
    }
    let engine = started(
        beans,
        r#"[{ "id": "m", "from": "direct:m", "steps": [
            { "type": "multicast", "parallel": true,
              "strategy": { "type": "ref", "ref": "counting" },
              "branches": [
                [{ "type": "process", "ref": "slow" }],
                [{ "type": "process", "ref": "medium" }],
                [{ "type": "process", "ref": "fast" }]
              ] }
        ]}]"#,
    )
    .await;

    let done = engine.process("m", engine.create_exchange_with_body("x")).await.unwrap();
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
    // Branches are handed over in declaration order, not completion order.
    assert_eq!(*strategy.branches.lock(), vec!["slow", "medium", "fast"]);
    assert_eq!(text(&done), "slow+medium+fast");
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn empty_multicast_aggregates_immediately() {
    let strategy = Arc::new(CountingStrategy::default());
    let mut beans = Beans::new();
    beans.register_strategy("counting", Arc::clone(&strategy) as Arc<dyn AggregationStrategy>);
    let engine = started(
        beans,
        r#"[{ "id": "m", "from": "direct:m", "steps": [
            { "type": "multicast", "parallel": true, "branches": [],
              "strategy": { "type": "ref", "ref": "counting" } }
        ]}]"#,
    )
    .await;

    engine.process("m", engine.create_exchange_with_body("x")).await.unwrap();
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn failed_branch_is_aggregated_and_fails_the_parent() {
    let strategy = Arc::new(CountingStrategy::default());
    let mut beans = Beans::new();
    beans.register_strategy("counting", Arc::clone(&strategy) as Arc<dyn AggregationStrategy>);
    beans.register_processor("ok", async_processor("ok", SleepThenTag { millis: 5, tag: "ok" }));
    beans.register_processor(
        "bad",
        processor_fn("bad", |_| Err(RouteError::processing("bad", "branch broke"))),
    );
    let engine = started(
        beans,
        r#"[{ "id": "m", "from": "direct:m", "steps": [
            { "type": "multicast", "parallel": true,
              "strategy": { "type": "ref", "ref": "counting" },
              "branches": [
                [{ "type": "process", "ref": "ok" }],
                [{ "type": "process", "ref": "bad" }]
              ] }
        ]}]"#,
    )
    .await;

    let err = engine
        .process("m", engine.create_exchange_with_body("x"))
        .await
        .unwrap_err();
    assert!(err
        .route_error()
        .is_some_and(|e| e.to_string().contains("branch broke")));
    assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
    assert_eq!(strategy.branches.lock().len(), 2);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn callback_runs_once_when_a_processor_panics_after_suspending() {
    let mut beans = Beans::new();
    beans.register_processor("explode", processor_fn("explode", |_| panic!("processor blew up")));
    let engine = started(
        beans,
        r#"[{ "id": "p", "from": "direct:p", "steps": [
            { "type": "delay", "millis": 5 },
            { "type": "process", "ref": "explode" }
        ]}]"#,
    )
    .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(None));
    let ex = engine.create_exchange_with_body("x");
    let id = ex.id();
    let submission = {
        let calls = Arc::clone(&calls);
        let last = Arc::clone(&last);
        engine.submit("p", ex, move |c: Completion| {
            calls.fetch_add(1, Ordering::SeqCst);
            *last.lock() = Some(c);
        })
    };
    assert!(!submission.is_synchronous());
    submission.wait().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let completion = last.lock().take().unwrap();
    assert_eq!(completion.exchange().id(), id);
    assert!(matches!(
        completion.into_result(),
        Err(EngineError::ExchangeFailed { exchange_id, .. }) if exchange_id == id
    ));
    assert_eq!(engine.in_flight_count(), 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn split_routes_each_part_and_joins_the_results() {
    let engine = started(
        Beans::new(),
        r#"[{ "id": "split", "from": "direct:split", "steps": [
            { "type": "split",
              "expression": { "type": "tokenize", "token": "," },
              "strategy": { "type": "join", "delimiter": "|" },
              "steps": [
                { "type": "setBody", "expression": { "type": "template", "template": "<${body}>" } },
                { "type": "to", "uri": "mock:parts" }
              ] }
        ]}]"#,
    )
    .await;

    let done = engine
        .process("split", engine.create_exchange_with_body("a,b,c"))
        .await
        .unwrap();
    assert_eq!(text(&done), "<a>|<b>|<c>");
    let parts = mock(&engine, "mock:parts").received_exchanges();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[2].property(properties::SPLIT_COMPLETE), Some(&Value::Bool(true)));
    assert_eq!(parts[2].property(properties::SPLIT_SIZE), Some(&Value::Int(3)));
    engine.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Redelivery and dead letters
// ---------------------------------------------------------------------------

fn always_failing(calls: &Arc<AtomicUsize>) -> Beans {
    let calls = Arc::clone(calls);
    let mut beans = Beans::new();
    beans.register_processor(
        "flaky",
        processor_fn("flaky", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RouteError::processing("flaky", "always fails"))
        }),
    );
    beans
}

#[tokio::test]
async fn exhausted_redeliveries_fail_the_exchange() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = started(
        always_failing(&calls),
        r#"[{ "id": "r", "from": "direct:r",
              "errorHandler": { "maxRedeliveries": 2, "redeliveryDelayMs": 5 },
              "steps": [{ "type": "process", "ref": "flaky" }] }]"#,
    )
    .await;

    let err = engine
        .process("r", engine.create_exchange_with_body("x"))
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err.route_error() {
        Some(RouteError::RedeliveryExhausted { attempts, .. }) => assert_eq!(*attempts, 2),
        other => panic!("expected exhausted redeliveries, got {other:?}"),
    }
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_redeliveries_go_to_the_dead_letter_endpoint() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = started(
        always_failing(&calls),
        r#"[{ "id": "r", "from": "direct:r",
              "errorHandler": { "maxRedeliveries": 2, "deadLetterUri": "mock:dead" },
              "steps": [{ "type": "process", "ref": "flaky" }] }]"#,
    )
    .await;

    let done = engine
        .process("r", engine.create_exchange_with_body("x"))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!done.is_failed());
    assert!(done.caught_exception().is_some());

    let dead = mock(&engine, "mock:dead").received_exchanges();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].header(headers::FAILURE_KIND), Some(&Value::from("processing")));
    assert_eq!(dead[0].header(headers::FAILURE_ROUTE_ID), Some(&Value::from("r")));
    assert_eq!(dead[0].property(properties::REDELIVERY_COUNTER), Some(&Value::Int(2)));
    engine.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_stops_ordinary_nodes() {
    let after = Arc::new(AtomicUsize::new(0));
    let mut beans = Beans::new();
    let seen = Arc::clone(&after);
    beans.register_processor(
        "after",
        processor_fn("after", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let engine = started(
        beans,
        r#"[{ "id": "c", "from": "direct:c",
              "errorHandler": { "maxRedeliveries": 5, "deadLetterUri": "mock:never" },
              "steps": [
                { "type": "delay", "millis": 10000 },
                { "type": "process", "ref": "after" }
              ] }]"#,
    )
    .await;

    let ex = engine.create_exchange();
    let token = ex.context().cancellation.clone();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let submission = engine.submit("c", ex, move |c: Completion| {
        let _ = tx.send(c);
    });
    assert!(!submission.is_synchronous());
    token.cancel();

    let err = rx.await.unwrap().into_result().unwrap_err();
    assert!(err.route_error().is_some_and(RouteError::is_cancellation));
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(mock(&engine, "mock:never").received_count(), 0);
    engine.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_sub_routes_share_the_callers_exchange() {
    let engine = started(
        Beans::new(),
        r#"[
            { "id": "main", "from": "direct:main", "steps": [
                { "type": "to", "uri": "direct:enrich" },
                { "type": "to", "uri": "mock:main-out" }
            ]},
            { "id": "enrich", "from": "direct:enrich", "steps": [
                { "type": "setHeader", "name": "enriched", "expression": { "type": "constant", "value": true } },
                { "type": "filter", "predicate": { "type": "constant", "value": false } },
                { "type": "to", "uri": "mock:unreachable" }
            ]}
        ]"#,
    )
    .await;

    engine.process("main", engine.create_exchange_with_body("x")).await.unwrap();
    let out = mock(&engine, "mock:main-out").received_exchanges();
    assert_eq!(out.len(), 1, "the sub-route filter must not stop the caller");
    assert_eq!(out[0].header("enriched"), Some(&Value::Bool(true)));
    assert_eq!(mock(&engine, "mock:unreachable").received_count(), 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn seda_decouples_producer_and_consumer() {
    let engine = started(
        Beans::new(),
        r#"[
            { "id": "in", "from": "direct:in", "steps": [{ "type": "to", "uri": "seda:work?size=10" }] },
            { "id": "worker", "from": "seda:work?concurrentConsumers=2", "steps": [
                { "type": "setBody", "expression": { "type": "template", "template": "done:${body}" } },
                { "type": "to", "uri": "mock:worked" }
            ]}
        ]"#,
    )
    .await;

    let worked = mock(&engine, "mock:worked");
    worked.expected_message_count(3);
    for body in ["a", "b", "c"] {
        engine.process("in", engine.create_exchange_with_body(body)).await.unwrap();
    }
    worked.assert_satisfied(Duration::from_secs(2)).await.unwrap();
    let mut bodies = worked.received_bodies();
    bodies.sort();
    assert_eq!(bodies, vec!["done:a", "done:b", "done:c"]);

    // InOut waits for the consuming route and takes its reply.
    let reply = engine
        .process(
            "in",
            engine
                .create_exchange_with_body("d")
                .with_pattern(ExchangePattern::InOut),
        )
        .await
        .unwrap();
    assert_eq!(text(&reply), "done:d");
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn mock_failures_are_handled_like_any_other() {
    let engine = started(
        Beans::new(),
        r#"[{ "id": "r", "from": "direct:r", "steps": [{ "type": "to", "uri": "mock:broken" }] }]"#,
    )
    .await;
    mock(&engine, "mock:broken").fail_with(RouteError::processing("mock:broken", "down"));
    let err = engine
        .process("r", engine.create_exchange_with_body("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExchangeFailed { .. }));
    engine.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Loading and configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routes_load_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "routes": [{{ "id": "f", "from": "direct:f", "steps": [
            {{ "type": "convertBodyTo", "to": "int" }},
            {{ "type": "to", "uri": "mock:ints" }}
        ]}}]}}"#
    )
    .unwrap();

    let engine = RoutingEngine::builder()
        .config(EngineConfig {
            name: "file-test".to_string(),
            ..EngineConfig::default()
        })
        .build();
    assert_eq!(engine.load_routes_file(file.path()).unwrap(), vec!["f"]);
    engine.start().await.unwrap();

    let done = engine.process("f", engine.create_exchange_with_body("12")).await.unwrap();
    assert_eq!(done.body_as::<i64>().unwrap(), 12);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn missing_route_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = RoutingEngine::builder().build();
    assert!(engine.load_routes_file(dir.path().join("absent.json")).is_err());
}
