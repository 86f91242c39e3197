//! Declarative route definitions, deserialized from JSON.
//!
//! ```json
//! {
//!   "id": "orders",
//!   "from": "direct:orders",
//!   "steps": [
//!     { "type": "setHeader", "name": "source", "expression": { "type": "constant", "value": "web" } },
//!     { "type": "filter", "predicate": { "type": "bodyLength", "op": "gt", "value": 3 } },
//!     { "type": "to", "uri": "mock:accepted" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use switchyard_core::{ErrorKind, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Route-wide error handler wrapping every step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handler: Option<RedeliveryDefinition>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            steps: Vec::new(),
            error_handler: None,
        }
    }

    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, policy: RedeliveryDefinition) -> Self {
        self.error_handler = Some(policy);
        self
    }
}

/// File format accepted by `add_routes_json`: a bare array or `{"routes": [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RoutesDocument {
    List(Vec<RouteDefinition>),
    Wrapped { routes: Vec<RouteDefinition> },
}

impl RoutesDocument {
    #[must_use]
    pub fn into_routes(self) -> Vec<RouteDefinition> {
        match self {
            RoutesDocument::List(routes) | RoutesDocument::Wrapped { routes } => routes,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StepDefinition {
    Pipeline {
        steps: Vec<StepDefinition>,
    },
    Choice {
        when: Vec<WhenDefinition>,
        #[serde(default)]
        otherwise: Option<Vec<StepDefinition>>,
    },
    /// Gate: a non-matching exchange skips the rest of its route.
    Filter {
        predicate: PredicateDefinition,
    },
    Multicast {
        branches: Vec<Vec<StepDefinition>>,
        #[serde(default)]
        parallel: bool,
        #[serde(default)]
        strategy: Option<AggregationDefinition>,
        #[serde(default)]
        stop_on_exception: bool,
    },
    Split {
        expression: SplitDefinition,
        steps: Vec<StepDefinition>,
        #[serde(default)]
        parallel: bool,
        #[serde(default)]
        strategy: Option<AggregationDefinition>,
        #[serde(default)]
        stop_on_exception: bool,
    },
    ErrorHandler {
        #[serde(flatten)]
        policy: RedeliveryDefinition,
        steps: Vec<StepDefinition>,
    },
    To {
        uri: String,
    },
    Process {
        #[serde(rename = "ref")]
        reference: String,
    },
    SetHeader {
        name: String,
        expression: ExpressionDefinition,
    },
    RemoveHeader {
        name: String,
    },
    SetProperty {
        name: String,
        expression: ExpressionDefinition,
    },
    SetBody {
        expression: ExpressionDefinition,
    },
    /// Converts the body to a named type (`string`, `bytes`, `int`, `float`,
    /// `bool`, `json`, `value`, or a registered alias).
    ConvertBodyTo {
        to: String,
    },
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    Delay {
        millis: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhenDefinition {
    pub predicate: PredicateDefinition,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Predicates and expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PredicateDefinition {
    HeaderEquals { name: String, value: Value },
    HeaderExists { name: String },
    HeaderMatches { name: String, pattern: String },
    PropertyEquals { name: String, value: Value },
    BodyEquals { value: String },
    BodyContains { value: String },
    BodyMatches { pattern: String },
    BodyLength { op: Comparison, value: usize },
    Constant { value: bool },
    Not { predicate: Box<PredicateDefinition> },
    And { predicates: Vec<PredicateDefinition> },
    Or { predicates: Vec<PredicateDefinition> },
    Ref {
        #[serde(rename = "ref")]
        reference: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    #[must_use]
    pub fn holds(self, left: usize, right: usize) -> bool {
        match self {
            Comparison::Eq => left == right,
            Comparison::Ne => left != right,
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ExpressionDefinition {
    Constant { value: Value },
    Header { name: String },
    Property { name: String },
    Body,
    /// Text with `${body}`, `${header.X}`, `${property.X}`, `${exchangeId}`.
    Template { template: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SplitDefinition {
    Tokenize { token: String },
    Lines,
    /// Body is a list (`Vec<Value>`, `Value::Array`, or a JSON array).
    Array,
    Ref {
        #[serde(rename = "ref")]
        reference: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AggregationDefinition {
    UseLatest,
    UseOriginal,
    CollectBodies,
    Join {
        #[serde(default)]
        delimiter: String,
    },
    Ref {
        #[serde(rename = "ref")]
        reference: String,
    },
}

// ---------------------------------------------------------------------------
// Redelivery
// ---------------------------------------------------------------------------

/// Error handler settings. `maxRedeliveries: -1` means unbounded, which the
/// compiler only accepts when the engine allows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedeliveryDefinition {
    pub max_redeliveries: i64,
    pub redelivery_delay_ms: u64,
    /// Set to enable exponential backoff.
    pub backoff_multiplier: Option<f64>,
    pub max_redelivery_delay_ms: Option<u64>,
    pub jitter: bool,
    pub retry_on: Option<Vec<ErrorKind>>,
    pub restore_on_redelivery: bool,
    pub use_original_message: bool,
    pub dead_letter_uri: Option<String>,
}

impl Default for RedeliveryDefinition {
    fn default() -> Self {
        Self {
            max_redeliveries: 0,
            redelivery_delay_ms: 0,
            backoff_multiplier: None,
            max_redelivery_delay_ms: None,
            jitter: false,
            retry_on: None,
            restore_on_redelivery: true,
            use_original_message: false,
            dead_letter_uri: None,
        }
    }
}
