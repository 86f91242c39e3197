//! The compiled processor graph: an immutable, `Arc`-shared tree of nodes
//! built once per route and walked by the routing engine for every exchange.

pub mod compile;
pub mod predicate;
pub mod split;
pub mod steps;

use std::fmt;
use std::sync::Arc;

use switchyard_core::Processor;

use crate::error_handler::policy::RedeliveryPolicy;
use crate::routing::aggregation::AggregationStrategy;

pub use compile::RouteCompiler;
pub use predicate::{Expression, Predicate};
pub use split::SplitExpression;

pub type NodeRef = Arc<Node>;

pub enum Node {
    /// Children run in order; the first failure stops the rest.
    Pipeline(Arc<[NodeRef]>),
    /// First matching predicate wins.
    Choice {
        when: Vec<(Predicate, NodeRef)>,
        otherwise: Option<NodeRef>,
    },
    /// Gate with no children. A rejected exchange stops its branch: the rest
    /// of the traversal it belongs to, including steps after an enclosing
    /// `Choice` or `ErrorHandler`. Each fan-out child is its own branch, and
    /// a `direct:` call clears the stop so the calling route continues.
    Filter(Predicate),
    Multicast(Arc<MulticastNode>),
    Split(Arc<SplitNode>),
    ErrorHandler(Arc<ErrorHandlerNode>),
    Process {
        label: String,
        processor: Arc<dyn Processor>,
    },
}

impl Node {
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Node::Pipeline(_) => "pipeline",
            Node::Choice { .. } => "choice",
            Node::Filter(_) => "filter",
            Node::Multicast(_) => "multicast",
            Node::Split(_) => "split",
            Node::ErrorHandler(_) => "errorHandler",
            Node::Process { label, .. } => label,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Pipeline(children) => f.debug_list().entries(children.iter()).finish(),
            Node::Choice { when, otherwise } => f
                .debug_struct("Choice")
                .field("when", when)
                .field("otherwise", otherwise)
                .finish(),
            Node::Filter(p) => f.debug_tuple("Filter").field(p).finish(),
            Node::Multicast(m) => f
                .debug_struct("Multicast")
                .field("branches", &m.branches)
                .field("parallel", &m.parallel)
                .finish(),
            Node::Split(s) => f
                .debug_struct("Split")
                .field("body", &s.body)
                .field("parallel", &s.parallel)
                .finish(),
            Node::ErrorHandler(h) => f
                .debug_struct("ErrorHandler")
                .field("policy", &h.policy)
                .field("dead_letter", &h.dead_letter_uri)
                .field("body", &h.body)
                .finish(),
            Node::Process { label, .. } => write!(f, "Process({label})"),
        }
    }
}

pub struct MulticastNode {
    pub branches: Vec<NodeRef>,
    pub parallel: bool,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub stop_on_exception: bool,
}

pub struct SplitNode {
    pub expression: Arc<dyn SplitExpression>,
    /// Sub-graph each part is routed through.
    pub body: NodeRef,
    pub parallel: bool,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub stop_on_exception: bool,
}

pub struct ErrorHandlerNode {
    pub policy: RedeliveryPolicy,
    pub body: NodeRef,
    pub dead_letter: Option<NodeRef>,
    pub dead_letter_uri: Option<String>,
}

/// A route after compilation. Immutable and shared by all exchanges.
#[derive(Debug)]
pub struct CompiledRoute {
    pub id: String,
    pub from: String,
    pub root: NodeRef,
}
