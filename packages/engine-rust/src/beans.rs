//! Named processors, predicates, strategies, and split expressions that route
//! definitions refer to with `{"type": "...", "ref": "name"}`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use switchyard_core::{Exchange, Processor, RouteError, TypeKey};

use crate::graph::split::SplitExpression;
use crate::routing::aggregation::AggregationStrategy;

/// Predicate supplied by application code.
pub type PredicateFn = Arc<dyn Fn(&Exchange) -> Result<bool, RouteError> + Send + Sync>;

/// Lookup table consulted once, at route compilation.
#[derive(Default, Clone)]
pub struct Beans {
    processors: HashMap<String, Arc<dyn Processor>>,
    predicates: HashMap<String, PredicateFn>,
    strategies: HashMap<String, Arc<dyn AggregationStrategy>>,
    splitters: HashMap<String, Arc<dyn SplitExpression>>,
    type_aliases: HashMap<String, TypeKey>,
}

impl fmt::Debug for Beans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beans")
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .field("splitters", &self.splitters.keys().collect::<Vec<_>>())
            .field("type_aliases", &self.type_aliases.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Beans {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_processor(&mut self, name: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.insert(name.into(), processor);
    }

    pub fn register_predicate(&mut self, name: impl Into<String>, predicate: PredicateFn) {
        self.predicates.insert(name.into(), predicate);
    }

    pub fn register_strategy(
        &mut self,
        name: impl Into<String>,
        strategy: Arc<dyn AggregationStrategy>,
    ) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn register_splitter(&mut self, name: impl Into<String>, splitter: Arc<dyn SplitExpression>) {
        self.splitters.insert(name.into(), splitter);
    }

    pub fn register_type_alias(&mut self, name: impl Into<String>, key: TypeKey) {
        self.type_aliases.insert(name.into(), key);
    }

    #[must_use]
    pub fn processor(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(name).cloned()
    }

    #[must_use]
    pub fn predicate(&self, name: &str) -> Option<PredicateFn> {
        self.predicates.get(name).cloned()
    }

    #[must_use]
    pub fn strategy(&self, name: &str) -> Option<Arc<dyn AggregationStrategy>> {
        self.strategies.get(name).cloned()
    }

    #[must_use]
    pub fn splitter(&self, name: &str) -> Option<Arc<dyn SplitExpression>> {
        self.splitters.get(name).cloned()
    }

    #[must_use]
    pub fn type_alias(&self, name: &str) -> Option<TypeKey> {
        self.type_aliases.get(name).copied()
    }
}
