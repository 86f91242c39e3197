//! Aggregation strategies merging fan-out branch results into the parent.

use switchyard_core::exchange::properties;
use switchyard_core::{Exchange, RouteError, Value};

use crate::graph::predicate::body_value;

/// Merges completed branches back into the original exchange.
///
/// Invoked exactly once per fan-out, after every branch has completed, with
/// the branches in index order. Invoked with an empty list when there were no
/// branches.
pub trait AggregationStrategy: Send + Sync {
    /// # Errors
    ///
    /// A returned error fails the original exchange with an `Aggregation` error.
    fn aggregate(&self, original: &mut Exchange, branches: Vec<Exchange>) -> Result<(), RouteError>;

    /// Every strategy receives failed branches. Strategies that return `true`
    /// take responsibility for them; otherwise the first failed branch, by
    /// index, fails the original after `aggregate` has run.
    fn handles_failures(&self) -> bool {
        false
    }
}

/// The original exchange takes the message of the last branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, original: &mut Exchange, branches: Vec<Exchange>) -> Result<(), RouteError> {
        if let Some(last) = branches.into_iter().last() {
            original.set_message(last.message().clone());
        }
        Ok(())
    }
}

/// The original exchange continues unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseOriginal;

impl AggregationStrategy for UseOriginal {
    fn aggregate(&self, _original: &mut Exchange, _branches: Vec<Exchange>) -> Result<(), RouteError> {
        Ok(())
    }
}

/// Collects every branch body into a `Value::Array` body.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectBodies;

impl AggregationStrategy for CollectBodies {
    fn aggregate(&self, original: &mut Exchange, branches: Vec<Exchange>) -> Result<(), RouteError> {
        let bodies = branches
            .iter()
            .map(body_value)
            .collect::<Result<Vec<Value>, _>>()?;
        original.set_body(Value::Array(bodies));
        Ok(())
    }
}

/// Joins branch bodies as text.
#[derive(Debug, Clone, Default)]
pub struct Join {
    pub delimiter: String,
}

impl AggregationStrategy for Join {
    fn aggregate(&self, original: &mut Exchange, branches: Vec<Exchange>) -> Result<(), RouteError> {
        let mut texts = Vec::with_capacity(branches.len());
        for branch in &branches {
            if branch.body().is_some() {
                texts.push(branch.body_as::<String>()?);
            }
        }
        original.set_body(texts.join(&self.delimiter));
        Ok(())
    }
}

/// Applies `strategy` to the completed branches, honouring the failure rule.
pub(crate) fn merge(
    strategy: &dyn AggregationStrategy,
    original: &mut Exchange,
    branches: Vec<Exchange>,
) {
    original.set_property(properties::AGGREGATED_SIZE, branches.len());
    let first_failure = if strategy.handles_failures() {
        None
    } else {
        branches.iter().find_map(|b| b.exception().cloned())
    };

    if let Err(e) = strategy.aggregate(original, branches) {
        let error = match e {
            RouteError::Aggregation { .. } => e,
            other => RouteError::aggregation(other.to_string()),
        };
        original.set_exception(error);
    }

    if let Some(failure) = first_failure {
        if !original.is_failed() {
            original.set_exception(failure);
        }
    }
}
