//! Turns [`RouteDefinition`]s into [`CompiledRoute`]s.
//!
//! Every reference is resolved here, once: beans, endpoint URIs, regular
//! expressions, templates, type aliases, and redelivery policies. A route
//! that compiles never fails at run time for a missing reference.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use switchyard_core::{TypeKey, Value};
use tracing::debug;

use super::predicate::parse_template;
use super::split::{ArrayItems, Lines, SplitExpression, Tokenize};
use super::steps::{ConvertBodyTo, Delay, LogMessage, RemoveHeader, SetBody, SetHeader, SetProperty};
use super::{
    CompiledRoute, ErrorHandlerNode, Expression, MulticastNode, Node, NodeRef, Predicate, SplitNode,
};
use crate::beans::Beans;
use crate::definition::{
    AggregationDefinition, ExpressionDefinition, PredicateDefinition, RedeliveryDefinition,
    RouteDefinition, SplitDefinition, StepDefinition,
};
use crate::endpoint::EndpointRegistry;
use crate::error::CompileError;
use crate::error_handler::RedeliveryPolicy;
use crate::routing::aggregation::{AggregationStrategy, CollectBodies, Join, UseLatest, UseOriginal};

/// Built-in names accepted by `convertBodyTo`.
fn builtin_type(alias: &str) -> Option<TypeKey> {
    Some(match alias.to_ascii_lowercase().as_str() {
        "string" | "text" => TypeKey::of::<String>(),
        "bytes" => TypeKey::of::<Vec<u8>>(),
        "int" | "long" | "i64" => TypeKey::of::<i64>(),
        "float" | "double" | "f64" => TypeKey::of::<f64>(),
        "bool" | "boolean" => TypeKey::of::<bool>(),
        "json" => TypeKey::of::<serde_json::Value>(),
        "value" => TypeKey::of::<Value>(),
        _ => return None,
    })
}

fn regex(pattern: &str) -> Result<Regex, CompileError> {
    Regex::new(pattern).map_err(|source| CompileError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

pub struct RouteCompiler {
    beans: Arc<Beans>,
    endpoints: Arc<EndpointRegistry>,
    allow_unbounded_redelivery: bool,
}

impl RouteCompiler {
    #[must_use]
    pub fn new(
        beans: Arc<Beans>,
        endpoints: Arc<EndpointRegistry>,
        allow_unbounded_redelivery: bool,
    ) -> Self {
        Self {
            beans,
            endpoints,
            allow_unbounded_redelivery,
        }
    }

    /// Compiles one route. The `from` endpoint is resolved to validate its
    /// URI; creating its consumer is left to the engine.
    ///
    /// # Errors
    ///
    /// Returns the first unresolvable reference or invalid setting found.
    pub fn compile(&self, definition: &RouteDefinition) -> Result<CompiledRoute, CompileError> {
        if definition.id.trim().is_empty() {
            return Err(CompileError::MissingRouteId);
        }
        self.endpoints.resolve(&definition.from)?;

        let mut root = self.pipeline(&definition.steps)?;
        if let Some(policy) = &definition.error_handler {
            root = self.error_handler(policy, root)?;
        }
        debug!(route = %definition.id, from = %definition.from, "route compiled");
        Ok(CompiledRoute {
            id: definition.id.clone(),
            from: definition.from.clone(),
            root,
        })
    }

    fn pipeline(&self, steps: &[StepDefinition]) -> Result<NodeRef, CompileError> {
        let mut nodes = steps
            .iter()
            .map(|step| self.step(step))
            .collect::<Result<Vec<_>, _>>()?;
        if nodes.len() == 1 {
            if let Some(only) = nodes.pop() {
                return Ok(only);
            }
        }
        Ok(Arc::new(Node::Pipeline(nodes.into())))
    }

    fn step(&self, step: &StepDefinition) -> Result<NodeRef, CompileError> {
        let node = match step {
            StepDefinition::Pipeline { steps } => return self.pipeline(steps),
            StepDefinition::Choice { when, otherwise } => Node::Choice {
                when: when
                    .iter()
                    .map(|w| Ok((self.predicate(&w.predicate)?, self.pipeline(&w.steps)?)))
                    .collect::<Result<_, CompileError>>()?,
                otherwise: otherwise.as_deref().map(|s| self.pipeline(s)).transpose()?,
            },
            StepDefinition::Filter { predicate } => Node::Filter(self.predicate(predicate)?),
            StepDefinition::Multicast {
                branches,
                parallel,
                strategy,
                stop_on_exception,
            } => Node::Multicast(Arc::new(MulticastNode {
                branches: branches
                    .iter()
                    .map(|b| self.pipeline(b))
                    .collect::<Result<_, _>>()?,
                parallel: *parallel,
                strategy: self.strategy(strategy.as_ref(), || Arc::new(UseLatest))?,
                stop_on_exception: *stop_on_exception,
            })),
            StepDefinition::Split {
                expression,
                steps,
                parallel,
                strategy,
                stop_on_exception,
            } => Node::Split(Arc::new(SplitNode {
                expression: self.split_expression(expression)?,
                body: self.pipeline(steps)?,
                parallel: *parallel,
                strategy: self.strategy(strategy.as_ref(), || Arc::new(UseOriginal))?,
                stop_on_exception: *stop_on_exception,
            })),
            StepDefinition::ErrorHandler { policy, steps } => {
                return self.error_handler(policy, self.pipeline(steps)?);
            }
            StepDefinition::To { uri } => return self.producer(uri),
            StepDefinition::Process { reference } => {
                let processor = self
                    .beans
                    .processor(reference)
                    .ok_or_else(|| CompileError::UnknownProcessor(reference.clone()))?;
                Node::Process {
                    label: processor.label().to_string(),
                    processor,
                }
            }
            StepDefinition::SetHeader { name, expression } => {
                process(SetHeader::new(name, self.expression(expression)?))
            }
            StepDefinition::RemoveHeader { name } => process(RemoveHeader::new(name)),
            StepDefinition::SetProperty { name, expression } => {
                process(SetProperty::new(name, self.expression(expression)?))
            }
            StepDefinition::SetBody { expression } => {
                process(SetBody::new(self.expression(expression)?))
            }
            StepDefinition::ConvertBodyTo { to } => {
                let target = builtin_type(to)
                    .or_else(|| self.beans.type_alias(to))
                    .ok_or_else(|| CompileError::UnknownTypeAlias(to.clone()))?;
                process(ConvertBodyTo::new(to, target))
            }
            StepDefinition::Log { message, level } => {
                process(LogMessage::new(Expression::Template(parse_template(message)?), *level))
            }
            StepDefinition::Delay { millis } => process(Delay::new(Duration::from_millis(*millis))),
        };
        Ok(Arc::new(node))
    }

    fn producer(&self, uri: &str) -> Result<NodeRef, CompileError> {
        let endpoint = self.endpoints.resolve(uri)?;
        Ok(Arc::new(Node::Process {
            label: endpoint.uri().to_string(),
            processor: endpoint.create_producer()?,
        }))
    }

    fn error_handler(
        &self,
        definition: &RedeliveryDefinition,
        body: NodeRef,
    ) -> Result<NodeRef, CompileError> {
        let policy = RedeliveryPolicy::from_definition(definition, self.allow_unbounded_redelivery)?;
        let dead_letter = definition
            .dead_letter_uri
            .as_deref()
            .map(|uri| self.producer(uri))
            .transpose()?;
        Ok(Arc::new(Node::ErrorHandler(Arc::new(ErrorHandlerNode {
            policy,
            body,
            dead_letter,
            dead_letter_uri: definition.dead_letter_uri.clone(),
        }))))
    }

    fn predicate(&self, definition: &PredicateDefinition) -> Result<Predicate, CompileError> {
        Ok(match definition {
            PredicateDefinition::HeaderEquals { name, value } => Predicate::HeaderEquals {
                name: name.clone(),
                value: value.clone(),
            },
            PredicateDefinition::HeaderExists { name } => Predicate::HeaderExists(name.clone()),
            PredicateDefinition::HeaderMatches { name, pattern } => Predicate::HeaderMatches {
                name: name.clone(),
                regex: regex(pattern)?,
            },
            PredicateDefinition::PropertyEquals { name, value } => Predicate::PropertyEquals {
                name: name.clone(),
                value: value.clone(),
            },
            PredicateDefinition::BodyEquals { value } => Predicate::BodyEquals(value.clone()),
            PredicateDefinition::BodyContains { value } => Predicate::BodyContains(value.clone()),
            PredicateDefinition::BodyMatches { pattern } => Predicate::BodyMatches(regex(pattern)?),
            PredicateDefinition::BodyLength { op, value } => Predicate::BodyLength {
                op: *op,
                value: *value,
            },
            PredicateDefinition::Constant { value } => Predicate::Constant(*value),
            PredicateDefinition::Not { predicate } => {
                Predicate::Not(Box::new(self.predicate(predicate)?))
            }
            PredicateDefinition::And { predicates } => Predicate::And(
                predicates
                    .iter()
                    .map(|p| self.predicate(p))
                    .collect::<Result<_, _>>()?,
            ),
            PredicateDefinition::Or { predicates } => Predicate::Or(
                predicates
                    .iter()
                    .map(|p| self.predicate(p))
                    .collect::<Result<_, _>>()?,
            ),
            PredicateDefinition::Ref { reference } => Predicate::Custom {
                name: reference.clone(),
                f: self
                    .beans
                    .predicate(reference)
                    .ok_or_else(|| CompileError::UnknownPredicate(reference.clone()))?,
            },
        })
    }

    #[allow(clippy::unused_self)]
    fn expression(&self, definition: &ExpressionDefinition) -> Result<Expression, CompileError> {
        Ok(match definition {
            ExpressionDefinition::Constant { value } => Expression::Constant(value.clone()),
            ExpressionDefinition::Header { name } => Expression::Header(name.clone()),
            ExpressionDefinition::Property { name } => Expression::Property(name.clone()),
            ExpressionDefinition::Body => Expression::Body,
            ExpressionDefinition::Template { template } => {
                Expression::Template(parse_template(template)?)
            }
        })
    }

    fn split_expression(
        &self,
        definition: &SplitDefinition,
    ) -> Result<Arc<dyn SplitExpression>, CompileError> {
        Ok(match definition {
            SplitDefinition::Tokenize { token } => Arc::new(Tokenize {
                token: token.clone(),
            }),
            SplitDefinition::Lines => Arc::new(Lines),
            SplitDefinition::Array => Arc::new(ArrayItems),
            SplitDefinition::Ref { reference } => self
                .beans
                .splitter(reference)
                .ok_or_else(|| CompileError::UnknownSplitExpression(reference.clone()))?,
        })
    }

    fn strategy(
        &self,
        definition: Option<&AggregationDefinition>,
        default: impl FnOnce() -> Arc<dyn AggregationStrategy>,
    ) -> Result<Arc<dyn AggregationStrategy>, CompileError> {
        Ok(match definition {
            None => default(),
            Some(AggregationDefinition::UseLatest) => Arc::new(UseLatest),
            Some(AggregationDefinition::UseOriginal) => Arc::new(UseOriginal),
            Some(AggregationDefinition::CollectBodies) => Arc::new(CollectBodies),
            Some(AggregationDefinition::Join { delimiter }) => Arc::new(Join {
                delimiter: delimiter.clone(),
            }),
            Some(AggregationDefinition::Ref { reference }) => self
                .beans
                .strategy(reference)
                .ok_or_else(|| CompileError::UnknownStrategy(reference.clone()))?,
        })
    }
}

fn process(processor: Arc<dyn switchyard_core::Processor>) -> Node {
    Node::Process {
        label: processor.label().to_string(),
        processor,
    }
}
