//! Redelivery policy: how often and how fast a failing sub-graph is retried.

use std::time::Duration;

use rand::Rng;
use switchyard_core::{ErrorKind, RouteError};

use crate::definition::RedeliveryDefinition;
use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRedeliveries {
    Limited(u32),
    Unbounded,
}

impl MaxRedeliveries {
    #[must_use]
    pub fn allows(self, attempts: u32) -> bool {
        match self {
            MaxRedeliveries::Limited(max) => attempts < max,
            MaxRedeliveries::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

/// What the error handler does with a failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Re-enter the wrapped sub-graph after `delay`.
    Redeliver { delay: Duration },
    /// Hand the exchange to the dead-letter endpoint.
    DeadLetter,
    /// Keep unwinding to the next enclosing handler.
    Propagate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: MaxRedeliveries,
    pub backoff: Backoff,
    /// Adds up to ±50% random jitter to each delay.
    pub jitter: bool,
    pub retry_on: Vec<ErrorKind>,
    /// Restore the input message captured at handler entry before each retry.
    pub restore_on_redelivery: bool,
    /// Dead-letter the message captured at handler entry instead of the
    /// failed one.
    pub use_original_message: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: MaxRedeliveries::Limited(0),
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: false,
            retry_on: vec![
                ErrorKind::Conversion,
                ErrorKind::Processing,
                ErrorKind::Aggregation,
            ],
            restore_on_redelivery: true,
            use_original_message: false,
        }
    }
}

impl RedeliveryPolicy {
    /// Builds a policy from its definition.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidPolicy`] for unbounded redelivery without
    /// `allow_unbounded`, a multiplier below 1, or a retry list that names
    /// cancellation.
    pub fn from_definition(
        def: &RedeliveryDefinition,
        allow_unbounded: bool,
    ) -> Result<Self, CompileError> {
        let max_redeliveries = if def.max_redeliveries < 0 {
            if !allow_unbounded {
                return Err(CompileError::InvalidPolicy(
                    "unbounded redelivery is disabled for this engine".to_string(),
                ));
            }
            MaxRedeliveries::Unbounded
        } else {
            MaxRedeliveries::Limited(u32::try_from(def.max_redeliveries).map_err(|_| {
                CompileError::InvalidPolicy(format!(
                    "maxRedeliveries {} is too large",
                    def.max_redeliveries
                ))
            })?)
        };

        let initial = Duration::from_millis(def.redelivery_delay_ms);
        let backoff = match def.backoff_multiplier {
            None => Backoff::Fixed(initial),
            Some(multiplier) if multiplier.is_finite() && multiplier >= 1.0 => {
                Backoff::Exponential {
                    initial,
                    multiplier,
                    max: def
                        .max_redelivery_delay_ms
                        .map_or(Duration::from_secs(60), Duration::from_millis),
                }
            }
            Some(multiplier) => {
                return Err(CompileError::InvalidPolicy(format!(
                    "backoffMultiplier must be at least 1, got {multiplier}"
                )))
            }
        };

        let retry_on = match &def.retry_on {
            None => RedeliveryPolicy::default().retry_on,
            Some(kinds) if kinds.contains(&ErrorKind::Cancellation) => {
                return Err(CompileError::InvalidPolicy(
                    "cancellation is never retried".to_string(),
                ))
            }
            Some(kinds) => kinds.clone(),
        };

        Ok(Self {
            max_redeliveries,
            backoff,
            jitter: def.jitter,
            retry_on,
            restore_on_redelivery: def.restore_on_redelivery,
            use_original_message: def.use_original_message,
        })
    }

    #[must_use]
    pub fn is_retriable(&self, error: &RouteError) -> bool {
        let kind = error.kind();
        kind != ErrorKind::Cancellation && self.retry_on.contains(&kind)
    }

    /// Delay before redelivery number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() {
                    Duration::from_secs_f64(secs.min(max.as_secs_f64()))
                } else {
                    max
                }
            }
        };
        if self.jitter && !base.is_zero() {
            let factor = rand::rng().random_range(0.5..=1.5);
            base.mul_f64(factor)
        } else {
            base
        }
    }

    /// Decides how to handle `error` after `attempts` redeliveries.
    #[must_use]
    pub fn decide(&self, error: &RouteError, attempts: u32, has_dead_letter: bool) -> Decision {
        if error.is_cancellation() {
            return Decision::Propagate;
        }
        if self.is_retriable(error) && self.max_redeliveries.allows(attempts) {
            return Decision::Redeliver {
                delay: self.delay_for(attempts + 1),
            };
        }
        if has_dead_letter {
            Decision::DeadLetter
        } else {
            Decision::Propagate
        }
    }
}
