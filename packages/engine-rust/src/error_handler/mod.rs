//! Redelivery and dead-letter handling for failed exchanges.
//!
//! The policy decides; the traversal carries out the decision, so redelivery
//! delays are scheduled suspensions rather than sleeping threads.

pub mod policy;

pub use policy::{Backoff, Decision, MaxRedeliveries, RedeliveryPolicy};
