//! Tower middleware layers for the inbound exchange pipeline.
//!
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`timeout`]: Per-exchange timeout via cancellation
//! - [`metrics`]: Exchange timing and outcome via spans and histograms
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_inbound_pipeline;
pub use timeout::TimeoutLayer;
