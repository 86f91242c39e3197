//! Engine plumbing around the routing core.
//!
//! 1. **Configuration** (`config`): `EngineConfig` and its option table
//! 2. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 3. **Routing** (`router`): `RouteService`, the innermost inbound service
//! 4. **Lifecycle** (`registry`, `shutdown`): managed services and engine state
//! 5. **Background workers** (`worker`): queue-draining worker pools

pub mod config;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod worker;

// Re-export key types for convenient access.
pub use config::EngineConfig;
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use router::{ExchangeFuture, RouteService};
pub use shutdown::{EngineState, ShutdownController};
pub use worker::{BackgroundRunnable, WorkerPool};
