//! Switchyard Core: exchanges, typed bodies, type conversion, and the
//! processor capability shared by the routing engine and its components.

pub mod body;
pub mod context;
pub mod converter;
pub mod error;
pub mod exchange;
pub mod message;
pub mod traits;
pub mod types;

pub use body::{Body, TypeKey};
pub use context::ExchangeContext;
pub use converter::{
    ConvertFn, ConverterProvider, FallbackConverter, TypeConverterRegistry,
    TypeConverterRegistryBuilder,
};
pub use error::{ErrorKind, RouteError};
pub use exchange::{Exchange, ExchangeId, ExchangePattern};
pub use message::{Attachment, Headers, Message};
pub use traits::{async_processor, processor_fn, AsyncProcessor, Outcome, PendingExchange, Processor};
pub use types::Value;
