//! Publish/subscribe adapter bridging a message-queue transport to
//! pull-based subscription iterators.

/// Settings loading: connection, diagnostics and logging.
pub mod config;
/// Structured logging setup (formatting, filters).
pub mod logging;
/// Pub/Sub engine, subscription registry and pull adapter.
pub mod pubsub;
/// Transport seam and the in-memory transport.
pub mod transport;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// config
pub use config::{ConnectionConfig, Settings};
/// Logging initialization.
pub use logging::{config::LoggingConfig, init_logging, LoggingError};
/// Pub/Sub API.
pub use pubsub::{
    DiagnosticEvent, IteratorOptions, IteratorPhase, Listener, PathSegment, PubSubEngine,
    PubSubIterator, PubSubOptions, StatsSnapshot, SubscriptionId, Trigger,
};
/// Error types shared with transports.
pub use pubsub_bridge_error::{ErrorExt, PubSubError, PubSubResult, StatusCode, TransportError};
/// Transport API.
pub use transport::{Disposer, FnDisposer, MemoryTransport, Message, MessageHandler, Transport};
