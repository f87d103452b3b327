//! # lifeline-engine
//!
//! Connection lifecycle engine for long-lived client connections.
//!
//! - [`registry`]: live connections indexed by id, owning user, and identity
//! - [`heartbeat`]: per-connection probe tasks with a miss threshold
//! - [`cleanup`]: periodic eviction of connections past their deadline
//! - [`reconnect`]: per-identity reconnection state machine with backoff
//! - [`batching`]: per-key message queues flushed by size, age, or load
//! - [`classifier`]: classified error records forwarded to a reporter
//! - [`engine`]: wires the components together behind one shutdown token

#![deny(unsafe_code)]

pub mod batching;
pub mod classifier;
pub mod cleanup;
pub mod engine;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
mod testing;

pub use batching::{
    AdaptiveBatcher, Batch, BatchSink, BatchStats, BatchingEngine, FlushReason, PendingMessage,
    RegistrySink, adaptive_threshold, should_flush,
};
pub use classifier::{ChannelReporter, ErrorClassifier, ErrorReport, ErrorReporter, TracingReporter};
pub use cleanup::{CleanupHealth, CleanupMonitor, RegistryRemoval, RemovalCallback, TickReport};
pub use engine::{ConnectionEngine, ConnectionEngineBuilder, EngineHealth};
pub use heartbeat::{HeartbeatMonitor, HeartbeatResult, HeartbeatState, HeartbeatStats, ProbeOutcome};
pub use reconnect::{
    ReconnectionAttempt, ReconnectionMetrics, ReconnectionOrchestrator, ReconnectionState,
    ReconnectionStatus, ReconnectionSummary, Reconnector,
};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator, ShutdownReport};
pub use transport::{ChannelTransport, Frame, Transport};
