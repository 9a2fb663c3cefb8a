//! pipequeue: broker-backed message pipeline runtime.
//!
//! A pipeline is a set of modules connected by pub/sub channels. For every
//! module this crate provides:
//!
//! - an inbound relay moving messages from the module's source channel into
//!   its ready set, holding back messages whose `run_at` lies in the future
//! - an outbound relay publishing worker results to every destination
//! - a supervisor keeping worker and relay processes alive
//! - a status aggregator writing an expiring snapshot of queues and workers
//!
//! All cross-process state lives in the broker (Redis in production, see
//! [`broker`]).

// Core modules
pub mod broker;
pub mod cli;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod logging;
pub mod relay;
pub mod shutdown;
pub mod status;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use envelope::Envelope;
pub use error::{BrokerError, ConfigError, EnvelopeError, RelayError, StatusError, SupervisorError};
