//! buildloop: async job execution core for multi-phase build pipelines.
//!
//! - [`scheduler`]: named queues with retry, backoff and worker pools
//! - [`processor`]: payload validation, failure classification and escalation
//! - [`fix`]: bounded self-fix loop that patches failing code and escalates to
//!   humans
//! - [`runtime`]: wires the three together from a [`config::ServiceConfig`]

pub mod cli;
pub mod config;
pub mod error;
pub mod fix;
pub mod llm;
pub mod metrics;
pub mod processor;
pub mod runtime;
pub mod scheduler;
pub mod utils;

pub use config::{ConfigError, ServiceConfig};
pub use error::{ApplyError, FixError, LlmError, ProcessorError, QueueError};
pub use runtime::Runtime;
