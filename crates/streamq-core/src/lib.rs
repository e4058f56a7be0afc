//! Core types for the streamq task-queue framework: the wire envelope,
//! pluggable serialization backends, the task router and shared configuration.

mod config;
mod envelope;
mod error;
mod router;
mod serialization;

pub use config::Configuration;
pub use envelope::{Envelope, Headers};
pub use error::{QueueError, Result};
pub use router::{
    HandlerResult, TaskDefinition, TaskFailure, TaskHandler, TaskInvocation, TaskRouter,
};
pub use serialization::{JsonBackend, SerializationBackend, SerializationRegistry, YamlBackend};
