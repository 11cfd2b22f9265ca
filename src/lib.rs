#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

//! Persistent memory runtime for terminal-resident AI assistants.
//!
//! The crate is the memory core of a larger assistant: a hybrid
//! keyword + vector retrieval engine over pluggable storage backends, a
//! best-effort vector plane (embedding provider, shared vector store,
//! circuit breaker, durable outbox), lifecycle operators (hygiene,
//! snapshot/hydrate) and a process-wide component-health registry.
//! Surrounding subsystems — CLI, gateway, providers, channels — consume
//! these contracts and are not part of this crate.

pub mod config;
pub mod error;
pub mod health;
pub mod memory;

pub use config::MemoryConfig;
pub use error::{ConfigError, EngramError, MemoryError, SessionError};
pub use memory::runtime::MemoryRuntime;
