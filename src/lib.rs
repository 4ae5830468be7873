//! Container engine abstraction and buildpack lifecycle orchestrator.
//!
//! Drives a container daemon over a Unix-domain-socket HTTP transport to
//! create, stream into/out of, start, health-check, shell into, and commit
//! containers, and composes those primitives into a stage/run/export
//! buildpack workflow.

pub mod app_config;
pub mod client;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod image;
pub mod log_writer;
pub mod runner;
pub mod stager;
pub mod stream;
pub mod tar_util;
pub mod urlenc;
pub mod volume;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
