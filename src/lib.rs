//! tandem library crate.
//!
//! Gives every agent an isolated, branch-backed working directory, records
//! its checkpoints, and merges its work back into the parent with
//! deterministic newest-wins conflict resolution. The `tandem` binary is a
//! thin CLI over [`lifecycle::WorkspaceManager`]; agent runtimes embed
//! [`facade::RuntimeFacade`].

pub mod config;
pub mod error;
pub mod facade;
pub mod lifecycle;
pub mod locks;
pub mod merge;
pub mod model;
pub mod registry;
pub mod retention;
pub mod store;
pub mod telemetry;

pub use error::{EngineError, ErrorCategory};
pub use lifecycle::WorkspaceManager;
