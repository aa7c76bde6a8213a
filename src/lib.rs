//! Root of the `flow-orchestrator-core` library.
//!
//! Consumes an ordered script of UI-automation commands and drives them
//! against a generic device [`driver::Driver`], producing structured
//! progress, metadata, and errors for an external reporter via
//! [`metadata::Observer`]. `interpreter::Orchestrator::run_flow` is the
//! entry point.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through `tracing` instead.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod condition;
pub mod driver;
pub mod error;
pub mod flow_controller;
pub mod interpreter;
mod lookup;
pub mod metadata;
pub mod protocol;
mod retry;
pub mod script_engine;
pub mod selector;
mod subflow;
pub mod timing;

pub use driver::{AIEngine, Driver};
pub use error::{CommandFailure, DomainError, FlowError};
pub use interpreter::Orchestrator;
pub use metadata::Observer;
pub use script_engine::ScriptEngine;
