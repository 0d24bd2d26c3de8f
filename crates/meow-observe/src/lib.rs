//! Observability for the meow orchestrator: tracing subscriber setup
//! and span attribute constants.

pub mod attrs;
pub mod tracing_setup;
