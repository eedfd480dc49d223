//! Domain logic shared by every crackq crate.
//!
//! This crate has zero internal dependencies: it holds the pure functions
//! (path validation, engine output parsing, argument building, gate
//! decisions) so they can be tested without a database or a runtime.

pub mod credentials;
pub mod engine_args;
pub mod engine_output;
pub mod error;
pub mod job_events;
pub mod path_safety;
pub mod scheduling;
pub mod types;
