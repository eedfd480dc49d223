//! Domain model structs and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` entity struct matching
//! the database row, plus the create DTOs the store accepts.

pub mod credential;
pub mod event;
pub mod job;
pub mod queue;
pub mod status;
pub mod target;
