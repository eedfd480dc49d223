//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument. Update methods touch only the
//! columns they own so concurrent writers of disjoint fields (status from
//! the cancel endpoint, progress from the propagator, result from the
//! ingestor) never clobber each other.

pub mod credential_repo;
pub mod event_repo;
pub mod job_repo;
pub mod queue_repo;
pub mod target_repo;
