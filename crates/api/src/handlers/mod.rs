pub mod jobs;
pub mod targets;
