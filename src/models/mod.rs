//! # Data Models
//!
//! SeaORM entities and the typed values stored in them.

pub mod job;

pub use job::Entity as Job;
pub use job::{JobStatus, Operation};
