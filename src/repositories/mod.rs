//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! job store.

pub mod job;

pub use job::{JobRepository, LiveFields, TerminalFields};
