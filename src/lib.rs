//! # transferd
//!
//! Job orchestration engine around an external file-transfer tool: plans
//! copy/move/sync/check/zip invocations with rsync path semantics, supervises
//! the resulting processes, parses their progress output and keeps durable,
//! resumable job records.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod models;
pub mod plan;
pub mod progress;
pub mod remote;
pub mod repositories;
pub mod supervisor;
pub mod telemetry;
pub use migration;
