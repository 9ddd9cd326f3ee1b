//! Database layer - SQLite persistence for the pipeline
//!
//! - sqlite.rs: connection + schema
//! - tables/: per-table `impl Database` blocks
//! - time.rs: timestamp formatting shared by every table

mod sqlite;
mod tables;
pub mod time;

pub use sqlite::Database;
pub use tables::{ClaimOutcome, DeleteCounts, TaskRecord};
