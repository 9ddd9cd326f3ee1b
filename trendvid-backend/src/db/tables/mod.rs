//! Table modules - extend Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks with methods for a specific table group.

mod content;    // content, content_setting
mod task_lock;  // task_lock
mod task_queue; // task_queue (+ claim transaction)
mod tasks;      // task (+ cascade delete)
mod time_log;   // task_time_log

pub use task_queue::ClaimOutcome;
pub use tasks::{DeleteCounts, TaskRecord};

use std::str::FromStr;

use rusqlite::types::Type;

/// Parse a TEXT column into a typed value, surfacing failures as a
/// rusqlite conversion error for that column.
pub(crate) fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
