//! Data layer module
//!
//! Handles all persistence for the delivery engine and job
//! dispatchers:
//! - SQLite database operations (sqlx)
//! - Atomic claim queries for scheduled job items
//! - Dead-letter queue records

mod database;
mod models;

pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
