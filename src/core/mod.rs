//! Core domain types: schedules, identifiers and cron definitions.

pub mod definition;
pub mod schedule;
pub mod types;
