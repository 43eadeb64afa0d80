//! Built-in health indicators

pub mod autovacuum;
pub mod failure_rate;
