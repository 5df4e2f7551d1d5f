pub mod api;
pub mod config;
pub mod control;
pub mod database;
pub mod engine;
pub mod probe;
pub mod registry;
pub mod scan;
pub mod subnets;
pub mod tracing;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch seconds, the unit every scan record and
/// server document uses.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
