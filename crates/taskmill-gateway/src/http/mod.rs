pub mod error;
pub mod health;
pub mod scheduled;
pub mod tasks;

/// Render an epoch timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
pub(crate) fn format_timestamp(ts: f64) -> Option<String> {
    taskmill_core::time::from_timestamp(ts).map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
}
