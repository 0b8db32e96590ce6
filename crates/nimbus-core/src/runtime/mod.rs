//! Runtime abstraction: every component schedules work and reads the
//! clock through a generic `R: AsyncRuntime` rather than calling
//! `tokio::spawn` directly, so a test harness can substitute a
//! deterministic executor. `AsyncRuntime` is not object-safe (its timeout
//! method is generic), so it's always threaded through as a type
//! parameter, never as `Arc<dyn AsyncRuntime>`.

pub mod executor;
pub mod task;
pub mod tokio_runtime;

pub use executor::{AsyncRuntime, TimeDriver};
pub use task::TaskHandle;
pub use tokio_runtime::TokioRuntime;

/// Wall-clock time in milliseconds since the Unix epoch, used only for
/// display/audit timestamps that are never compared for ordering (use
/// [`crate::contract::Deadline`] for anything that needs monotonicity).
pub fn wall_clock_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
