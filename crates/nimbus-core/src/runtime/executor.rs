//! The sealed runtime trait. Sealed because the contract includes
//! implicit guarantees (spawned tasks outlive the spawning scope until
//! explicitly awaited or dropped, `sleep` is cancel-safe) that an
//! out-of-crate impl could easily violate without the compiler noticing.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::runtime::task::TaskHandle;
use crate::sealed::Sealed;

/// Executes futures and drives time. Implemented once per process (see
/// [`crate::runtime::TokioRuntime`]) and threaded down through every
/// component that needs to spawn background work, the way the fabric
/// spawns one task per connection and the scheduler spawns one per
/// in-flight request.
///
/// Components take `R: AsyncRuntime` as a generic parameter rather than
/// `Arc<dyn AsyncRuntime>`: `TimeDriver::timeout` is generic over its
/// future type and so isn't object-safe.
pub trait AsyncRuntime: TaskExecutor + TimeDriver + Send + Sync + 'static + Sealed {}

impl<T> AsyncRuntime for T where T: TaskExecutor + TimeDriver + Send + Sync + 'static + Sealed {}

pub trait TaskExecutor: Send + Sync {
    fn spawn(&self, future: BoxFuture<'static, ()>) -> TaskHandle;
}

pub trait TimeDriver: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Runs `future` and returns `None` if `duration` elapses first,
    /// matching `tokio::time::timeout`'s cancel semantics (the future is
    /// dropped, not left running).
    fn timeout<F>(&self, duration: Duration, future: F) -> BoxFuture<'static, Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}
