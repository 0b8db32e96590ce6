//! The production [`AsyncRuntime`] implementation, backed by the ambient
//! tokio runtime. `nimbus-node`'s `main.rs` constructs exactly one of
//! these and hands it down to every component.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::runtime::executor::{TaskExecutor, TimeDriver};
use crate::runtime::task::TaskHandle;
use crate::sealed::Sealed;

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioRuntime;

impl TokioRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Sealed for TokioRuntime {}

impl TaskExecutor for TokioRuntime {
    fn spawn(&self, future: BoxFuture<'static, ()>) -> TaskHandle {
        let join = tokio::spawn(future);
        TaskHandle::new(async move {
            let _ = join.await;
        })
    }
}

impl TimeDriver for TokioRuntime {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }

    fn timeout<F>(&self, duration: Duration, future: F) -> BoxFuture<'static, Option<F::Output>>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        async move { tokio::time::timeout(duration, future).await.ok() }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_returns_none_when_future_is_slow() {
        let rt = TokioRuntime::new();
        let result = rt
            .timeout(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                42
            })
            .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn timeout_returns_some_when_future_is_fast() {
        let rt = TokioRuntime::new();
        let result = rt.timeout(Duration::from_secs(5), async { 42 }).await;
        assert_eq!(result, Some(42));
    }
}
