//! A handle to a spawned task, detached from the concrete runtime that
//! spawned it.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Dropping a `TaskHandle` does not cancel the underlying task (matching
/// `tokio::spawn`); use [`crate::contract::Cancellation`] for cooperative
/// cancellation instead.
pub struct TaskHandle {
    inner: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl TaskHandle {
    pub fn new(inner: impl Future<Output = ()> + Send + 'static) -> Self {
        Self { inner: Box::pin(inner) }
    }
}

impl Future for TaskHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
