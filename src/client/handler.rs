//! The job processing capability.
//!
//! Stateful workers implement [`JobHandler`] directly; plain async functions
//! and closures are adapted with [`handler_fn`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::broker::Job;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one reserved job. An error marks the job as failed; the
    /// consumer still acknowledges or releases it according to its policy.
    async fn process(&self, job: &Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Arc<H> {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        (**self).process(job).await
    }
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Box<H> {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        (**self).process(job).await
    }
}

/// Adapter turning an async function into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` so it can be used wherever a [`JobHandler`] is expected.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        (self.f)(job.clone()).await
    }
}
