//! Event handlers invoked by subscriptions.

use std::future::Future;

use async_trait::async_trait;
use bus_types::Event;

/// Receives the events of one subscription, one at a time and in arrival
/// order.
///
/// Errors and panics are contained by the pipeline and reported as
/// [`HandlerErrorReport`](crate::HandlerErrorReport)s; the subscription keeps
/// receiving.
///
/// Plain closures `Fn(Event) -> anyhow::Result<()>` are handlers; wrap async
/// closures with [`async_handler`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(Event) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handler backed by an async closure. See [`async_handler`].
pub struct AsyncHandler<F>(F);

/// Turn an async closure into a [`Handler`].
pub fn async_handler<F, Fut>(f: F) -> AsyncHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    AsyncHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for AsyncHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}
