//! Pull-based receiving participant.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::anyhow;
use bus_types::{Event, FilterChain, Scope};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::Stream;

use super::{Listener, Subscription};
use crate::error::BusError;

/// Queues received events until they are read.
///
/// Also usable as a [`Stream`] of events.
#[derive(Debug)]
pub struct Reader {
    listener: Listener,
    subscription: Subscription,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Reader {
    pub(crate) fn new(listener: Listener) -> Result<Self, BusError> {
        let (tx, events) = mpsc::unbounded_channel();
        let subscription = listener.subscribe(
            FilterChain::new(),
            move |event: Event| -> anyhow::Result<()> {
                tx.send(event).map_err(|_| anyhow!("reader dropped"))
            },
        )?;
        Ok(Self {
            listener,
            subscription,
            events,
        })
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        self.listener.scope()
    }

    /// The underlying listener, e.g. for adding filters.
    #[must_use]
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the reader is deactivated and every queued event
    /// has been read.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Take the next queued event without waiting.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(event))` - An event was queued
    /// - `Ok(None)` - Nothing queued
    /// - `Err(BusError::Closed)` - The reader was deactivated and is drained
    pub fn try_recv(&mut self) -> Result<Option<Event>, BusError> {
        match self.events.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BusError::Closed),
        }
    }

    pub async fn deactivate(&self) -> Result<(), BusError> {
        self.subscription.unsubscribe();
        self.listener.deactivate().await
    }
}

impl Stream for Reader {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticipantConfig;
    use crate::participant::ParticipantContext;
    use bus_converter::default_converter_map;
    use bus_transport::TransportRegistry;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    async fn setup() -> (Reader, crate::Informer) {
        let (errors, _) = broadcast::channel(16);
        let context = ParticipantContext::new(
            Arc::new(TransportRegistry::with_defaults()),
            Arc::new(default_converter_map().unwrap()),
            errors,
        );
        let config = ParticipantConfig::default();
        let listener = context.listener(scope("/r"), &config).await.unwrap();
        let informer = context.informer(scope("/r"), None, &config).await.unwrap();
        (Reader::new(listener).unwrap(), informer)
    }

    #[tokio::test]
    async fn test_recv_and_try_recv() {
        let (mut reader, informer) = setup().await;
        assert!(reader.try_recv().unwrap().is_none());

        informer.publish(1i64).await.unwrap();
        informer.publish(2i64).await.unwrap();

        let first = timeout(Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload.downcast_ref::<i64>(), Some(&1));
        let second = timeout(Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload.downcast_ref::<i64>(), Some(&2));
    }

    #[tokio::test]
    async fn test_stream() {
        let (reader, informer) = setup().await;
        for i in 0..3i64 {
            informer.publish(i).await.unwrap();
        }
        let values: Vec<i64> = timeout(
            Duration::from_secs(5),
            reader
                .take(3)
                .map(|event| *event.payload.downcast_ref::<i64>().unwrap())
                .collect(),
        )
        .await
        .unwrap();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_closed_after_deactivate() {
        let (mut reader, _informer) = setup().await;
        reader.deactivate().await.unwrap();
        let end = timeout(Duration::from_secs(5), reader.recv()).await.unwrap();
        assert!(end.is_none());
        assert!(matches!(reader.try_recv(), Err(BusError::Closed)));
    }
}
