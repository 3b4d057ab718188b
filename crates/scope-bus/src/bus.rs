//! # Bus Facade
//!
//! Owns everything participants are built from and offers one-call
//! publish, subscribe and invoke on top of cached participants.
//!
//! | Operation | Participant | Released |
//! |-----------|-------------|----------|
//! | `publish` | one untyped informer on `/` | on shutdown |
//! | `subscribe` | one listener per scope | when its last subscription ends |
//! | `invoke` | one remote server per scope | when idle and the cache is full |

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_converter::{default_converter_map, ConverterMap};
use bus_transport::TransportRegistry;
use bus_types::{DataType, Event, FilterChain, Payload, Scope};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ParticipantConfig;
use crate::error::BusError;
use crate::handler::Handler;
use crate::participant::{Informer, Listener, ParticipantContext, Reader, Subscription};
use crate::patterns::{LocalServer, RemoteServer, RpcFuture};
use crate::pipeline::HandlerErrorReport;
use crate::DEFAULT_ERROR_CAPACITY;

/// Remote servers kept for [`Bus::invoke`] before idle ones are released.
pub const MAX_CACHED_REMOTES: usize = 64;

/// An explicitly owned event bus.
///
/// Holds the transport registry, the base converter map and the channel
/// handler failures are reported on. Participants created from one bus share
/// its transports; two buses in one process only meet over remote
/// transports.
pub struct Bus {
    /// Configuration used unless a `*_with` constructor is given another.
    config: ParticipantConfig,

    /// Transports, converters and the handler error channel.
    context: ParticipantContext,

    /// Root-scope informer used by [`Bus::publish`], created on first use.
    publisher: Mutex<Option<Arc<Informer>>>,

    /// Listeners used by [`Bus::subscribe`], by scope. Subscribing happens
    /// under this lock, so a listener seen idle here can be released.
    listeners: Mutex<HashMap<Scope, Arc<Listener>>>,

    /// Remote servers used by [`Bus::invoke`], by scope.
    remotes: Mutex<HashMap<Scope, Arc<RemoteServer>>>,

    /// Total events published through [`Bus::publish`].
    events_published: AtomicU64,
}

impl Bus {
    /// A bus with the `inprocess` and `socket` transports and the default
    /// converters.
    pub fn new(config: ParticipantConfig) -> Result<Self, BusError> {
        Ok(Self::with_parts(
            config,
            TransportRegistry::with_defaults(),
            default_converter_map()?,
            DEFAULT_ERROR_CAPACITY,
        ))
    }

    /// A bus from explicit parts. `error_capacity` bounds the handler error
    /// channel; slow report receivers miss the oldest reports.
    #[must_use]
    pub fn with_parts(
        config: ParticipantConfig,
        transports: TransportRegistry,
        converters: ConverterMap,
        error_capacity: usize,
    ) -> Self {
        let (errors, _) = broadcast::channel(error_capacity.max(1));
        info!(
            transports = ?transports.names(),
            converters = converters.len(),
            "Bus created"
        );
        Self {
            config,
            context: ParticipantContext::new(Arc::new(transports), Arc::new(converters), errors),
            publisher: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
            events_published: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ParticipantConfig {
        &self.config
    }

    /// Transport registry, e.g. for registering a group transport.
    #[must_use]
    pub fn transports(&self) -> &TransportRegistry {
        self.context.transports()
    }

    /// Base converter map. Changes apply to participants created afterwards.
    #[must_use]
    pub fn converters(&self) -> &ConverterMap {
        self.context.converters()
    }

    /// Failed handler invocations of every listener of this bus.
    #[must_use]
    pub fn handler_errors(&self) -> broadcast::Receiver<HandlerErrorReport> {
        self.context.errors().subscribe()
    }

    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    // =========================================================================
    // PARTICIPANTS
    // =========================================================================

    /// Informer accepting payloads of type `T` only.
    pub async fn create_informer<T: Any>(&self, scope: Scope) -> Result<Informer, BusError> {
        self.create_informer_with(scope, Some(DataType::of::<T>()), &self.config)
            .await
    }

    pub async fn create_informer_with(
        &self,
        scope: Scope,
        data_type: Option<DataType>,
        config: &ParticipantConfig,
    ) -> Result<Informer, BusError> {
        self.context.informer(scope, data_type, config).await
    }

    pub async fn create_listener(&self, scope: Scope) -> Result<Listener, BusError> {
        self.create_listener_with(scope, &self.config).await
    }

    pub async fn create_listener_with(
        &self,
        scope: Scope,
        config: &ParticipantConfig,
    ) -> Result<Listener, BusError> {
        self.context.listener(scope, config).await
    }

    pub async fn create_reader(&self, scope: Scope) -> Result<Reader, BusError> {
        self.create_reader_with(scope, &self.config).await
    }

    pub async fn create_reader_with(
        &self,
        scope: Scope,
        config: &ParticipantConfig,
    ) -> Result<Reader, BusError> {
        Reader::new(self.context.listener(scope, config).await?)
    }

    #[must_use]
    pub fn create_local_server(&self, scope: Scope) -> LocalServer {
        self.create_local_server_with(scope, self.config.clone())
    }

    #[must_use]
    pub fn create_local_server_with(&self, scope: Scope, config: ParticipantConfig) -> LocalServer {
        LocalServer::new(scope, self.context.clone(), config)
    }

    #[must_use]
    pub fn create_remote_server(&self, scope: Scope) -> RemoteServer {
        self.create_remote_server_with(scope, self.config.clone())
    }

    #[must_use]
    pub fn create_remote_server_with(
        &self,
        scope: Scope,
        config: ParticipantConfig,
    ) -> RemoteServer {
        RemoteServer::new(scope, self.context.clone(), config)
    }

    // =========================================================================
    // ONE-CALL OPERATIONS
    // =========================================================================

    /// Publish `data` on `scope`.
    pub async fn publish<T>(&self, scope: &Scope, data: T) -> Result<Event, BusError>
    where
        T: Any + Send + Sync,
    {
        let event = Event::new(scope.clone(), Payload::new(data));
        self.publish_event(event).await
    }

    /// Publish a prepared event on its scope.
    pub async fn publish_event(&self, event: Event) -> Result<Event, BusError> {
        let published = self.publisher().await?.publish_event(event).await?;
        self.events_published.fetch_add(1, Ordering::Relaxed);
        Ok(published)
    }

    async fn publisher(&self) -> Result<Arc<Informer>, BusError> {
        if let Some(informer) = self.publisher.lock().as_ref() {
            return Ok(Arc::clone(informer));
        }
        let created = Arc::new(
            self.context
                .informer(Scope::root(), None, &self.config)
                .await?,
        );
        let (informer, surplus) = {
            let mut publisher = self.publisher.lock();
            match publisher.as_ref() {
                Some(existing) => (Arc::clone(existing), Some(created)),
                None => {
                    *publisher = Some(Arc::clone(&created));
                    (created, None)
                }
            }
        };
        if let Some(surplus) = surplus {
            release("informer", surplus.deactivate().await);
        }
        Ok(informer)
    }

    /// Deliver events on `scope` and its sub-scopes that match `filters` to
    /// `handler`, until [`Bus::unsubscribe`].
    pub async fn subscribe<H>(
        &self,
        scope: &Scope,
        filters: FilterChain,
        handler: H,
    ) -> Result<Subscription, BusError>
    where
        H: Handler + 'static,
    {
        // Subscribing under the cache lock keeps a listener from being
        // released between lookup and subscription.
        {
            let listeners = self.listeners.lock();
            if let Some(listener) = listeners.get(scope) {
                let subscription = listener.subscribe(filters, handler)?;
                debug!(scope = %scope, subscription_id = subscription.id(), "Subscribed");
                return Ok(subscription);
            }
        }

        let created = Arc::new(self.context.listener(scope.clone(), &self.config).await?);
        let (subscription, surplus, idle) = {
            let mut listeners = self.listeners.lock();
            let idle = take_idle_listeners(&mut listeners);
            match listeners.entry(scope.clone()) {
                Entry::Occupied(entry) => {
                    (entry.get().subscribe(filters, handler), Some(created), idle)
                }
                Entry::Vacant(entry) => {
                    (entry.insert(created).subscribe(filters, handler), None, idle)
                }
            }
        };
        for listener in surplus.into_iter().chain(idle) {
            release("listener", listener.deactivate().await);
        }
        let subscription = subscription?;
        debug!(scope = %scope, subscription_id = subscription.id(), "Subscribed");
        Ok(subscription)
    }

    /// End a subscription. Returns false if it had already ended.
    ///
    /// The listener of the subscription's scope is released once it has no
    /// subscriptions left.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let ended = subscription.unsubscribe();
        let released = {
            let mut listeners = self.listeners.lock();
            let idle = listeners
                .get(subscription.scope())
                .is_some_and(|listener| listener.subscription_count() == 0);
            if idle {
                listeners.remove(subscription.scope())
            } else {
                None
            }
        };
        if let Some(listener) = released {
            debug!(scope = %subscription.scope(), "Releasing listener without subscriptions");
            release("listener", listener.deactivate().await);
        }
        ended
    }

    /// Invoke `method` of the server on `scope`.
    pub async fn invoke<T>(
        &self,
        scope: &Scope,
        method: &str,
        data: T,
        timeout: Duration,
    ) -> Result<RpcFuture, BusError>
    where
        T: Any + Send + Sync,
    {
        let (remote, evicted) = {
            let mut remotes = self.remotes.lock();
            let evicted = if remotes.contains_key(scope) || remotes.len() < MAX_CACHED_REMOTES {
                Vec::new()
            } else {
                take_idle_remotes(&mut remotes)
            };
            let remote = Arc::clone(
                remotes
                    .entry(scope.clone())
                    .or_insert_with(|| Arc::new(self.create_remote_server(scope.clone()))),
            );
            (remote, evicted)
        };
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Releasing idle remote servers");
        }
        for remote in evicted {
            release("remote server", remote.deactivate().await);
        }
        remote.invoke(method, data, timeout).await
    }

    /// Deactivate every participant created by the one-call operations.
    /// Participants created explicitly are left to their owners.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        let publisher = self.publisher.lock().take();
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        let remotes: Vec<_> = self.remotes.lock().drain().collect();

        let mut first = Ok(());
        let mut keep_first = |result: Result<(), BusError>| {
            if let Err(e) = &result {
                warn!(error = %e, "Failed to deactivate participant");
            }
            if first.is_ok() {
                first = result;
            }
        };
        if let Some(informer) = publisher {
            keep_first(informer.deactivate().await);
        }
        for (_, listener) in listeners {
            keep_first(listener.deactivate().await);
        }
        for (_, remote) in remotes {
            keep_first(remote.deactivate().await);
        }
        info!("Bus shut down");
        first
    }
}

/// Remove listeners whose subscriptions were all ended directly on their
/// handles.
fn take_idle_listeners(listeners: &mut HashMap<Scope, Arc<Listener>>) -> Vec<Arc<Listener>> {
    let idle: Vec<Scope> = listeners
        .iter()
        .filter(|(_, listener)| listener.subscription_count() == 0)
        .map(|(scope, _)| scope.clone())
        .collect();
    idle.iter()
        .filter_map(|scope| listeners.remove(scope))
        .collect()
}

/// Remove remote servers nobody holds and no reply is pending for.
fn take_idle_remotes(remotes: &mut HashMap<Scope, Arc<RemoteServer>>) -> Vec<Arc<RemoteServer>> {
    let idle: Vec<Scope> = remotes
        .iter()
        .filter(|(_, remote)| Arc::strong_count(remote) == 1 && remote.pending_count() == 0)
        .map(|(scope, _)| scope.clone())
        .collect();
    idle.iter().filter_map(|scope| remotes.remove(scope)).collect()
}

fn release(participant: &str, result: Result<(), BusError>) {
    if let Err(e) = result {
        warn!(participant, error = %e, "Failed to release cached participant");
    }
}
