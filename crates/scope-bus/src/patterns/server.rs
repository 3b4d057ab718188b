//! # Request/Reply Servers
//!
//! A method `m` of a server on scope `/s` lives on scope `/s/m/`:
//!
//! ```text
//!   RemoteServer ──REQUEST──► /s/m/ ──► LocalServer callback
//!   RemoteServer ◄──REPLY (cause = request id)── /s/m/ ◄──┘
//! ```
//!
//! A failing callback answers with a `REPLY` whose user infos carry
//! [`ERROR_KEY`] and whose payload is the error text.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_types::{DataType, Event, FilterChain, MethodFilter, Payload, Scope};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::future::{FutureTable, RpcFuture};
use crate::config::ParticipantConfig;
use crate::error::BusError;
use crate::handler::async_handler;
use crate::participant::{Informer, Listener, ParticipantContext};

/// Method of request events.
pub const REQUEST_METHOD: &str = "REQUEST";

/// Method of reply events.
pub const REPLY_METHOD: &str = "REPLY";

/// User info key marking a reply as a failure.
pub const ERROR_KEY: &str = "scopebus:error";

/// Implementation of a server method.
///
/// Plain closures `Fn(Event) -> anyhow::Result<Payload>` are callbacks.
#[async_trait]
pub trait Callback: Send + Sync {
    /// Compute the reply payload for `request`.
    async fn call(&self, request: Event) -> anyhow::Result<Payload>;
}

#[async_trait]
impl<F> Callback for F
where
    F: Fn(Event) -> anyhow::Result<Payload> + Send + Sync,
{
    async fn call(&self, request: Event) -> anyhow::Result<Payload> {
        self(request)
    }
}

/// Scope of `method` on a server at `scope`.
pub fn method_scope(scope: &Scope, method: &str) -> Result<Scope, BusError> {
    Ok(scope.concat(&Scope::new(&format!("/{method}"))?))
}

struct LocalMethod {
    listener: Listener,
    replier: Arc<Informer>,
}

/// Serves methods to [`RemoteServer`]s.
pub struct LocalServer {
    scope: Scope,
    context: ParticipantContext,
    config: ParticipantConfig,
    methods: Mutex<HashMap<String, LocalMethod>>,
}

impl LocalServer {
    pub(crate) fn new(scope: Scope, context: ParticipantContext, config: ParticipantConfig) -> Self {
        Self {
            scope,
            context,
            config,
            methods: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Serve `name` with `callback`. The method name must be a valid scope
    /// component.
    pub async fn add_method<C>(&self, name: &str, callback: C) -> Result<(), BusError>
    where
        C: Callback + 'static,
    {
        let mut methods = self.methods.lock().await;
        if methods.contains_key(name) {
            return Err(BusError::DuplicateMethod(name.to_string()));
        }
        let scope = method_scope(&self.scope, name)?;

        let replier = Arc::new(
            self.context
                .informer(scope.clone(), None, &self.config)
                .await?,
        );
        let listener = self.context.listener(scope.clone(), &self.config).await?;
        listener.add_filter(Arc::new(MethodFilter::new(REQUEST_METHOD)));

        let callback: Arc<dyn Callback> = Arc::new(callback);
        let answering = Arc::clone(&replier);
        listener.subscribe(
            FilterChain::new(),
            async_handler(move |request: Event| {
                let callback = Arc::clone(&callback);
                let replier = Arc::clone(&answering);
                async move { answer(callback, &replier, request).await }
            }),
        )?;

        debug!(scope = %scope, method = name, "Method added");
        methods.insert(name.to_string(), LocalMethod { listener, replier });
        Ok(())
    }

    /// Stop serving `name`. Returns false if it was not served.
    pub async fn remove_method(&self, name: &str) -> Result<bool, BusError> {
        let method = self.methods.lock().await.remove(name);
        match method {
            Some(method) => {
                method.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Served method names in sorted order.
    pub async fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop serving all methods.
    pub async fn deactivate(&self) -> Result<(), BusError> {
        let methods: Vec<_> = self.methods.lock().await.drain().collect();
        let mut first = Ok(());
        for (_, method) in methods {
            let closed = method.close().await;
            if first.is_ok() {
                first = closed;
            }
        }
        first
    }
}

impl LocalMethod {
    async fn close(&self) -> Result<(), BusError> {
        let listened = self.listener.deactivate().await;
        self.replier.deactivate().await?;
        listened
    }
}

impl fmt::Debug for LocalServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalServer")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Run `callback` for `request` and publish the reply.
async fn answer(
    callback: Arc<dyn Callback>,
    replier: &Informer,
    request: Event,
) -> anyhow::Result<()> {
    let Some(request_id) = request.id else {
        warn!(scope = %request.scope, "Ignoring request without id");
        return Ok(());
    };
    let scope = request.scope.clone();

    // A panicking callback still gets a reply.
    let outcome = tokio::spawn(async move { callback.call(request).await })
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("method panicked: {e}")));

    let reply = match outcome {
        Ok(payload) => Event::new(scope, payload),
        Err(e) => {
            debug!(scope = %scope, error = %e, "Method failed, sending error reply");
            Event::new(scope, Payload::new(format!("{e:#}"))).with_user_info(ERROR_KEY, "1")
        }
    }
    .with_method(REPLY_METHOD)
    .with_cause(request_id);

    replier.publish_event(reply).await?;
    Ok(())
}

struct RemoteMethod {
    informer: Informer,
    listener: Listener,
}

/// Calls methods of a [`LocalServer`].
pub struct RemoteServer {
    scope: Scope,
    context: ParticipantContext,
    config: ParticipantConfig,
    futures: Arc<FutureTable>,
    methods: Mutex<HashMap<String, Arc<RemoteMethod>>>,
}

impl RemoteServer {
    pub(crate) fn new(scope: Scope, context: ParticipantContext, config: ParticipantConfig) -> Self {
        Self {
            scope,
            context,
            config,
            futures: Arc::new(FutureTable::default()),
            methods: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Number of requests still awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.futures.len()
    }

    async fn method(&self, name: &str) -> Result<Arc<RemoteMethod>, BusError> {
        let mut methods = self.methods.lock().await;
        if let Some(method) = methods.get(name) {
            return Ok(Arc::clone(method));
        }
        let scope = method_scope(&self.scope, name)?;

        let listener = self.context.listener(scope.clone(), &self.config).await?;
        listener.add_filter(Arc::new(MethodFilter::new(REPLY_METHOD)));
        let futures = Arc::clone(&self.futures);
        listener.subscribe(FilterChain::new(), move |reply: Event| -> anyhow::Result<()> {
            futures.resolve(&reply);
            Ok(())
        })?;
        let informer = match self.context.informer(scope, None, &self.config).await {
            Ok(informer) => informer,
            Err(e) => {
                let _ = listener.deactivate().await;
                return Err(e);
            }
        };

        let method = Arc::new(RemoteMethod { informer, listener });
        methods.insert(name.to_string(), Arc::clone(&method));
        Ok(method)
    }

    /// Send a request to `method` and return the future of its reply.
    ///
    /// The reply listener is in place before the request leaves, and the
    /// future is registered before any connector sees the request.
    pub async fn invoke<T>(
        &self,
        method: &str,
        data: T,
        timeout: Duration,
    ) -> Result<RpcFuture, BusError>
    where
        T: Any + Send + Sync,
    {
        self.invoke_payload(method, Payload::new(data), timeout)
            .await
    }

    pub async fn invoke_payload(
        &self,
        method: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<RpcFuture, BusError> {
        let remote = self.method(method).await?;
        let request =
            Event::new(remote.informer.scope().clone(), payload).with_method(REQUEST_METHOD);

        let mut future = None;
        let sent = remote
            .informer
            .publish_correlated(request, |id| {
                future = Some(self.futures.register(id, timeout));
            })
            .await;
        match (sent, future) {
            (Ok(_), Some(future)) => Ok(future),
            (Err(e), future) => {
                if let Some(future) = future {
                    future.cancel();
                }
                Err(e)
            }
            (Ok(_), None) => Err(BusError::Closed),
        }
    }

    /// Invoke `method` and wait for a reply of type `R`.
    pub async fn call<T, R>(&self, method: &str, data: T, timeout: Duration) -> Result<R, BusError>
    where
        T: Any + Send + Sync,
        R: Any + Clone,
    {
        let reply = self.invoke(method, data, timeout).await?.wait().await?;
        reply
            .payload
            .downcast_ref::<R>()
            .cloned()
            .ok_or_else(|| BusError::ReplyType {
                expected: DataType::of::<R>(),
                actual: reply.data_type().clone(),
            })
    }

    /// Release the connectors of all invoked methods.
    pub async fn deactivate(&self) -> Result<(), BusError> {
        let methods: Vec<_> = self.methods.lock().await.drain().collect();
        let mut first = Ok(());
        for (_, method) in methods {
            let listened = method.listener.deactivate().await;
            let informed = method.informer.deactivate().await;
            if first.is_ok() {
                first = listened.and(informed);
            }
        }
        first
    }
}

impl fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServer")
            .field("scope", &self.scope)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FutureError;
    use bus_converter::default_converter_map;
    use bus_transport::TransportRegistry;
    use tokio::sync::broadcast;

    fn scope(s: &str) -> Scope {
        Scope::new(s).unwrap()
    }

    fn servers(on: &str) -> (LocalServer, RemoteServer) {
        let (errors, _) = broadcast::channel(16);
        let context = ParticipantContext::new(
            Arc::new(TransportRegistry::with_defaults()),
            Arc::new(default_converter_map().unwrap()),
            errors,
        );
        let config = ParticipantConfig::default();
        (
            LocalServer::new(scope(on), context.clone(), config.clone()),
            RemoteServer::new(scope(on), context, config),
        )
    }

    fn double(request: Event) -> anyhow::Result<Payload> {
        let value = request
            .payload
            .downcast_ref::<i64>()
            .ok_or_else(|| anyhow::anyhow!("expected an integer"))?;
        Ok(Payload::new(value * 2))
    }

    #[test]
    fn test_method_scope() {
        assert_eq!(method_scope(&scope("/s"), "m").unwrap(), scope("/s/m"));
        assert!(matches!(
            method_scope(&scope("/s"), "no spaces"),
            Err(BusError::Scope(_))
        ));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (local, remote) = servers("/calc");
        local.add_method("double", double).await.unwrap();

        let result: i64 = remote
            .call("double", 21i64, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_fails_future() {
        let (local, remote) = servers("/calc");
        local.add_method("double", double).await.unwrap();

        let future = remote
            .invoke("double", "not a number".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            future.wait().await.unwrap_err(),
            FutureError::Remote("expected an integer".into())
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_still_replies() {
        let (local, remote) = servers("/calc");
        local
            .add_method("boom", |_request: Event| -> anyhow::Result<Payload> {
                panic!("callback exploded")
            })
            .await
            .unwrap();

        let future = remote
            .invoke("boom", (), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            future.wait().await,
            Err(FutureError::Remote(message)) if message.contains("panicked")
        ));
    }

    #[tokio::test]
    async fn test_unknown_method_times_out() {
        let (_local, remote) = servers("/calc");
        let future = remote
            .invoke("missing", 1i64, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(
            future.wait().await.unwrap_err(),
            FutureError::Timeout(Duration::from_millis(50))
        );
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_invocations_are_not_pending() {
        let (_local, remote) = servers("/calc");
        for i in 0..50i64 {
            let future = remote
                .invoke("missing", i, Duration::from_millis(1))
                .await
                .unwrap();
            drop(future);
        }
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_removed_methods() {
        let (local, _remote) = servers("/calc");
        local.add_method("double", double).await.unwrap();
        assert!(matches!(
            local.add_method("double", double).await,
            Err(BusError::DuplicateMethod(_))
        ));
        assert_eq!(local.method_names().await, vec!["double"]);
        assert!(local.remove_method("double").await.unwrap());
        assert!(!local.remove_method("double").await.unwrap());
        local.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_type_mismatch() {
        let (local, remote) = servers("/calc");
        local.add_method("double", double).await.unwrap();
        let result: Result<String, _> = remote.call("double", 2i64, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(BusError::ReplyType { .. })));
    }
}
