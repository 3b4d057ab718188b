//! Group bus: one session shared by the connectors of a factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bus_converter::ConverterSelection;
use bus_types::Event;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    groups_for, GroupCommunication, GroupConnection, GroupMessage, GroupSession, ServiceType,
    MAX_MESSAGE_SIZE,
};
use crate::error::TransportError;
use crate::notification::{encode_event, AssemblyPool, FragmentedNotification};
use crate::sinks::{ConvertingSink, SinkTable};

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const ASSEMBLY_MAX_AGE: Duration = Duration::from_secs(30);

/// A group communication session with reference counted memberships and
/// local dispatch of received events.
#[derive(Debug)]
pub struct GroupBus {
    backend: String,
    session: Arc<dyn GroupSession>,
    memberships: Mutex<HashMap<String, usize>>,
    sinks: Arc<SinkTable>,
    receiver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl GroupBus {
    async fn open(backend: &dyn GroupCommunication) -> Result<Self, TransportError> {
        let GroupConnection { session, messages } = backend.connect().await?;
        let sinks = Arc::new(SinkTable::default());
        let receiver = tokio::spawn(receive_loop(messages, Arc::clone(&sinks)));
        info!(backend = backend.name(), "Group bus connected");
        Ok(Self {
            backend: backend.name().to_string(),
            session,
            memberships: Mutex::new(HashMap::new()),
            sinks,
            receiver: parking_lot::Mutex::new(Some(receiver)),
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("group://{}", self.backend)
    }

    /// Groups this bus is a member of, with their use counts.
    pub async fn memberships(&self) -> HashMap<String, usize> {
        self.memberships.lock().await.clone()
    }

    /// Number of in-connectors attached.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub(crate) fn add_sink(&self, id: u64, sink: ConvertingSink) {
        self.sinks.insert(id, sink);
    }

    pub(crate) fn remove_sink(&self, id: u64) {
        self.sinks.remove(id);
    }

    /// Join `group` unless another connector already did.
    pub(crate) async fn join(&self, group: &str) -> Result<(), TransportError> {
        let mut memberships = self.memberships.lock().await;
        match memberships.get_mut(group) {
            Some(count) => {
                debug!(group, from = *count, to = *count + 1, "Incrementing group membership");
                *count += 1;
            }
            None => {
                self.session.join(group).await?;
                debug!(group, "Joined group");
                memberships.insert(group.to_string(), 1);
            }
        }
        Ok(())
    }

    /// Drop one use of `group`; leaves it when it was the last.
    pub(crate) async fn leave(&self, group: &str) -> Result<(), TransportError> {
        let mut memberships = self.memberships.lock().await;
        let Some(count) = memberships.get_mut(group) else {
            return Ok(());
        };
        *count -= 1;
        if *count == 0 {
            memberships.remove(group);
            self.session.leave(group).await?;
            debug!(group, "Left group");
        }
        Ok(())
    }

    /// Send `event` to the groups of its scope and all super scopes.
    pub(crate) async fn send(
        &self,
        event: &Event,
        converters: &dyn ConverterSelection,
        service: ServiceType,
    ) -> Result<(), TransportError> {
        let groups = groups_for(&event.scope);
        let fragments = encode_event(event, converters, MAX_MESSAGE_SIZE)?;
        debug!(
            scope = %event.scope,
            fragments = fragments.len(),
            ?service,
            "Sending event to groups"
        );
        for fragment in fragments {
            self.session
                .multicast(&groups, service, fragment.to_bytes()?)
                .await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Failed to close group session");
        }
        let receiver = self.receiver.lock().take();
        if let Some(mut receiver) = receiver {
            if tokio::time::timeout(CLOSE_GRACE, &mut receiver).await.is_err() {
                receiver.abort();
            }
        }
        info!(url = %self.url(), "Group bus closed");
    }
}

async fn receive_loop(
    mut messages: mpsc::UnboundedReceiver<GroupMessage>,
    sinks: Arc<SinkTable>,
) {
    let mut pool = AssemblyPool::new();
    while let Some(message) = messages.recv().await {
        let fragment = match FragmentedNotification::from_bytes(&message.payload) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable group message");
                bus_telemetry::frame_dropped("decode");
                continue;
            }
        };
        match pool.add(fragment) {
            Ok(Some(notification)) => {
                sinks.deliver(&notification);
            }
            Ok(None) => {
                pool.prune(ASSEMBLY_MAX_AGE);
            }
            Err(e) => {
                warn!(error = %e, "Dropping group message fragment");
                bus_telemetry::frame_dropped("assembly");
            }
        }
    }
    debug!("Group receive loop stopped");
}

/// The lazily opened, reference counted bus of one factory.
#[derive(Debug)]
pub(crate) struct SharedGroupBus {
    backend: Arc<dyn GroupCommunication>,
    state: Mutex<Option<(Arc<GroupBus>, usize)>>,
}

impl SharedGroupBus {
    pub(crate) fn new(backend: Arc<dyn GroupCommunication>) -> Self {
        Self {
            backend,
            state: Mutex::new(None),
        }
    }

    pub(crate) async fn acquire(&self) -> Result<Arc<GroupBus>, TransportError> {
        let mut state = self.state.lock().await;
        if let Some((bus, users)) = state.as_mut() {
            *users += 1;
            return Ok(Arc::clone(bus));
        }
        let bus = Arc::new(GroupBus::open(self.backend.as_ref()).await?);
        *state = Some((Arc::clone(&bus), 1));
        Ok(bus)
    }

    pub(crate) async fn release(&self, bus: &Arc<GroupBus>) {
        let closing = {
            let mut state = self.state.lock().await;
            match state.as_mut() {
                Some((current, users)) if Arc::ptr_eq(current, bus) => {
                    *users -= 1;
                    if *users == 0 {
                        state.take().map(|(bus, _)| bus)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(bus) = closing {
            bus.close().await;
        }
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub(crate) fn backend_name(&self) -> &str {
        self.backend.name()
    }
}
