//! Process-local group communication.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    GroupCommunication, GroupConnection, GroupMessage, GroupSession, ServiceType,
    GROUP_NAME_LENGTH,
};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct HubState {
    next_member: u64,
    members: HashMap<u64, mpsc::UnboundedSender<GroupMessage>>,
    groups: HashMap<String, HashSet<u64>>,
}

impl HubState {
    fn remove_member(&mut self, member: u64) {
        self.members.remove(&member);
        self.groups.retain(|_, members| {
            members.remove(&member);
            !members.is_empty()
        });
    }
}

/// Group communication between sessions of one process.
///
/// Clones share the same groups. Delivery is reliable and in send order
/// whatever service type is requested.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGroupHub {
    state: Arc<Mutex<HubState>>,
}

impl InMemoryGroupHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Number of sessions in `group`.
    #[must_use]
    pub fn member_count(&self, group: &str) -> usize {
        self.state.lock().groups.get(group).map_or(0, HashSet::len)
    }
}

#[async_trait]
impl GroupCommunication for InMemoryGroupHub {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<GroupConnection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = {
            let mut state = self.state.lock();
            state.next_member += 1;
            let member = state.next_member;
            state.members.insert(member, tx);
            member
        };
        Ok(GroupConnection {
            session: Arc::new(MemorySession {
                member,
                state: Arc::clone(&self.state),
            }),
            messages: rx,
        })
    }
}

#[derive(Debug)]
struct MemorySession {
    member: u64,
    state: Arc<Mutex<HubState>>,
}

impl MemorySession {
    fn check_connected(&self, state: &HubState) -> Result<(), TransportError> {
        if state.members.contains_key(&self.member) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl GroupSession for MemorySession {
    async fn join(&self, group: &str) -> Result<(), TransportError> {
        if group.is_empty() || group.len() > GROUP_NAME_LENGTH {
            return Err(TransportError::Group(format!(
                "group name {group:?} must have 1 to {GROUP_NAME_LENGTH} characters"
            )));
        }
        let mut state = self.state.lock();
        self.check_connected(&state)?;
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(self.member);
        Ok(())
    }

    async fn leave(&self, group: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        self.check_connected(&state)?;
        if let Some(members) = state.groups.get_mut(group) {
            members.remove(&self.member);
            if members.is_empty() {
                state.groups.remove(group);
            }
        }
        Ok(())
    }

    async fn multicast(
        &self,
        groups: &[String],
        service: ServiceType,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let state = self.state.lock();
        self.check_connected(&state)?;
        let recipients: BTreeSet<u64> = groups
            .iter()
            .filter_map(|group| state.groups.get(group))
            .flatten()
            .copied()
            .collect();
        trace!(groups = groups.len(), recipients = recipients.len(), ?service, "Multicast");

        let message = GroupMessage {
            groups: groups.to_vec(),
            service,
            payload,
        };
        for member in recipients {
            if let Some(tx) = state.members.get(&member) {
                // Receivers that went away are removed on close.
                let _ = tx.send(message.clone());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.lock().remove_member(self.member);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.state.lock().remove_member(self.member);
    }
}
