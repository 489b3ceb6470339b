//! Group registry and round-robin dispatcher, gateway-side.
//!
//! One lock guards both the flat client map and the per-group ordered lists
//! so registration and removal stay atomic across the two (mirrors the
//! connection manager's single-lock-for-both-maps rule in §4.3).

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::anyproxy::tunnel::connection_manager::ConnectionManager;
use crate::anyproxy::tunnel::protocol::Frame;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("group_id is required")]
    MissingGroup,
    #[error("password does not match the group's existing credential")]
    CredentialMismatch,
}

/// One registered client's outbound frame sink: the tunnel's writer task
/// reads from the other end and serializes every write onto the wire.
#[derive(Clone)]
pub struct ClientRecord {
    pub client_id: String,
    pub group_id: String,
    pub writer: mpsc::Sender<Frame>,
    pub connections: std::sync::Arc<ConnectionManager>,
}

#[derive(Debug, Default)]
struct GroupState {
    clients: Vec<String>,
    counter: u64,
    password: String,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<String, ClientRecord>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
pub struct GroupRegistry {
    state: RwLock<RegistryState>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Implements the handshake credential rule in §4.5: a brand-new or
    /// emptied-out group accepts whatever password is presented; a group
    /// with at least one active client enforces that password.
    pub async fn register_client(
        &self,
        client_id: String,
        group_id: String,
        password: String,
        writer: mpsc::Sender<Frame>,
        connections: std::sync::Arc<ConnectionManager>,
    ) -> Result<(), RegisterError> {
        if group_id.trim().is_empty() {
            return Err(RegisterError::MissingGroup);
        }

        let mut state = self.state.write().await;
        let group = state.groups.entry(group_id.clone()).or_default();

        if group.clients.is_empty() {
            group.password = password;
            group.counter = 0;
        } else if group.password != password {
            return Err(RegisterError::CredentialMismatch);
        }

        group.clients.push(client_id.clone());
        state.clients.insert(
            client_id.clone(),
            ClientRecord {
                client_id,
                group_id,
                writer,
                connections,
            },
        );
        Ok(())
    }

    /// Removes the client from its group and flat map; if the group is now
    /// empty its credential is discarded (§4.5 "credential wipe").
    pub async fn unregister_client(&self, client_id: &str) {
        let mut state = self.state.write().await;
        let Some(record) = state.clients.remove(client_id) else {
            return;
        };
        if let Some(group) = state.groups.get_mut(&record.group_id) {
            group.clients.retain(|id| id != client_id);
            if group.clients.is_empty() {
                state.groups.remove(&record.group_id);
            }
        }
    }

    /// Front-end credential check: `validate(group_id, password) -> bool`.
    pub async fn validate(&self, group_id: &str, password: &str) -> bool {
        let state = self.state.read().await;
        match state.groups.get(group_id) {
            Some(group) if !group.clients.is_empty() => group.password == password,
            _ => false,
        }
    }

    /// Round-robin selection within a group: scans forward from the stored
    /// counter, picks the first id that still resolves in the flat client
    /// map, and advances the counter to one past the chosen index.
    pub async fn select_client(&self, group_id: &str) -> Option<ClientRecord> {
        let mut state = self.state.write().await;
        let group = state.groups.get(group_id)?;
        let n = group.clients.len();
        if n == 0 {
            return None;
        }

        let start = (group.counter as usize) % n;
        let mut chosen = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let id = &group.clients[idx];
            if state.clients.contains_key(id) {
                chosen = Some((idx, id.clone()));
                break;
            }
        }
        let (idx, client_id) = chosen?;

        let group = state.groups.get_mut(group_id)?;
        group.counter = (idx as u64 + 1) % n as u64;

        state.clients.get(&client_id).cloned()
    }

    /// Dials a specific client directly, bypassing group round-robin — used
    /// by the port-forward manager, which must route through the owning
    /// client rather than any member of its group.
    pub async fn get_client(&self, client_id: &str) -> Option<ClientRecord> {
        self.state.read().await.clients.get(client_id).cloned()
    }
}
