//! In-process registry of swap nodes, and session setup between them.

use std::sync::Arc;

use crossnotary_common::{Party, PartyId, RequestId, Result, SwapError};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::node::SwapNode;
use crate::orchestrator;
use crate::session::Session;

/// Nodes reachable by party name.
#[derive(Default)]
pub struct SwapNetwork {
    nodes: DashMap<PartyId, Arc<SwapNode>>,
}

impl SwapNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable. Party names are unique.
    pub fn register(&self, node: Arc<SwapNode>) -> Result<()> {
        let name = node.party().name.clone();
        if self.nodes.contains_key(&name) {
            return Err(SwapError::ValidationFailure(format!(
                "party {} is already registered",
                name
            )));
        }
        info!(party = %name, key = %node.public_key().key_id(), "Node registered");
        self.nodes.insert(name, node);
        Ok(())
    }

    pub fn node(&self, name: &PartyId) -> Result<Arc<SwapNode>> {
        self.nodes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SwapError::NotFound(format!("party {} is not on the network", name)))
    }

    /// Identity of a registered party.
    pub fn party(&self, name: &PartyId) -> Result<Party> {
        Ok(self.node(name)?.party().clone())
    }

    pub fn parties(&self) -> Vec<Party> {
        let mut parties: Vec<Party> = self
            .nodes
            .iter()
            .map(|entry| entry.value().party().clone())
            .collect();
        parties.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        parties
    }

    /// Open a session from `from` to `to` for `request_id`. The remote end
    /// is served by a responder task on the peer's node.
    pub fn connect(&self, from: &SwapNode, to: &Party, request_id: RequestId) -> Result<Session> {
        let remote = self.node(&to.name)?;
        if remote.public_key() != to.key {
            return Err(SwapError::AuthorizationFailure(format!(
                "{} answers with key {}, expected {}",
                to.name,
                remote.public_key().key_id(),
                to.key.key_id()
            )));
        }

        let (local, peer) = Session::pair(request_id, from.endpoint(), remote.endpoint());
        debug!(request_id = %request_id, from = %from.party(), to = %to, "Session opened");
        tokio::spawn(orchestrator::respond(remote, peer));
        Ok(local)
    }
}
