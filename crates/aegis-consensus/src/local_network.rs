// IN-PROCESS NETWORK
// Transport for clusters running in one process, with fault injection.
//
// Delivery is synchronous into the receiver's bounded inbound queue, so
// frames on one link arrive in send order. Faults are directional link cuts,
// whole-node isolation and per-sender kind filters.

use crate::collaborators::Transport;
use crate::engine::InboundHandle;
use crate::message::{MessageKind, SignedMessage};
use crate::types::NodeId;
use log::debug;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type KindFilter = Arc<dyn Fn(MessageKind) -> bool + Send + Sync>;

#[derive(Default)]
struct Links {
    endpoints: RwLock<HashMap<NodeId, InboundHandle>>,
    isolated: RwLock<HashSet<NodeId>>,

    /// (from, to) pairs whose frames are dropped
    cut: RwLock<HashSet<(NodeId, NodeId)>>,

    /// Outbound filters: a frame from the node is sent only if the filter passes
    filters: RwLock<HashMap<NodeId, KindFilter>>,

    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Links {
    fn blocked(&self, from: &NodeId, to: &NodeId, bytes: &[u8]) -> bool {
        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return true;
            }
        }
        if self.cut.read().contains(&(from.clone(), to.clone())) {
            return true;
        }
        match self.filters.read().get(from) {
            Some(filter) => match SignedMessage::decode(bytes) {
                Ok(signed) => !filter(signed.kind()),
                Err(_) => false,
            },
            None => false,
        }
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, bytes: &[u8]) {
        if from == to {
            return;
        }
        if self.blocked(from, to, bytes) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let endpoint = self.endpoints.read().get(to).cloned();
        let Some(endpoint) = endpoint else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match endpoint.handle_incoming(bytes) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Frame {} -> {} rejected: {}", from, to, e);
            }
        }
    }
}

/// Shared in-memory network. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    links: Arc<Links>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for `node_id` to hand to its engine.
    pub fn transport(&self, node_id: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node_id: node_id.into(),
            links: self.links.clone(),
        })
    }

    /// Route frames addressed to `node_id` into `inbound`.
    pub fn register(&self, node_id: impl Into<NodeId>, inbound: InboundHandle) {
        self.links.endpoints.write().insert(node_id.into(), inbound);
    }

    /// Drop every frame to or from `node_id`.
    pub fn isolate(&self, node_id: &str) {
        self.links.isolated.write().insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.links.isolated.write().remove(node_id);
    }

    /// Drop frames from `from` to `to` (one direction).
    pub fn drop_link(&self, from: &str, to: &str) {
        self.links
            .cut
            .write()
            .insert((from.to_string(), to.to_string()));
    }

    pub fn restore_link(&self, from: &str, to: &str) {
        self.links
            .cut
            .write()
            .remove(&(from.to_string(), to.to_string()));
    }

    /// Only let frames from `node_id` through when `allow` returns true for their kind.
    pub fn set_filter<F>(&self, node_id: &str, allow: F)
    where
        F: Fn(MessageKind) -> bool + Send + Sync + 'static,
    {
        self.links
            .filters
            .write()
            .insert(node_id.to_string(), Arc::new(allow));
    }

    pub fn clear_filter(&self, node_id: &str) {
        self.links.filters.write().remove(node_id);
    }

    /// Remove every fault.
    pub fn heal_all(&self) {
        self.links.isolated.write().clear();
        self.links.cut.write().clear();
        self.links.filters.write().clear();
    }

    /// (delivered, dropped) frame counts.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.links.delivered.load(Ordering::Relaxed),
            self.links.dropped.load(Ordering::Relaxed),
        )
    }
}

/// One node's view of a `LocalNetwork`.
pub struct LocalTransport {
    node_id: NodeId,
    links: Arc<Links>,
}

impl LocalTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl Transport for LocalTransport {
    fn send(&self, to: &NodeId, bytes: Vec<u8>) {
        self.links.deliver(&self.node_id, to, &bytes);
    }

    fn broadcast(&self, bytes: Vec<u8>) {
        let peers: Vec<NodeId> = self.links.endpoints.read().keys().cloned().collect();
        for peer in peers.iter().filter(|peer| **peer != self.node_id) {
            self.links.deliver(&self.node_id, peer, &bytes);
        }
    }
}
