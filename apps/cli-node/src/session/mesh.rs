//! Mesh formation over the peer transport.
//!
//! For a session with participants P, the mesh is ready when every unordered
//! pair in P has an open channel and every participant has said so. The
//! controller tracks three layers of evidence per peer:
//!
//! 1. the transport reported our channel to the peer open (`local_open`);
//! 2. the peer sent us a `channel_open` envelope (`remote_open`);
//! 3. the peer declared `mesh_ready` (it has 1+2 for everyone else too).
//!
//! Glare avoidance needs no negotiation: a device dials exactly the peers
//! with a lexicographically greater device id and answers the rest.

use crate::utils::state::MeshStatus;
use std::collections::HashSet;

/// Actions the session task must perform after feeding the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshAction {
    /// Send a `channel_open` envelope to this peer.
    SendChannelOpen { to: String },
    /// Broadcast `mesh_ready` to every peer.
    BroadcastMeshReady,
    /// The observable mesh status changed.
    StatusChanged(MeshStatus),
}

pub struct MeshController {
    device_id: String,
    participants: Vec<String>,
    local_open: HashSet<String>,
    remote_open: HashSet<String>,
    ready_devices: HashSet<String>,
    own_ready_sent: bool,
    status: MeshStatus,
}

impl MeshController {
    pub fn new(device_id: &str, participants: Vec<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            participants,
            local_open: HashSet::new(),
            remote_open: HashSet::new(),
            ready_devices: HashSet::new(),
            own_ready_sent: false,
            status: MeshStatus::Incomplete,
        }
    }

    pub fn status(&self) -> &MeshStatus {
        &self.status
    }

    /// Peers this device must dial (device ids strictly greater than ours).
    pub fn peers_to_initiate(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.as_str() > self.device_id.as_str())
            .cloned()
            .collect()
    }

    /// Every peer in the session except ourselves.
    pub fn peers(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| **p != self.device_id)
            .cloned()
            .collect()
    }

    pub fn is_initiator_for(&self, peer: &str) -> bool {
        self.device_id.as_str() < peer
    }

    /// Transport says our channel to `peer` is open: announce it to the peer
    /// and re-evaluate readiness.
    pub fn on_local_channel_open(&mut self, peer: &str) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        if self.local_open.insert(peer.to_string()) {
            actions.push(MeshAction::SendChannelOpen {
                to: peer.to_string(),
            });
        }
        actions.extend(self.evaluate());
        actions
    }

    /// A peer announced its side of the channel is open.
    pub fn on_channel_open_received(&mut self, from: &str) -> Vec<MeshAction> {
        self.remote_open.insert(from.to_string());
        self.evaluate()
    }

    /// A peer declared the mesh ready from its point of view.
    pub fn on_mesh_ready_received(&mut self, from: &str) -> Vec<MeshAction> {
        self.ready_devices.insert(from.to_string());
        self.evaluate()
    }

    /// Transport lost the channel to `peer`. Ready is not monotone across
    /// peer loss: the status downgrades and the session layer decides whether
    /// the protocol can still finish.
    pub fn on_peer_closed(&mut self, peer: &str) -> Vec<MeshAction> {
        self.local_open.remove(peer);
        self.remote_open.remove(peer);
        self.ready_devices.remove(peer);
        let status = self.compute_status();
        self.transition(status)
    }

    fn evaluate(&mut self) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        let peers: HashSet<String> = self.peers().into_iter().collect();

        if !self.own_ready_sent
            && peers.is_subset(&self.local_open)
            && peers.is_subset(&self.remote_open)
        {
            self.own_ready_sent = true;
            self.ready_devices.insert(self.device_id.clone());
            actions.push(MeshAction::BroadcastMeshReady);
        }

        let status = self.compute_status();
        actions.extend(self.transition(status));
        actions
    }

    fn compute_status(&self) -> MeshStatus {
        let all_ready = self
            .participants
            .iter()
            .all(|p| self.ready_devices.contains(p));
        if all_ready && self.own_ready_sent {
            MeshStatus::Ready
        } else if self.ready_devices.is_empty() && self.local_open.is_empty() {
            MeshStatus::Incomplete
        } else {
            MeshStatus::PartiallyReady {
                ready_devices: self.ready_devices.clone(),
                total_devices: self.participants.len(),
            }
        }
    }

    fn transition(&mut self, status: MeshStatus) -> Vec<MeshAction> {
        if status != self.status {
            self.status = status.clone();
            vec![MeshAction::StatusChanged(status)]
        } else {
            Vec::new()
        }
    }
}
