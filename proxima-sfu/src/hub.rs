use crate::peer::SfuPeer;
use crate::protocol::ServerMessage;
use crate::room::SfuRoom;
use crate::types::PeerId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// In-memory hub of connected peers
///
/// Routes topology events to room members and targeted pushes (pairing
/// sessions) to single peers. Delivery is FIFO per recipient.
#[derive(Default)]
pub struct PeerHub {
    peers: DashMap<PeerId, Arc<SfuPeer>>,
}

impl PeerHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<SfuPeer>) {
        info!(peer_id = %peer.id, "Peer connected");
        self.peers.insert(peer.id.clone(), peer);
    }

    pub fn unregister(&self, peer_id: &PeerId) -> Option<Arc<SfuPeer>> {
        let removed = self.peers.remove(peer_id).map(|(_, peer)| peer);
        if removed.is_some() {
            info!(peer_id = %peer_id, "Peer unregistered");
        } else {
            debug!(peer_id = %peer_id, "Attempted to unregister unknown peer");
        }
        removed
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<SfuPeer>> {
        self.peers.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Push an event to one peer
    pub fn send_to(&self, peer_id: &PeerId, message: ServerMessage) -> bool {
        match self.get(peer_id) {
            Some(peer) => peer.push(message),
            None => {
                warn!(peer_id = %peer_id, "Push to unknown peer dropped");
                false
            }
        }
    }

    /// Push an event to every member of `room` except `sender`
    pub fn broadcast_to_others(
        &self,
        room: &SfuRoom,
        sender: &PeerId,
        message: &ServerMessage,
    ) -> usize {
        let mut sent_count = 0;
        for peer_id in room.other_peers(sender) {
            if let Some(peer) = self.get(&peer_id) {
                if peer.push(message.clone()) {
                    sent_count += 1;
                }
            }
        }

        debug!(
            room_id = %room.id(),
            sender = %sender,
            sent_count,
            "Event broadcast complete"
        );
        sent_count
    }
}
