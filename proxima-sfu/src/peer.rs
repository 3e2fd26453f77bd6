//! SFU Peer management
//!
//! This module handles:
//! - Per-connection signaling state (room membership, transports, consumers)
//! - The outbound message channel to the connection's writer task
//! - The engine event channel feeding the connection's own task

use crate::directory::ConsumerDirectory;
use crate::engine::{EngineEventReceiver, EngineEventSender};
use crate::protocol::{ServerFrame, ServerMessage};
use crate::room::SfuRoom;
use crate::transport::TransportHandle;
use crate::types::{Direction, PeerId, RoomId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub type OutboundSender = mpsc::UnboundedSender<ServerFrame>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerFrame>;

/// Mutable signaling state of one connection
#[derive(Default)]
pub struct PeerState {
    pub room: Option<Arc<SfuRoom>>,
    pub send_transport: Option<TransportHandle>,
    pub recv_transport: Option<TransportHandle>,
    pub consumers: ConsumerDirectory,
    /// Set by disconnect; a closed peer never joins again
    pub closed: bool,
}

impl PeerState {
    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref().map(|room| room.id())
    }

    #[must_use]
    pub fn transport(&self, direction: Direction) -> Option<&TransportHandle> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Recv => self.recv_transport.as_ref(),
        }
    }

    pub fn transport_slot(&mut self, direction: Direction) -> &mut Option<TransportHandle> {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Recv => &mut self.recv_transport,
        }
    }
}

/// SFU Peer - one connected client
///
/// The state mutex is held across engine calls for this peer only, which
/// serializes this peer's protocol events without blocking anyone else.
/// Lock order is peer state before room state, never the reverse.
pub struct SfuPeer {
    /// Peer ID
    pub id: PeerId,

    state: Mutex<PeerState>,

    outbound: OutboundSender,

    /// Handed to every transport this peer creates
    engine_events: EngineEventSender,
}

impl SfuPeer {
    /// Create a peer with its outbound and engine event receivers
    #[must_use]
    pub fn new(id: PeerId) -> (Arc<Self>, OutboundReceiver, EngineEventReceiver) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (engine_events, engine_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id,
            state: Mutex::new(PeerState::default()),
            outbound,
            engine_events,
        });
        (peer, outbound_rx, engine_rx)
    }

    pub async fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().await
    }

    /// Current room, if joined
    pub async fn room_id(&self) -> Option<RoomId> {
        self.state.lock().await.room_id().cloned()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    #[must_use]
    pub fn engine_events(&self) -> EngineEventSender {
        self.engine_events.clone()
    }

    /// Queue a frame for this peer's writer task.
    /// Returns false once the connection is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        match self.outbound.send(frame) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer_id = %self.id, "Outbound channel closed, dropping frame");
                false
            }
        }
    }

    pub fn push(&self, message: ServerMessage) -> bool {
        self.send(ServerFrame::event(message))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }
}

impl Drop for SfuPeer {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if let Some(room_id) = state.room_id() {
                warn!(peer_id = %self.id, room_id = %room_id, "SfuPeer dropped while still joined");
                return;
            }
        }
        debug!(peer_id = %self.id, "SfuPeer dropped");
    }
}

/// Peer statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub room_id: Option<RoomId>,
    pub has_send_transport: bool,
    pub has_recv_transport: bool,
    pub consumer_count: usize,
}

impl PeerState {
    #[must_use]
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            room_id: self.room_id().cloned(),
            has_send_transport: self.send_transport.is_some(),
            has_recv_transport: self.recv_transport.is_some(),
            consumer_count: self.consumers.len(),
        }
    }
}
