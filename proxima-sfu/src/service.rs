//! Signaling service - the per-event protocol operations
//!
//! Each operation takes the acting peer, locks that peer's state for the
//! duration of the call and touches room state only through short critical
//! sections. Room topology changes are broadcast through the [`PeerHub`].

use crate::config::SfuConfig;
use crate::engine::{
    Consumer, DtlsParameters, EngineEvent, RtpCapabilities, RtpParameters, SfuEngine,
    TransportOptions, TransportParams,
};
use crate::error::{Error, Result};
use crate::hub::PeerHub;
use crate::peer::{PeerState, SfuPeer};
use crate::protocol::{ProducerInfo, ServerMessage};
use crate::registry::RoomRegistry;
use crate::transport::TransportHandle;
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SignalingService {
    engine: Arc<dyn SfuEngine>,
    config: Arc<SfuConfig>,
    registry: Arc<RoomRegistry>,
    hub: Arc<PeerHub>,
}

impl SignalingService {
    pub fn new(registry: Arc<RoomRegistry>, hub: Arc<PeerHub>) -> Self {
        Self {
            engine: Arc::clone(registry.engine()),
            config: Arc::new(registry.config().clone()),
            registry,
            hub,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub(crate) fn ensure_engine(&self) -> Result<()> {
        if self.engine.is_alive() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Reject empty and oversized room ids
    pub fn validate_room_id(&self, room_id: &RoomId) -> Result<()> {
        let len = room_id.as_str().len();
        if len == 0 {
            return Err(Error::InvalidPayload("roomId must not be empty".to_string()));
        }
        if len > self.config.max_room_id_len {
            return Err(Error::InvalidPayload(format!(
                "roomId exceeds {} bytes",
                self.config.max_room_id_len
            )));
        }
        Ok(())
    }

    /// Join `room_id`, creating it on first use.
    ///
    /// Returns the producers already published by other members.
    pub async fn join_room(&self, peer: &SfuPeer, room_id: RoomId) -> Result<Vec<ProducerInfo>> {
        self.ensure_engine()?;
        self.validate_room_id(&room_id)?;

        let mut state = peer.lock().await;
        if state.closed {
            return Err(Error::NotFound(format!("peer {}", peer.id)));
        }
        if let Some(current) = state.room_id() {
            return Err(Error::AlreadyJoined(current.to_string()));
        }

        let room = self.registry.join(&room_id, &peer.id).await?;
        state.room = Some(Arc::clone(&room));
        let existing = room.list_other_producers(&peer.id);

        self.hub.broadcast_to_others(
            &room,
            &peer.id,
            &ServerMessage::PeerJoined {
                peer_id: peer.id.clone(),
            },
        );
        info!(
            peer_id = %peer.id,
            room_id = %room_id,
            existing_producers = existing.len(),
            "Peer joined room"
        );
        Ok(existing)
    }

    /// Leave the current room; a no-op when not joined.
    ///
    /// Returns the room that was left.
    pub async fn leave_room(&self, peer: &SfuPeer) -> Option<RoomId> {
        let mut state = peer.lock().await;
        self.cleanup(&peer.id, &mut state).await
    }

    /// Leave for good: the peer is marked closed under its own lock, so no
    /// join racing with the disconnect can re-admit it.
    pub async fn disconnect_peer(&self, peer: &SfuPeer) -> Option<RoomId> {
        let mut state = peer.lock().await;
        state.closed = true;
        self.cleanup(&peer.id, &mut state).await
    }

    /// Release everything one peer holds, in protocol order:
    /// producers (one `producerClosed` each), consumers, transports, then a
    /// single `peerDisconnected`, and the room itself once it is empty.
    async fn cleanup(&self, peer_id: &PeerId, state: &mut PeerState) -> Option<RoomId> {
        let room = state.room.take();

        if let Some(room) = &room {
            for producer in room.take_producers(peer_id) {
                producer.close().await;
                self.hub.broadcast_to_others(
                    room,
                    peer_id,
                    &ServerMessage::ProducerClosed {
                        producer_id: producer.id().clone(),
                    },
                );
            }
        }

        for consumer in state.consumers.drain() {
            consumer.close().await;
        }
        for direction in [Direction::Send, Direction::Recv] {
            if let Some(transport) = state.transport_slot(direction).take() {
                transport.close().await;
            }
        }

        let room = room?;
        self.hub.broadcast_to_others(
            &room,
            peer_id,
            &ServerMessage::PeerDisconnected {
                peer_id: peer_id.clone(),
            },
        );
        if room.remove_peer(peer_id) {
            self.registry.release(&room).await;
        }
        info!(peer_id = %peer_id, room_id = %room.id(), "Peer left room");
        Some(room.id().clone())
    }

    pub async fn rtp_capabilities(&self, peer: &SfuPeer) -> Result<RtpCapabilities> {
        self.ensure_engine()?;
        let state = peer.lock().await;
        let room = state.room.as_ref().ok_or(Error::NotJoined)?;
        Ok(room.router().rtp_capabilities())
    }

    /// Create the send or receive transport of this peer
    pub async fn create_transport(
        &self,
        peer: &SfuPeer,
        direction: Direction,
    ) -> Result<TransportParams> {
        self.ensure_engine()?;
        let mut state = peer.lock().await;
        let room = state.room.clone().ok_or(Error::NotJoined)?;
        if state.transport(direction).is_some() {
            return Err(Error::TransportExists(direction.to_string()));
        }

        let options = TransportOptions::from_config(&self.config.transport, direction);
        let transport = room
            .router()
            .create_transport(&options, peer.engine_events())
            .await?;
        let handle = TransportHandle::new(peer.id.clone(), direction, transport);
        let params = handle.params();
        debug!(
            peer_id = %peer.id,
            transport_id = %handle.id(),
            direction = %direction,
            "Transport created"
        );
        *state.transport_slot(direction) = Some(handle);
        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        peer: &SfuPeer,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.ensure_engine()?;
        let state = peer.lock().await;
        let transport = state
            .transport(direction)
            .ok_or_else(|| Error::NotFound(format!("{direction} transport")))?;
        transport.connect(dtls_parameters).await?;
        debug!(peer_id = %peer.id, direction = %direction, "Transport connected");
        Ok(())
    }

    /// Publish one track and announce it to the rest of the room
    pub async fn produce(
        &self,
        peer: &SfuPeer,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        self.ensure_engine()?;
        let state = peer.lock().await;
        let room = state.room.clone().ok_or(Error::NotJoined)?;
        let transport = state
            .transport(Direction::Send)
            .ok_or_else(|| Error::NotFound("send transport".to_string()))?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().clone();
        room.add_producer(peer.id.clone(), producer);

        self.hub.broadcast_to_others(
            &room,
            &peer.id,
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                peer_id: peer.id.clone(),
                kind,
            },
        );
        info!(
            peer_id = %peer.id,
            room_id = %room.id(),
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Subscribe to a producer; the consumer starts paused
    pub async fn consume(
        &self,
        peer: &SfuPeer,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn Consumer>> {
        self.ensure_engine()?;
        let mut state = peer.lock().await;
        let room = state.room.clone().ok_or(Error::NotJoined)?;
        let transport = state
            .transport(Direction::Recv)
            .ok_or_else(|| Error::NotFound("recv transport".to_string()))?;

        if !room.router().can_consume(producer_id, rtp_capabilities) {
            return Err(Error::CannotConsume(producer_id.to_string()));
        }
        let consumer = transport.consume(producer_id, rtp_capabilities).await?;
        state.consumers.insert(Arc::clone(&consumer));

        debug!(
            peer_id = %peer.id,
            consumer_id = %consumer.id(),
            producer_id = %producer_id,
            "Consumer created"
        );
        Ok(consumer)
    }

    pub async fn resume_consumer(&self, peer: &SfuPeer, consumer_id: &ConsumerId) -> Result<()> {
        self.ensure_engine()?;
        let state = peer.lock().await;
        let consumer = state
            .consumers
            .get(consumer_id)
            .ok_or_else(|| Error::NotFound(format!("consumer {consumer_id}")))?;
        consumer.resume().await?;
        debug!(peer_id = %peer.id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Every producer in the caller's room, the caller's own included
    pub async fn producers(&self, peer: &SfuPeer) -> Result<Vec<ProducerId>> {
        let state = peer.lock().await;
        let room = state.room.as_ref().ok_or(Error::NotJoined)?;
        Ok(room.producer_ids())
    }

    /// Prune state after an engine-side close
    pub async fn handle_engine_event(&self, peer: &SfuPeer, event: EngineEvent) {
        let mut state = peer.lock().await;
        match event {
            EngineEvent::ProducerClosed {
                consumer_id,
                producer_id,
            } => {
                if state.consumers.remove(&consumer_id).is_some() {
                    debug!(
                        peer_id = %peer.id,
                        consumer_id = %consumer_id,
                        producer_id = %producer_id,
                        "Consumer closed with its producer"
                    );
                    peer.push(ServerMessage::ConsumerClosed {
                        consumer_id,
                        producer_id,
                    });
                }
            }
            EngineEvent::TransportClosed { transport_id } => {
                for direction in [Direction::Send, Direction::Recv] {
                    let slot = state.transport_slot(direction);
                    if slot.as_ref().is_some_and(|t| *t.id() == transport_id) {
                        *slot = None;
                        warn!(
                            peer_id = %peer.id,
                            transport_id = %transport_id,
                            direction = %direction,
                            "Transport closed by engine"
                        );
                        if direction == Direction::Recv {
                            state.consumers.drain();
                        }
                    }
                }
            }
        }
    }
}
