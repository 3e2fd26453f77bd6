//! Signaling Dispatcher - one per connection
//!
//! Decodes inbound frames, routes them to the service or the session broker
//! and turns results into reply frames. Replies carry the request id of the
//! frame they answer.

use crate::engine::{EngineEvent, EngineEventReceiver};
use crate::error::Result;
use crate::peer::{OutboundReceiver, SfuPeer};
use crate::protocol::{ClientMessage, ClientRequest, ServerFrame, ServerMessage};
use crate::service::SignalingService;
use crate::session::SessionBroker;
use crate::types::{Direction, PeerId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SignalingDispatcher {
    peer: Arc<SfuPeer>,
    service: Arc<SignalingService>,
    broker: Arc<SessionBroker>,
}

impl SignalingDispatcher {
    /// Register a new connection and queue its `welcome` frame.
    ///
    /// The caller drives the returned receivers: outbound frames go to the
    /// socket writer, engine events go back into [`Self::handle_engine_event`].
    pub fn connect(
        service: Arc<SignalingService>,
        broker: Arc<SessionBroker>,
    ) -> (Self, OutboundReceiver, EngineEventReceiver) {
        let (peer, outbound, events) = SfuPeer::new(PeerId::generate());
        service.hub().register(Arc::clone(&peer));
        peer.push(ServerMessage::Welcome {
            peer_id: peer.id.clone(),
        });
        (
            Self {
                peer,
                service,
                broker,
            },
            outbound,
            events,
        )
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer.id
    }

    #[must_use]
    pub fn peer(&self) -> &Arc<SfuPeer> {
        &self.peer
    }

    /// Handle one text frame and queue its reply, if any
    pub async fn handle_text(&self, text: &str) {
        let reply = match ClientRequest::decode(text) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                warn!(peer_id = %self.peer.id, error = %err.error, "Malformed signaling frame");
                Some(ServerFrame::reply(
                    err.request_id,
                    ServerMessage::from(&err.error),
                ))
            }
        };
        if let Some(frame) = reply {
            self.peer.send(frame);
        }
    }

    /// Handle one decoded request. `connectTransport` gets no reply.
    pub async fn handle(&self, request: ClientRequest) -> Option<ServerFrame> {
        let ClientRequest {
            request_id,
            message,
        } = request;
        let name = message.name();
        debug!(peer_id = %self.peer.id, message = name, "Signaling message received");

        match self.dispatch(message).await {
            Ok(reply) => reply.map(|message| ServerFrame::reply(request_id, message)),
            Err(err) => {
                debug!(
                    peer_id = %self.peer.id,
                    message = name,
                    code = err.code(),
                    error = %err,
                    "Signaling request rejected"
                );
                Some(ServerFrame::reply(request_id, ServerMessage::from(&err)))
            }
        }
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<Option<ServerMessage>> {
        let service = &self.service;
        let peer = &self.peer;
        let reply = match message {
            ClientMessage::JoinRoom { room_id } => {
                let existing_producers = service.join_room(peer, room_id.clone()).await?;
                ServerMessage::Joined {
                    room_id,
                    existing_producers,
                }
            }
            ClientMessage::LeaveRoom => ServerMessage::Left {
                room_id: service.leave_room(peer).await,
            },
            ClientMessage::GetRtpCapabilities => ServerMessage::RtpCapabilities {
                rtp_capabilities: service.rtp_capabilities(peer).await?,
            },
            ClientMessage::CreateTransport { sender } => {
                let direction = Direction::from_sender(sender);
                let params = service.create_transport(peer, direction).await?;
                ServerMessage::TransportCreated { direction, params }
            }
            ClientMessage::ConnectTransport {
                direction,
                dtls_parameters,
            } => {
                if let Err(err) = service
                    .connect_transport(peer, direction, dtls_parameters)
                    .await
                {
                    warn!(
                        peer_id = %peer.id,
                        direction = %direction,
                        error = %err,
                        "Transport connect failed"
                    );
                }
                return Ok(None);
            }
            ClientMessage::Produce {
                kind,
                rtp_parameters,
            } => ServerMessage::Produced {
                id: service.produce(peer, kind, rtp_parameters).await?,
            },
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let consumer = service
                    .consume(peer, &producer_id, &rtp_capabilities)
                    .await?;
                ServerMessage::Consumed {
                    id: consumer.id().clone(),
                    producer_id: consumer.producer_id().clone(),
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters(),
                }
            }
            ClientMessage::ResumeConsumer { consumer_id } => {
                service.resume_consumer(peer, &consumer_id).await?;
                ServerMessage::ConsumerResumed { consumer_id }
            }
            ClientMessage::GetProducers => ServerMessage::Producers {
                producers: service.producers(peer).await?,
            },
            ClientMessage::RequestSession { target_peer_id } => ServerMessage::SessionRequested {
                session_id: self.broker.request_session(&peer.id, &target_peer_id)?,
            },
            ClientMessage::UpdateRoomId {
                session_id,
                room_id,
            } => {
                self.broker
                    .update_room_id(&peer.id, &session_id, room_id.clone())
                    .await?;
                ServerMessage::RoomIdUpdated {
                    session_id,
                    room_id,
                }
            }
        };
        Ok(Some(reply))
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        self.service.handle_engine_event(&self.peer, event).await;
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn disconnect(&self) {
        let left = self.service.disconnect_peer(&self.peer).await;
        self.broker.forget_peer(&self.peer.id);
        self.service.hub().unregister(&self.peer.id);
        info!(
            peer_id = %self.peer.id,
            room_id = ?left,
            "Peer disconnected"
        );
    }
}
