//! Signaling protocol messages
//!
//! JSON text frames. Every frame carries a `type` tag; client requests may
//! carry a numeric `requestId` which the server echoes on the reply so
//! clients can correlate acknowledgements with requests.

use crate::engine::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::error::Error;
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, SessionId};
use serde::{Deserialize, Serialize};

/// Client-to-server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a room, creating it if needed
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },
    /// Leave the current room
    LeaveRoom,
    /// Router RTP capabilities of the current room
    GetRtpCapabilities,
    /// Create the send (`sender: true`) or receive transport
    CreateTransport { sender: bool },
    /// Complete DTLS setup of one transport; no reply
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        direction: Direction,
        dtls_parameters: DtlsParameters,
    },
    /// Publish one track through the send transport
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Subscribe to a producer through the receive transport
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    /// Every producer in the current room
    GetProducers,
    /// Open a pairing session with another connected peer
    #[serde(rename_all = "camelCase")]
    RequestSession { target_peer_id: PeerId },
    /// Move both peers of a session into `room_id`
    #[serde(rename_all = "camelCase")]
    UpdateRoomId {
        session_id: SessionId,
        room_id: RoomId,
    },
}

impl ClientMessage {
    /// Message name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom => "leaveRoom",
            Self::GetRtpCapabilities => "getRtpCapabilities",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resumeConsumer",
            Self::GetProducers => "getProducers",
            Self::RequestSession { .. } => "requestSession",
            Self::UpdateRoomId { .. } => "updateRoomId",
        }
    }
}

/// One inbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// A frame that could not be decoded, with whatever request id was readable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub request_id: Option<u64>,
    pub error: Error,
}

impl ClientRequest {
    /// Decode and validate one text frame
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| DecodeError {
            request_id: None,
            error: e.into(),
        })?;
        let request_id = value.get("requestId").and_then(serde_json::Value::as_u64);
        serde_json::from_value(value).map_err(|e| DecodeError {
            request_id,
            error: e.into(),
        })
    }
}

/// Existing producer announced to a joining peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
}

/// Server-to-client messages: replies and pushed events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First frame on every connection
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: RoomId,
        existing_producers: Vec<ProducerInfo>,
    },
    #[serde(rename_all = "camelCase")]
    RtpCapabilities { rtp_capabilities: RtpCapabilities },
    TransportCreated {
        direction: Direction,
        #[serde(flatten)]
        params: TransportParams,
    },
    Produced { id: ProducerId },
    #[serde(rename_all = "camelCase")]
    Consumed {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },
    Producers { producers: Vec<ProducerId> },
    #[serde(rename_all = "camelCase")]
    Left { room_id: Option<RoomId> },
    #[serde(rename_all = "camelCase")]
    SessionRequested { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    RoomIdUpdated {
        session_id: SessionId,
        room_id: RoomId,
    },
    Error { code: String, message: String },

    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { peer_id: PeerId },
    /// The producer behind one of the client's consumers went away
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// A pairing session naming this client was opened
    #[serde(rename_all = "camelCase")]
    NewSession {
        session_id: SessionId,
        peer_id: PeerId,
    },
    /// This client was moved into the session's shared room
    #[serde(rename_all = "camelCase")]
    RoomIdUpdate {
        session_id: SessionId,
        room_id: RoomId,
    },
}

impl From<&Error> for ServerMessage {
    fn from(err: &Error) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// One outbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerFrame {
    /// Reply to a request
    #[must_use]
    pub const fn reply(request_id: Option<u64>, message: ServerMessage) -> Self {
        Self {
            request_id,
            message,
        }
    }

    /// Unsolicited push
    #[must_use]
    pub const fn event(message: ServerMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }
}
