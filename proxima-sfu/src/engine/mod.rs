//! Boundary to the external SFU media engine
//!
//! The coordinator sees the engine only through these traits. Every async
//! method is a potential suspension point and suspends only the calling
//! connection's task. `close()` on any handle must be idempotent.
//!
//! Engine-owned callbacks (a producer closing under a consumer, a router
//! closing under a transport) are delivered as [`EngineEvent`]s on the
//! channel handed to [`Router::create_transport`], so the owning connection
//! task processes them in order with its own protocol messages.

mod local;
#[cfg(feature = "mediasoup")]
mod worker;

pub use local::LocalEngine;
#[cfg(feature = "mediasoup")]
pub use worker::MediasoupEngine;

use crate::config::{CodecConfig, TransportConfig};
use crate::error::Result;
use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Router RTP capabilities, opaque to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

/// Producer or consumer RTP parameters, opaque to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// Client DTLS parameters, opaque to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// Connection parameters a client needs to set up its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: Vec<serde_json::Value>,
    pub dtls_parameters: serde_json::Value,
}

/// Options for creating one WebRTC transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub direction: Direction,
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl TransportOptions {
    #[must_use]
    pub fn from_config(config: &TransportConfig, direction: Direction) -> Self {
        Self {
            direction,
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            enable_udp: config.enable_udp,
            enable_tcp: config.enable_tcp,
            prefer_udp: config.prefer_udp,
        }
    }
}

/// Asynchronous notification from the engine to the owning connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The producer behind one of this connection's consumers was closed
    ProducerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// The engine closed one of this connection's transports
    TransportClosed { transport_id: TransportId },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// The media engine process
#[async_trait]
pub trait SfuEngine: Send + Sync {
    /// False once the underlying worker died
    fn is_alive(&self) -> bool;

    async fn create_router(&self, codecs: &[CodecConfig]) -> Result<Arc<dyn Router>>;
}

/// Per-room engine object negotiating codecs and owning transports
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        options: &TransportOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn Transport>>;

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One direction-specific ICE/DTLS channel between a peer and the engine
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters)
        -> Result<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One published track
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One subscribed track bound to a producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}
