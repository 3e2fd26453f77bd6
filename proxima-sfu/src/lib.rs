//! Proxima SFU signaling coordinator
//!
//! Sits between WebRTC clients and an SFU media engine. Clients speak a JSON
//! signaling protocol; the coordinator keeps the room, peer, transport,
//! producer and consumer bookkeeping and drives the engine on their behalf.
//! No media passes through this crate.
//!
//! ## Architecture
//!
//! - **`RoomRegistry`**: Process-wide map from room id to `SfuRoom`
//! - **`SfuRoom`**: One router, its peers and their producers
//! - **`SfuPeer`**: Per-connection state (transports, consumers, outbound queue)
//! - **`PeerHub`**: Routes pushed events to connected peers
//! - **`SignalingService`**: The protocol operations, including leave cleanup
//! - **`SessionBroker`**: Pairs two peers and moves them into a shared room
//! - **`SignalingDispatcher`**: Decodes frames and produces replies, one per connection
//! - **`engine`**: The media engine boundary, with an in-process `LocalEngine`
//!   and, behind the `mediasoup` feature, a worker-backed `MediasoupEngine`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use proxima_sfu::{
//!     LocalEngine, PeerHub, RoomRegistry, SessionBroker, SfuConfig, SignalingDispatcher,
//!     SignalingService,
//! };
//!
//! let config = Arc::new(SfuConfig::default());
//! let engine = Arc::new(LocalEngine::new(config.transport.clone()));
//! let registry = Arc::new(RoomRegistry::new(engine, config));
//! let service = Arc::new(SignalingService::new(registry, Arc::new(PeerHub::new())));
//! let broker = Arc::new(SessionBroker::new(service.clone()));
//!
//! let (dispatcher, outbound, engine_events) = SignalingDispatcher::connect(service, broker);
//! dispatcher.handle_text(r#"{"type":"joinRoom","roomId":"lobby"}"#).await;
//! ```

mod config;
mod directory;
mod dispatcher;
pub mod engine;
mod error;
mod hub;
mod peer;
pub mod protocol;
mod registry;
mod room;
mod service;
mod session;
mod transport;
mod types;

pub use config::{CodecConfig, SfuConfig, TransportConfig};
pub use directory::{ConsumerDirectory, ProducerDirectory};
pub use dispatcher::SignalingDispatcher;
pub use engine::{EngineEvent, LocalEngine, SfuEngine};
#[cfg(feature = "mediasoup")]
pub use engine::MediasoupEngine;
pub use error::{Error, Result};
pub use hub::PeerHub;
pub use peer::{OutboundReceiver, OutboundSender, PeerState, PeerStats, SfuPeer};
pub use protocol::{ClientMessage, ClientRequest, ServerFrame, ServerMessage};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{Admission, RoomStats, SfuRoom};
pub use service::SignalingService;
pub use session::{Session, SessionBroker};
pub use transport::TransportHandle;
pub use types::{
    ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, RouterId, SessionId, TransportId,
};
