//! In-process engine
//!
//! Keeps the full object graph (routers, transports, producers, consumers)
//! with the same ownership and close-cascade rules as a real SFU worker, but
//! forwards no media. Used by the test suite and by development deployments
//! that run signaling without a media worker.

use super::{
    Consumer, DtlsParameters, EngineEvent, EngineEventSender, Producer, Router, RtpCapabilities,
    RtpParameters, SfuEngine, Transport, TransportOptions, TransportParams,
};
use crate::config::{CodecConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// First dynamic RTP payload type assigned to router codecs
const FIRST_PAYLOAD_TYPE: u32 = 100;
const LAST_PAYLOAD_TYPE: u32 = 127;

/// Dynamic payload type for the codec at `index`, saturating at the top of the range
fn payload_type(index: usize) -> u32 {
    u32::try_from(index)
        .ok()
        .and_then(|index| FIRST_PAYLOAD_TYPE.checked_add(index))
        .map_or(LAST_PAYLOAD_TYPE, |pt| pt.min(LAST_PAYLOAD_TYPE))
}

struct Shared {
    transport_config: TransportConfig,
    alive: AtomicBool,
    next_port: AtomicU32,
    next_ssrc: AtomicU32,
    routers_closed: AtomicUsize,
}

impl Shared {
    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    fn allocate_port(&self) -> u32 {
        let min = u32::from(self.transport_config.rtc_min_port);
        let span = u32::from(self.transport_config.rtc_max_port).saturating_sub(min) + 1;
        min + self.next_port.fetch_add(1, Ordering::Relaxed) % span
    }
}

/// In-process [`SfuEngine`] implementation
pub struct LocalEngine {
    shared: Arc<Shared>,
    fail_next_router: AtomicBool,
    routers_created: AtomicUsize,
}

impl LocalEngine {
    #[must_use]
    pub fn new(transport_config: TransportConfig) -> Self {
        info!(
            listen_ip = %transport_config.listen_ip,
            rtc_min_port = transport_config.rtc_min_port,
            rtc_max_port = transport_config.rtc_max_port,
            "In-process media engine started"
        );
        Self {
            shared: Arc::new(Shared {
                transport_config,
                alive: AtomicBool::new(true),
                next_port: AtomicU32::new(0),
                next_ssrc: AtomicU32::new(1000),
                routers_closed: AtomicUsize::new(0),
            }),
            fail_next_router: AtomicBool::new(false),
            routers_created: AtomicUsize::new(0),
        }
    }

    /// Simulate the worker process dying; every later call fails with `NotReady`
    pub fn kill(&self) {
        warn!("In-process media engine marked dead");
        self.shared.alive.store(false, Ordering::Release);
    }

    /// Make the next `create_router` call fail
    pub fn fail_next_router(&self) {
        self.fail_next_router.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn routers_closed(&self) -> usize {
        self.shared.routers_closed.load(Ordering::Acquire)
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl SfuEngine for LocalEngine {
    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    async fn create_router(&self, codecs: &[CodecConfig]) -> Result<Arc<dyn Router>> {
        self.shared.ensure_alive()?;
        // Router creation is a worker round-trip; let other tasks run meanwhile
        tokio::task::yield_now().await;

        if self.fail_next_router.swap(false, Ordering::AcqRel) {
            return Err(Error::engine("router creation rejected by worker"));
        }
        let router: Arc<dyn Router> = self.new_router(codecs)?;
        Ok(router)
    }
}

impl LocalEngine {
    fn new_router(&self, codecs: &[CodecConfig]) -> Result<Arc<LocalRouter>> {
        if codecs.is_empty() {
            return Err(Error::engine("router needs at least one media codec"));
        }

        let router = Arc::new_cyclic(|weak_self| LocalRouter {
            id: RouterId::new(uuid::Uuid::new_v4().to_string()),
            shared: Arc::clone(&self.shared),
            codecs: codecs.to_vec(),
            closed: AtomicBool::new(false),
            producers: DashMap::new(),
            transports: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        });
        self.routers_created.fetch_add(1, Ordering::AcqRel);

        debug!(router_id = %router.id, codecs = codecs.len(), "Router created");
        Ok(router)
    }
}

struct LocalRouter {
    id: RouterId,
    shared: Arc<Shared>,
    codecs: Vec<CodecConfig>,
    closed: AtomicBool,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
    weak_self: Weak<LocalRouter>,
}

impl LocalRouter {
    fn codec_json(&self, index: usize, codec: &CodecConfig) -> serde_json::Value {
        let mut value = json!({
            "kind": codec.kind,
            "mimeType": codec.mime_type,
            "clockRate": codec.clock_rate,
            "preferredPayloadType": payload_type(index),
            "parameters": codec.parameters,
        });
        if let Some(channels) = codec.channels {
            value["channels"] = json!(channels);
        }
        value
    }

    fn codecs_of_kind(&self, kind: MediaKind) -> Vec<serde_json::Value> {
        self.codecs
            .iter()
            .enumerate()
            .filter(|(_, codec)| codec.kind == kind)
            .map(|(index, codec)| self.codec_json(index, codec))
            .collect()
    }

    fn offers_kind(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|codec| codec.kind == kind)
    }
}

/// True if the capability set lists a codec of `kind` the router also offers
fn capabilities_match(router: &LocalRouter, kind: MediaKind, caps: &RtpCapabilities) -> bool {
    let Some(codecs) = caps.0.get("codecs").and_then(|c| c.as_array()) else {
        return false;
    };
    codecs.iter().any(|codec| {
        let same_kind = codec.get("kind").and_then(|k| k.as_str()) == Some(kind.as_str());
        let mime = codec.get("mimeType").and_then(|m| m.as_str());
        same_kind
            && mime.is_some_and(|mime| {
                router
                    .codecs
                    .iter()
                    .any(|offered| offered.kind == kind && offered.mime_type.eq_ignore_ascii_case(mime))
            })
    })
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<_> = self
            .codecs
            .iter()
            .enumerate()
            .map(|(index, codec)| self.codec_json(index, codec))
            .collect();
        RtpCapabilities(json!({ "codecs": codecs, "headerExtensions": [] }))
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn Transport>> {
        self.shared.ensure_alive()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::engine("router closed"));
        }

        let id = TransportId::new(uuid::Uuid::new_v4().to_string());
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = self.shared.allocate_port();

        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "ip": ip,
                "port": port,
                "protocol": "udp",
                "priority": if options.prefer_udp { 1_076_558_079u32 } else { 1_076_302_079 },
                "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "ip": ip,
                "port": port,
                "protocol": "tcp",
                "priority": if options.prefer_udp { 1_076_302_079u32 } else { 1_076_558_079 },
                "tcpType": "passive",
                "type": "host",
            }));
        }

        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true,
            }),
            ice_candidates: candidates,
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": uuid::Uuid::new_v4().simple().to_string(),
                }],
            }),
        };

        let transport = Arc::new_cyclic(|weak_self| LocalTransport {
            id,
            direction: options.direction,
            router: self.weak_self.clone(),
            params,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        });
        self.transports.lock().push(Arc::clone(&transport));

        debug!(
            router_id = %self.id,
            transport_id = %transport.id,
            direction = %options.direction,
            "Transport created"
        );
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producers.get(producer_id) else {
            return false;
        };
        !producer.is_closed() && capabilities_match(self, producer.kind, rtp_capabilities)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<_> = std::mem::take(&mut *self.transports.lock());
        for transport in transports {
            if transport.close_cascade() {
                let _ = transport.events.send(EngineEvent::TransportClosed {
                    transport_id: transport.id.clone(),
                });
            }
        }
        self.producers.clear();
        self.shared.routers_closed.fetch_add(1, Ordering::AcqRel);
        debug!(router_id = %self.id, "Router closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct LocalTransport {
    id: TransportId,
    direction: Direction,
    router: Weak<LocalRouter>,
    params: TransportParams,
    connected: AtomicBool,
    closed: AtomicBool,
    events: EngineEventSender,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    weak_self: Weak<LocalTransport>,
}

impl LocalTransport {
    fn router(&self) -> Result<Arc<LocalRouter>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::engine(format!("transport {} closed", self.id)));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| Error::engine("router gone"))?;
        router.shared.ensure_alive()?;
        Ok(router)
    }

    /// Close this transport and everything it carries. Returns false if it
    /// was already closed.
    fn close_cascade(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let producers: Vec<_> = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close_cascade();
        }
        let consumers: Vec<_> = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.closed.store(true, Ordering::Release);
            consumer.unlink();
        }
        true
    }

    fn forget_producer(&self, producer_id: &ProducerId) {
        self.producers.lock().retain(|p| p.id != *producer_id);
    }

    fn forget_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.lock().retain(|c| c.id != *consumer_id);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.router()?;
        let has_fingerprints = dtls_parameters
            .0
            .get("fingerprints")
            .and_then(|f| f.as_array())
            .is_some_and(|f| !f.is_empty());
        if !has_fingerprints {
            return Err(Error::engine("dtlsParameters carry no fingerprints"));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(Error::engine("connect() already called"));
        }
        debug!(transport_id = %self.id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        let router = self.router()?;
        if self.direction != Direction::Send {
            return Err(Error::engine("cannot produce on a receive transport"));
        }
        if !rtp_parameters.0.is_object() {
            return Err(Error::engine("rtpParameters must be an object"));
        }
        if !router.offers_kind(kind) {
            return Err(Error::engine(format!("router offers no {kind} codec")));
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(uuid::Uuid::new_v4().to_string()),
            kind,
            router: Arc::downgrade(&router),
            transport: self.weak_self.clone(),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        });
        router
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));

        debug!(producer_id = %producer.id, kind = %kind, "Producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        let router = self.router()?;
        if self.direction != Direction::Recv {
            return Err(Error::engine("cannot consume on a send transport"));
        }
        if !router.can_consume(producer_id, rtp_capabilities) {
            return Err(Error::CannotConsume(producer_id.to_string()));
        }
        let producer = router
            .producers
            .get(producer_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::NotFound(format!("producer {producer_id}")))?;

        let ssrc = router.shared.next_ssrc.fetch_add(1, Ordering::Relaxed);
        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(uuid::Uuid::new_v4().to_string()),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters(json!({
                "codecs": router.codecs_of_kind(producer.kind),
                "encodings": [{ "ssrc": ssrc }],
                "mid": ssrc.to_string(),
            })),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            events: self.events.clone(),
            producer: Arc::downgrade(&producer),
            transport: self.weak_self.clone(),
        });
        producer.consumers.lock().push(Arc::clone(&consumer));
        self.consumers.lock().push(Arc::clone(&consumer));

        debug!(
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            paused,
            "Consumer created"
        );
        Ok(consumer)
    }

    async fn close(&self) {
        if self.close_cascade() {
            if let Some(router) = self.router.upgrade() {
                router.transports.lock().retain(|t| t.id != self.id);
            }
            debug!(transport_id = %self.id, "Transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    router: Weak<LocalRouter>,
    transport: Weak<LocalTransport>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalProducer {
    fn close_cascade(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.remove(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_producer(&self.id);
        }
        let consumers: Vec<_> = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            if !consumer.closed.swap(true, Ordering::AcqRel) {
                let _ = consumer.events.send(EngineEvent::ProducerClosed {
                    consumer_id: consumer.id.clone(),
                    producer_id: self.id.clone(),
                });
            }
            consumer.unlink();
        }
        true
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        if self.close_cascade() {
            debug!(producer_id = %self.id, "Producer closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    events: EngineEventSender,
    producer: Weak<LocalProducer>,
    transport: Weak<LocalTransport>,
}

impl LocalConsumer {
    /// Drop the producer's and the transport's references to this consumer
    fn unlink(&self) {
        if let Some(producer) = self.producer.upgrade() {
            producer.consumers.lock().retain(|c| c.id != self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_consumer(&self.id);
        }
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::engine(format!("consumer {} closed", self.id)));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.unlink();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
