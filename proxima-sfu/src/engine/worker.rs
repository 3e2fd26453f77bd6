//! mediasoup worker engine
//!
//! Drives one mediasoup worker subprocess. Engine objects close when their
//! last handle drops, so every handle here sits in an `Option` that `close()`
//! takes. Opaque signaling blobs cross into mediasoup's typed parameters
//! through serde.

use super::{
    Consumer, DtlsParameters, EngineEvent, EngineEventSender, Producer, Router, RtpCapabilities,
    RtpParameters, SfuEngine, Transport, TransportOptions, TransportParams,
};
use crate::config::{CodecConfig, TransportConfig};
use crate::error::{Error, Result};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use mediasoup::prelude as ms;
use mediasoup::prelude::{Transport as _, TransportGeneric as _};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

fn from_json<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::InvalidPayload(format!("invalid {what}: {e}")))
}

fn to_json(value: impl serde::Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

const fn media_kind(kind: MediaKind) -> ms::MediaKind {
    match kind {
        MediaKind::Audio => ms::MediaKind::Audio,
        MediaKind::Video => ms::MediaKind::Video,
    }
}

fn codec_capability(codec: &CodecConfig) -> Result<ms::RtpCodecCapability> {
    let mut value = json!({
        "kind": codec.kind,
        "mimeType": codec.mime_type,
        "clockRate": codec.clock_rate,
        "parameters": codec.parameters,
        "rtcpFeedback": [],
    });
    if let Some(channels) = codec.channels {
        value["channels"] = json!(channels);
    }
    from_json("media codec", value)
}

/// [`SfuEngine`] backed by a mediasoup worker
pub struct MediasoupEngine {
    worker: ms::Worker,
    alive: Arc<AtomicBool>,
    transport_config: Arc<TransportConfig>,
    _manager: ms::WorkerManager,
}

impl MediasoupEngine {
    /// Spawn the worker subprocess
    pub async fn start(transport_config: TransportConfig) -> Result<Self> {
        let manager = ms::WorkerManager::new();
        let worker = manager
            .create_worker(ms::WorkerSettings::default())
            .await
            .map_err(|e| Error::engine(format!("failed to spawn mediasoup worker: {e}")))?;

        let alive = Arc::new(AtomicBool::new(true));
        let dead_flag = Arc::clone(&alive);
        let worker_id = worker.id();
        worker
            .on_dead(move |reason| {
                dead_flag.store(false, Ordering::Release);
                error!(worker_id = %worker_id, reason = ?reason, "mediasoup worker died");
            })
            .detach();

        info!(
            worker_id = %worker.id(),
            rtc_min_port = transport_config.rtc_min_port,
            rtc_max_port = transport_config.rtc_max_port,
            "mediasoup worker started"
        );
        Ok(Self {
            worker,
            alive,
            transport_config: Arc::new(transport_config),
            _manager: manager,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }
}

#[async_trait]
impl SfuEngine for MediasoupEngine {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.worker.closed()
    }

    async fn create_router(&self, codecs: &[CodecConfig]) -> Result<Arc<dyn Router>> {
        self.ensure_alive()?;
        let media_codecs = codecs
            .iter()
            .map(codec_capability)
            .collect::<Result<Vec<_>>>()?;
        let router = self
            .worker
            .create_router(ms::RouterOptions::new(media_codecs))
            .await
            .map_err(Error::engine)?;

        let id = RouterId::new(router.id().to_string());
        debug!(router_id = %id, codecs = codecs.len(), "Router created");
        Ok(Arc::new(MediasoupRouter {
            id,
            rtp_capabilities: RtpCapabilities(to_json(router.rtp_capabilities())),
            inner: Mutex::new(Some(router)),
            alive: Arc::clone(&self.alive),
            transport_config: Arc::clone(&self.transport_config),
        }))
    }
}

struct MediasoupRouter {
    id: RouterId,
    rtp_capabilities: RtpCapabilities,
    inner: Mutex<Option<ms::Router>>,
    alive: Arc<AtomicBool>,
    transport_config: Arc<TransportConfig>,
}

impl MediasoupRouter {
    fn router(&self) -> Result<ms::Router> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::NotReady);
        }
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| Error::engine("router closed"))
    }

    /// One listen info per enabled protocol, preferred protocol first
    fn listen_infos(&self, options: &TransportOptions) -> Result<ms::WebRtcTransportListenInfos> {
        let ip: IpAddr = options
            .listen_ip
            .parse()
            .map_err(|e| Error::engine(format!("invalid listen ip {}: {e}", options.listen_ip)))?;
        let listen_info = |protocol| ms::ListenInfo {
            protocol,
            ip,
            announced_address: options.announced_ip.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: Some(self.transport_config.rtc_min_port..=self.transport_config.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };

        let mut protocols = Vec::with_capacity(2);
        if options.enable_udp {
            protocols.push(ms::Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(ms::Protocol::Tcp);
        }
        if !options.prefer_udp {
            protocols.reverse();
        }

        let mut protocols = protocols.into_iter();
        let first = protocols
            .next()
            .ok_or_else(|| Error::engine("transport needs UDP or TCP enabled"))?;
        Ok(protocols.fold(
            ms::WebRtcTransportListenInfos::new(listen_info(first)),
            |infos, protocol| infos.insert(listen_info(protocol)),
        ))
    }
}

#[async_trait]
impl Router for MediasoupRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.rtp_capabilities.clone()
    }

    async fn create_transport(
        &self,
        options: &TransportOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn Transport>> {
        let router = self.router()?;
        let transport = router
            .create_webrtc_transport(ms::WebRtcTransportOptions::new(self.listen_infos(options)?))
            .await
            .map_err(Error::engine)?;

        let id = TransportId::new(transport.id().to_string());
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: to_json(transport.ice_parameters()),
            ice_candidates: transport.ice_candidates().iter().map(to_json).collect(),
            dtls_parameters: to_json(transport.dtls_parameters()),
        };

        let closed_id = id.clone();
        let router_closed = events.clone();
        transport
            .on_router_close(Box::new(move || {
                let _ = router_closed.send(EngineEvent::TransportClosed {
                    transport_id: closed_id,
                });
            }))
            .detach();

        debug!(
            router_id = %self.id,
            transport_id = %id,
            direction = %options.direction,
            "Transport created"
        );
        Ok(Arc::new(MediasoupTransport {
            id,
            params,
            inner: Mutex::new(Some(transport)),
            events,
        }))
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = from_json::<ms::ProducerId>("producer id", json!(producer_id.as_str()))
        else {
            return false;
        };
        let Ok(caps) = from_json::<ms::RtpCapabilities>("rtpCapabilities", rtp_capabilities.0.clone())
        else {
            return false;
        };
        router.can_consume(&producer_id, &caps)
    }

    async fn close(&self) {
        if self.inner.lock().take().is_some() {
            debug!(router_id = %self.id, "Router closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

struct MediasoupTransport {
    id: TransportId,
    params: TransportParams,
    inner: Mutex<Option<ms::WebRtcTransport>>,
    /// Owning connection's event channel, shared with this transport's consumers
    events: EngineEventSender,
}

impl MediasoupTransport {
    fn transport(&self) -> Result<ms::WebRtcTransport> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| Error::engine(format!("transport {} closed", self.id)))
    }
}

#[async_trait]
impl Transport for MediasoupTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        let transport = self.transport()?;
        let dtls_parameters = from_json("dtlsParameters", dtls_parameters.0)?;
        transport
            .connect(ms::WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(Error::engine)?;
        debug!(transport_id = %self.id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        let transport = self.transport()?;
        let rtp_parameters = from_json("rtpParameters", rtp_parameters.0)?;
        let producer = transport
            .produce(ms::ProducerOptions::new(media_kind(kind), rtp_parameters))
            .await
            .map_err(Error::engine)?;

        let id = ProducerId::new(producer.id().to_string());
        debug!(producer_id = %id, kind = %kind, "Producer created");
        Ok(Arc::new(MediasoupProducer {
            id,
            kind,
            inner: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        let transport = self.transport()?;
        let ms_producer_id = from_json("producer id", json!(producer_id.as_str()))?;
        let caps = from_json("rtpCapabilities", rtp_capabilities.0.clone())?;

        let mut options = ms::ConsumerOptions::new(ms_producer_id, caps);
        options.paused = paused;
        let consumer = transport.consume(options).await.map_err(Error::engine)?;

        let id = ConsumerId::new(consumer.id().to_string());
        let kind = match consumer.kind() {
            ms::MediaKind::Audio => MediaKind::Audio,
            ms::MediaKind::Video => MediaKind::Video,
        };
        let rtp_parameters = RtpParameters(to_json(consumer.rtp_parameters()));

        let events = self.events.clone();
        let (closed_consumer, closed_producer) = (id.clone(), producer_id.clone());
        consumer
            .on_producer_close(move || {
                let _ = events.send(EngineEvent::ProducerClosed {
                    consumer_id: closed_consumer,
                    producer_id: closed_producer,
                });
            })
            .detach();
        debug!(
            consumer_id = %id,
            producer_id = %producer_id,
            paused,
            "Consumer created"
        );
        Ok(Arc::new(MediasoupConsumer {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            inner: Mutex::new(Some(consumer)),
        }))
    }

    async fn close(&self) {
        if self.inner.lock().take().is_some() {
            debug!(transport_id = %self.id, "Transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    inner: Mutex<Option<ms::Producer>>,
}

#[async_trait]
impl Producer for MediasoupProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        if self.inner.lock().take().is_some() {
            debug!(producer_id = %self.id, "Producer closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    inner: Mutex<Option<ms::Consumer>>,
}

#[async_trait]
impl Consumer for MediasoupConsumer {
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
        self.inner.lock().as_ref().is_some_and(ms::Consumer::paused)
    }

    async fn resume(&self) -> Result<()> {
        let consumer = self
            .inner
            .lock()
            .clone()
            .ok_or_else(|| Error::engine(format!("consumer {} closed", self.id)))?;
        consumer.resume().await.map_err(Error::engine)
    }

    async fn close(&self) {
        self.inner.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}
