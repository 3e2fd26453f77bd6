//! Per-peer transport handle

use crate::engine::{
    Consumer, DtlsParameters, Producer, RtpCapabilities, RtpParameters, Transport, TransportParams,
};
use crate::error::Result;
use crate::types::{Direction, MediaKind, PeerId, ProducerId, TransportId};
use std::sync::Arc;
use tracing::debug;

/// One engine transport owned by one peer connection
pub struct TransportHandle {
    owner: PeerId,
    direction: Direction,
    inner: Arc<dyn Transport>,
}

impl TransportHandle {
    pub fn new(owner: PeerId, direction: Direction, inner: Arc<dyn Transport>) -> Self {
        Self {
            owner,
            direction,
            inner,
        }
    }

    #[must_use]
    pub fn id(&self) -> &TransportId {
        self.inner.id()
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn params(&self) -> TransportParams {
        self.inner.params()
    }

    pub async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.inner.connect(dtls_parameters).await
    }

    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        self.inner.produce(kind, rtp_parameters).await
    }

    /// Consumers always start paused; the client resumes once it is ready
    pub async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn Consumer>> {
        self.inner.consume(producer_id, rtp_capabilities, true).await
    }

    pub async fn close(&self) {
        if !self.inner.is_closed() {
            debug!(
                peer_id = %self.owner,
                transport_id = %self.inner.id(),
                direction = %self.direction,
                "Closing transport"
            );
        }
        self.inner.close().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("owner", &self.owner)
            .field("direction", &self.direction)
            .field("id", self.inner.id())
            .finish()
    }
}
