//! Producer and consumer directories
//!
//! Both keep insertion order so enumeration is deterministic.

use crate::engine::{Consumer, Producer};
use crate::protocol::ProducerInfo;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId};
use indexmap::IndexMap;
use std::sync::Arc;

/// Per-room mapping from peer to the producers it published, in production order
#[derive(Default)]
pub struct ProducerDirectory {
    by_peer: IndexMap<PeerId, Vec<Arc<dyn Producer>>>,
}

impl ProducerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer_id: PeerId, producer: Arc<dyn Producer>) {
        self.by_peer.entry(peer_id).or_default().push(producer);
    }

    /// Remove and return every producer of one peer
    pub fn take(&mut self, peer_id: &PeerId) -> Vec<Arc<dyn Producer>> {
        self.by_peer.shift_remove(peer_id).unwrap_or_default()
    }

    /// Producers of every peer except `excluding`
    #[must_use]
    pub fn list_excluding(&self, excluding: &PeerId) -> Vec<ProducerInfo> {
        self.by_peer
            .iter()
            .filter(|(peer_id, _)| *peer_id != excluding)
            .flat_map(|(peer_id, producers)| {
                producers.iter().map(move |producer| ProducerInfo {
                    producer_id: producer.id().clone(),
                    peer_id: peer_id.clone(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ProducerId> {
        self.by_peer
            .values()
            .flatten()
            .map(|producer| producer.id().clone())
            .collect()
    }

    #[must_use]
    pub fn owner_of(&self, producer_id: &ProducerId) -> Option<&PeerId> {
        self.by_peer.iter().find_map(|(peer_id, producers)| {
            producers
                .iter()
                .any(|producer| producer.id() == producer_id)
                .then_some(peer_id)
        })
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.by_peer.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn count_kind(&self, kind: MediaKind) -> usize {
        self.by_peer
            .values()
            .flatten()
            .filter(|producer| producer.kind() == kind)
            .count()
    }
}

/// Per-connection mapping from consumer id to consumer
#[derive(Default)]
pub struct ConsumerDirectory {
    by_id: IndexMap<ConsumerId, Arc<dyn Consumer>>,
}

impl ConsumerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, consumer: Arc<dyn Consumer>) {
        self.by_id.insert(consumer.id().clone(), consumer);
    }

    #[must_use]
    pub fn get(&self, consumer_id: &ConsumerId) -> Option<&Arc<dyn Consumer>> {
        self.by_id.get(consumer_id)
    }

    pub fn remove(&mut self, consumer_id: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.by_id.shift_remove(consumer_id)
    }

    /// Remove and return every consumer, in creation order
    pub fn drain(&mut self) -> Vec<Arc<dyn Consumer>> {
        self.by_id.drain(..).map(|(_, consumer)| consumer).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
