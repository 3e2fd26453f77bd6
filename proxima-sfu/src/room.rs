//! SFU Room management

use crate::directory::ProducerDirectory;
use crate::engine::{Producer, Router};
use crate::protocol::ProducerInfo;
use crate::types::{MediaKind, PeerId, ProducerId, RoomId};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Metadata kept for each joined peer
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub joined_at: Instant,
}

struct RoomState {
    peers: IndexMap<PeerId, PeerPresence>,
    producers: ProducerDirectory,
    /// Set once the last peer left; a sealed room admits nobody
    sealed: bool,
}

/// Outcome of trying to admit a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyPresent,
    Full,
    Sealed,
}

/// One room: a router, its peers and their producers
///
/// The state lock is never held across an engine call.
pub struct SfuRoom {
    id: RoomId,
    router: Arc<dyn Router>,
    created_at: Instant,
    state: Mutex<RoomState>,
    router_closed: AtomicBool,
}

impl SfuRoom {
    pub fn new(id: RoomId, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            router,
            created_at: Instant::now(),
            state: Mutex::new(RoomState {
                peers: IndexMap::new(),
                producers: ProducerDirectory::new(),
                sealed: false,
            }),
            router_closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Insert a peer; no-op if already present
    pub fn add_peer(&self, peer_id: PeerId) -> bool {
        self.admit(peer_id, 0) == Admission::Admitted
    }

    /// Insert a peer honouring the seal and a peer limit (0 = unlimited)
    pub fn admit(&self, peer_id: PeerId, max_peers: usize) -> Admission {
        let mut state = self.state.lock();
        if state.sealed {
            return Admission::Sealed;
        }
        if state.peers.contains_key(&peer_id) {
            return Admission::AlreadyPresent;
        }
        if max_peers > 0 && state.peers.len() >= max_peers {
            return Admission::Full;
        }
        state.peers.insert(
            peer_id,
            PeerPresence {
                joined_at: Instant::now(),
            },
        );
        Admission::Admitted
    }

    /// Remove a peer and its producer entries; closing them is the caller's job.
    ///
    /// Returns true if the room became empty, in which case it is sealed and
    /// must be removed from the registry.
    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let mut state = self.state.lock();
        state.peers.shift_remove(peer_id);
        state.producers.take(peer_id);
        if state.peers.is_empty() {
            state.sealed = true;
        }
        state.sealed
    }

    pub fn add_producer(&self, peer_id: PeerId, producer: Arc<dyn Producer>) {
        self.state.lock().producers.add(peer_id, producer);
    }

    /// Remove and return one peer's producers, in production order
    pub fn take_producers(&self, peer_id: &PeerId) -> Vec<Arc<dyn Producer>> {
        self.state.lock().producers.take(peer_id)
    }

    /// Every producer except those owned by `excluding`
    #[must_use]
    pub fn list_other_producers(&self, excluding: &PeerId) -> Vec<ProducerInfo> {
        self.state.lock().producers.list_excluding(excluding)
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.state.lock().producers.ids()
    }

    #[must_use]
    pub fn producer_owner(&self, producer_id: &ProducerId) -> Option<PeerId> {
        self.state.lock().producers.owner_of(producer_id).cloned()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.state.lock().peers.keys().cloned().collect()
    }

    #[must_use]
    pub fn other_peers(&self, excluding: &PeerId) -> Vec<PeerId> {
        self.state
            .lock()
            .peers
            .keys()
            .filter(|peer_id| *peer_id != excluding)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.state.lock().peers.contains_key(peer_id)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().peers.is_empty()
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Close the router; only the first call reaches the engine
    pub(crate) async fn close_router(&self) -> bool {
        if self.router_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(room_id = %self.id, router_id = %self.router.id(), "Closing router");
        self.router.close().await;
        true
    }

    #[must_use]
    pub fn get_stats(&self) -> RoomStats {
        let state = self.state.lock();
        RoomStats {
            peer_count: state.peers.len(),
            producer_count: state.producers.count(),
            audio_producers: state.producers.count_kind(MediaKind::Audio),
            video_producers: state.producers.count_kind(MediaKind::Video),
            age_secs: self.created_at.elapsed().as_secs(),
            // Insertion order: the first entry joined earliest
            longest_presence_secs: state
                .peers
                .first()
                .map_or(0, |(_, presence)| presence.joined_at.elapsed().as_secs()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub peer_count: usize,
    pub producer_count: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub age_secs: u64,
    /// Seconds the longest-present peer has been in the room
    pub longest_presence_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodecConfig, TransportConfig};
    use crate::engine::{
        LocalEngine, RtpParameters, SfuEngine, Transport, TransportOptions,
    };
    use crate::types::Direction;
    use serde_json::json;

    async fn room_with_sender() -> (SfuRoom, Arc<dyn Transport>) {
        let engine = LocalEngine::default();
        let router = engine.create_router(&CodecConfig::defaults()).await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let options = TransportOptions::from_config(&TransportConfig::default(), Direction::Send);
        let transport = router.create_transport(&options, tx).await.unwrap();
        (SfuRoom::new(RoomId::from("r1"), router), transport)
    }

    async fn produce(transport: &Arc<dyn Transport>, kind: MediaKind) -> Arc<dyn Producer> {
        transport
            .produce(kind, RtpParameters(json!({ "encodings": [] })))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let (room, _) = room_with_sender().await;
        assert!(room.add_peer(PeerId::from("a")));
        assert!(!room.add_peer(PeerId::from("a")));
        assert_eq!(room.peer_count(), 1);
        assert!(!room.is_empty());

        let stats = room.get_stats();
        assert!(stats.longest_presence_secs <= stats.age_secs);
    }

    #[tokio::test]
    async fn test_presence_tracks_earliest_remaining_peer() {
        let (room, _) = room_with_sender().await;
        assert_eq!(room.get_stats().longest_presence_secs, 0);

        room.add_peer(PeerId::from("a"));
        {
            let mut state = room.state.lock();
            let presence = state.peers.get_mut(&PeerId::from("a")).unwrap();
            presence.joined_at -= std::time::Duration::from_secs(30);
        }
        room.add_peer(PeerId::from("b"));
        assert!(room.get_stats().longest_presence_secs >= 30);

        room.remove_peer(&PeerId::from("a"));
        assert!(room.get_stats().longest_presence_secs < 30);
    }

    #[tokio::test]
    async fn test_list_other_producers_is_ordered_and_excludes_peer() {
        let (room, transport) = room_with_sender().await;
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        room.add_peer(a.clone());
        room.add_peer(b.clone());

        let a_audio = produce(&transport, MediaKind::Audio).await;
        let b_video = produce(&transport, MediaKind::Video).await;
        let a_video = produce(&transport, MediaKind::Video).await;
        room.add_producer(a.clone(), Arc::clone(&a_audio));
        room.add_producer(b.clone(), Arc::clone(&b_video));
        room.add_producer(a.clone(), Arc::clone(&a_video));

        let for_c = room.list_other_producers(&PeerId::from("c"));
        let ids: Vec<_> = for_c.iter().map(|p| p.producer_id.clone()).collect();
        assert_eq!(
            ids,
            vec![a_audio.id().clone(), a_video.id().clone(), b_video.id().clone()]
        );

        let for_a = room.list_other_producers(&a);
        assert_eq!(
            for_a,
            vec![ProducerInfo {
                producer_id: b_video.id().clone(),
                peer_id: b.clone(),
            }]
        );
        assert_eq!(room.producer_ids().len(), 3);
        assert_eq!(room.producer_owner(b_video.id()), Some(b));
    }

    #[tokio::test]
    async fn test_remove_peer_drops_producers_and_seals_empty_room() {
        let (room, transport) = room_with_sender().await;
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        room.add_peer(a.clone());
        room.add_peer(b.clone());
        room.add_producer(a.clone(), produce(&transport, MediaKind::Audio).await);

        assert!(!room.remove_peer(&a));
        assert!(room.producer_ids().is_empty());
        assert_eq!(room.other_peers(&PeerId::from("z")), vec![b.clone()]);

        assert!(room.remove_peer(&b));
        assert!(room.is_empty());
        assert!(room.is_sealed());
        assert_eq!(room.admit(PeerId::from("late"), 0), Admission::Sealed);
    }

    #[tokio::test]
    async fn test_admit_honours_peer_limit() {
        let (room, _) = room_with_sender().await;
        assert_eq!(room.admit(PeerId::from("a"), 2), Admission::Admitted);
        assert_eq!(room.admit(PeerId::from("a"), 2), Admission::AlreadyPresent);
        assert_eq!(room.admit(PeerId::from("b"), 2), Admission::Admitted);
        assert_eq!(room.admit(PeerId::from("c"), 2), Admission::Full);
    }

    #[tokio::test]
    async fn test_take_producers_preserves_order() {
        let (room, transport) = room_with_sender().await;
        let a = PeerId::from("a");
        room.add_peer(a.clone());
        let first = produce(&transport, MediaKind::Audio).await;
        let second = produce(&transport, MediaKind::Video).await;
        room.add_producer(a.clone(), Arc::clone(&first));
        room.add_producer(a.clone(), Arc::clone(&second));

        let stats = room.get_stats();
        assert_eq!(stats.producer_count, 2);
        assert_eq!(stats.audio_producers, 1);
        assert_eq!(stats.video_producers, 1);

        let taken = room.take_producers(&a);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].id(), first.id());
        assert_eq!(taken[1].id(), second.id());
        assert!(room.take_producers(&a).is_empty());
    }
}
