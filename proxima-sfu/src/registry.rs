//! Room Registry - process-wide mapping from room id to room
//!
//! This module provides:
//! - Lazy room creation with exactly one router per room id
//! - Resource limit enforcement
//! - Removal of rooms the moment their last peer leaves
//! - Global statistics collection

use crate::config::SfuConfig;
use crate::engine::SfuEngine;
use crate::error::{Error, Result};
use crate::room::{Admission, SfuRoom};
use crate::types::{PeerId, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of active rooms
    pub active_rooms: usize,
    /// Total number of peers across all rooms
    pub total_peers: usize,
    /// Total number of producers across all rooms
    pub total_producers: usize,
    pub total_audio_producers: usize,
    pub total_video_producers: usize,
}

/// Room Registry
///
/// Each slot is a `OnceCell` so concurrent joiners of a new room wait on the
/// same router creation instead of racing to create two. A slot whose
/// creation failed is removed again, so no half-registered room survives.
pub struct RoomRegistry {
    engine: Arc<dyn SfuEngine>,
    config: Arc<SfuConfig>,
    rooms: DashMap<RoomId, Arc<OnceCell<Arc<SfuRoom>>>>,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn SfuEngine>, config: Arc<SfuConfig>) -> Self {
        info!(
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            "Room registry initialized"
        );
        Self {
            engine,
            config,
            rooms: DashMap::new(),
        }
    }

    /// Get or create a room
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        if let Some(room) = self.get(room_id) {
            debug!(room_id = %room_id, "Room already exists");
            return Ok(room);
        }

        // Counted before taking the entry guard; len() locks every shard
        let current_rooms = self.rooms.len();
        let slot = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                if self.config.max_rooms > 0 && current_rooms >= self.config.max_rooms {
                    warn!(
                        current_rooms,
                        max_rooms = self.config.max_rooms,
                        "Room limit reached"
                    );
                    return Err(Error::LimitExceeded(
                        "maximum number of rooms reached".to_string(),
                    ));
                }
                Arc::clone(entry.insert(Arc::new(OnceCell::new())).value())
            }
        };

        let created = slot
            .get_or_try_init(|| async {
                let router = self.engine.create_router(&self.config.media_codecs).await?;
                info!(
                    room_id = %room_id,
                    router_id = %router.id(),
                    "Created new room"
                );
                Ok::<_, Error>(Arc::new(SfuRoom::new(room_id.clone(), router)))
            })
            .await;

        match created {
            Ok(room) => Ok(Arc::clone(room)),
            Err(err) => {
                self.rooms.remove_if(room_id, |_, existing| {
                    Arc::ptr_eq(existing, &slot) && !existing.initialized()
                });
                warn!(room_id = %room_id, error = %err, "Router creation failed");
                Err(err)
            }
        }
    }

    /// Look up an existing room
    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<SfuRoom>> {
        self.rooms
            .get(room_id)
            .and_then(|slot| slot.get().map(Arc::clone))
    }

    /// Get or create `room_id` and add `peer_id` to it
    ///
    /// A room sealed by its last leaver between lookup and admission is
    /// evicted and a fresh one is created.
    pub async fn join(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<Arc<SfuRoom>> {
        loop {
            let room = self.get_or_create(room_id).await?;
            match room.admit(peer_id.clone(), self.config.max_peers_per_room) {
                Admission::Admitted | Admission::AlreadyPresent => return Ok(room),
                Admission::Full => {
                    warn!(
                        room_id = %room_id,
                        max_peers = self.config.max_peers_per_room,
                        "Peer limit reached for room"
                    );
                    return Err(Error::LimitExceeded(format!(
                        "maximum number of peers reached for room {room_id}"
                    )));
                }
                Admission::Sealed => {
                    debug!(room_id = %room_id, "Joined a sealed room, retrying");
                    self.evict(&room);
                }
            }
        }
    }

    /// Check that `movers` could all join `room_id` once they left the room
    /// each one currently occupies.
    pub fn check_capacity(
        &self,
        room_id: &RoomId,
        movers: &[(PeerId, Option<RoomId>)],
    ) -> Result<()> {
        let is_mover = |peer_id: &PeerId| movers.iter().any(|(id, _)| id == peer_id);
        let max_peers = self.config.max_peers_per_room;

        let staying = self.get(room_id).map(|room| {
            room.peer_ids()
                .iter()
                .filter(|peer_id| !is_mover(*peer_id))
                .count()
        });
        if max_peers > 0 && staying.unwrap_or(0) + movers.len() > max_peers {
            return Err(Error::LimitExceeded(format!(
                "maximum number of peers reached for room {room_id}"
            )));
        }
        if staying.is_some() || self.config.max_rooms == 0 {
            return Ok(());
        }

        // Rooms left behind by the movers and nobody else are released first
        let mut freed: Vec<&RoomId> = Vec::new();
        for current in movers.iter().filter_map(|(_, room)| room.as_ref()) {
            let vacated = self
                .get(current)
                .is_some_and(|room| room.peer_ids().iter().all(|peer_id| is_mover(peer_id)));
            if vacated && !freed.contains(&current) {
                freed.push(current);
            }
        }
        if self.room_count().saturating_sub(freed.len()) >= self.config.max_rooms {
            return Err(Error::LimitExceeded(
                "maximum number of rooms reached".to_string(),
            ));
        }
        Ok(())
    }

    /// Remove an empty room and close its router
    pub async fn remove(&self, room_id: &RoomId) -> Result<()> {
        let room = self
            .get(room_id)
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;
        if !room.is_empty() {
            return Err(Error::Precondition(format!(
                "room {room_id} still has {} peer(s)",
                room.peer_count()
            )));
        }
        self.release(&room).await;
        Ok(())
    }

    /// Drop a room that became empty: unregister it and close its router
    pub(crate) async fn release(&self, room: &Arc<SfuRoom>) {
        self.evict(room);
        if room.close_router().await {
            info!(
                room_id = %room.id(),
                remaining_rooms = self.rooms.len(),
                "Room deleted as it is now empty"
            );
        }
    }

    /// Unregister `room` if the slot still holds this exact instance
    fn evict(&self, room: &Arc<SfuRoom>) {
        self.rooms.remove_if(room.id(), |_, slot| {
            slot.get().is_some_and(|existing| Arc::ptr_eq(existing, room))
        });
    }

    /// Close every room (graceful shutdown)
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<SfuRoom>> = self
            .rooms
            .iter()
            .filter_map(|slot| slot.value().get().map(Arc::clone))
            .collect();
        self.rooms.clear();

        let count = rooms.len();
        for room in rooms {
            room.close_router().await;
        }
        info!(closed_rooms = count, "Room registry shut down");
    }

    /// Get list of all active room IDs
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|slot| slot.value().initialized())
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Get number of active rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }

    /// Aggregate statistics over all rooms
    #[must_use]
    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for slot in self.rooms.iter() {
            let Some(room) = slot.value().get() else {
                continue;
            };
            let room_stats = room.get_stats();
            stats.active_rooms += 1;
            stats.total_peers += room_stats.peer_count;
            stats.total_producers += room_stats.producer_count;
            stats.total_audio_producers += room_stats.audio_producers;
            stats.total_video_producers += room_stats.video_producers;
        }
        stats
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn SfuEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;

    fn registry_with(config: SfuConfig) -> (Arc<LocalEngine>, RoomRegistry) {
        let engine = Arc::new(LocalEngine::default());
        let registry = RoomRegistry::new(engine.clone(), Arc::new(config));
        (engine, registry)
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let (engine, registry) = registry_with(SfuConfig::default());
        assert_eq!(registry.room_count(), 0);

        let room_id = RoomId::from("test-room");
        let room = registry.get_or_create(&room_id).await.unwrap();
        assert_eq!(registry.room_count(), 1);

        // Getting the same room should return the existing one
        let room2 = registry.get_or_create(&room_id).await.unwrap();
        assert!(Arc::ptr_eq(&room, &room2));
        assert_eq!(engine.routers_created(), 1);

        registry.remove(&room_id).await.unwrap();
        assert!(registry.get(&room_id).is_none());
        assert_eq!(engine.routers_closed(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_creates_one_router() {
        let (engine, registry) = registry_with(SfuConfig::default());
        let registry = Arc::new(registry);
        let room_id = RoomId::from("r2");

        let a = {
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tokio::spawn(async move { registry.join(&room_id, &PeerId::from("a")).await })
        };
        let b = {
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tokio::spawn(async move { registry.join(&room_id, &PeerId::from("b")).await })
        };
        let room_a = a.await.unwrap().unwrap();
        let room_b = b.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&room_a, &room_b));
        assert_eq!(engine.routers_created(), 1);
        assert_eq!(room_a.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_router_creation_leaves_no_entry() {
        let (engine, registry) = registry_with(SfuConfig::default());
        engine.fail_next_router();

        let room_id = RoomId::from("broken");
        let err = registry.get_or_create(&room_id).await.err();
        assert!(matches!(err, Some(Error::Engine(_))));
        assert!(registry.get(&room_id).is_none());
        assert!(registry.room_ids().is_empty());

        // The next attempt succeeds with a fresh slot
        assert!(registry.get_or_create(&room_id).await.is_ok());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_requires_empty_room() {
        let (_engine, registry) = registry_with(SfuConfig::default());
        let room_id = RoomId::from("busy");
        registry.join(&room_id, &PeerId::from("a")).await.unwrap();

        let err = registry.remove(&room_id).await.unwrap_err();
        assert_eq!(err.code(), "precondition");
        assert!(registry.get(&room_id).is_some());

        let missing = registry.remove(&RoomId::from("nope")).await.unwrap_err();
        assert_eq!(missing.code(), "notFound");
    }

    #[tokio::test]
    async fn test_join_after_seal_gets_fresh_room() {
        let (engine, registry) = registry_with(SfuConfig::default());
        let room_id = RoomId::from("r3");
        let a = PeerId::from("a");

        let old = registry.join(&room_id, &a).await.unwrap();
        assert!(old.remove_peer(&a));

        // The leaver has not released yet; a joiner must not land in the sealed room
        let fresh = registry.join(&room_id, &PeerId::from("b")).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(engine.routers_created(), 2);

        // The late release closes the old router without touching the new room
        registry.release(&old).await;
        assert!(Arc::ptr_eq(&registry.get(&room_id).unwrap(), &fresh));
        assert_eq!(engine.routers_closed(), 1);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let config = SfuConfig {
            max_peers_per_room: 2,
            ..SfuConfig::default()
        };
        let (_engine, registry) = registry_with(config);
        let room_id = RoomId::from("test-room");

        registry.join(&room_id, &PeerId::from("peer1")).await.unwrap();
        registry.join(&room_id, &PeerId::from("peer2")).await.unwrap();

        let result = registry.join(&room_id, &PeerId::from("peer3")).await;
        assert!(matches!(result, Err(Error::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = SfuConfig {
            max_rooms: 2,
            ..SfuConfig::default()
        };
        let (_engine, registry) = registry_with(config);

        registry.get_or_create(&RoomId::from("room1")).await.unwrap();
        registry.get_or_create(&RoomId::from("room2")).await.unwrap();

        let result = registry.get_or_create(&RoomId::from("room3")).await;
        assert!(matches!(result, Err(Error::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn test_check_capacity_counts_moving_peers() {
        let config = SfuConfig {
            max_rooms: 2,
            max_peers_per_room: 2,
            ..SfuConfig::default()
        };
        let (_engine, registry) = registry_with(config);
        let (a, b, c) = (PeerId::from("a"), PeerId::from("b"), PeerId::from("c"));
        let (a_room, b_room) = (RoomId::from("a-room"), RoomId::from("b-room"));
        registry.join(&a_room, &a).await.unwrap();
        registry.join(&b_room, &b).await.unwrap();
        let movers = [(a.clone(), Some(a_room.clone())), (b.clone(), Some(b_room.clone()))];

        // Both old rooms empty out, so a new room fits under the room limit
        registry
            .check_capacity(&RoomId::from("pair"), &movers)
            .unwrap();
        // Moving into a room one of them already holds
        registry.check_capacity(&a_room, &movers).unwrap();

        registry.join(&b_room, &c).await.unwrap();
        assert!(matches!(
            registry.check_capacity(&b_room, &movers),
            Err(Error::LimitExceeded(_))
        ));
        // b-room keeps c, a-room is freed
        registry
            .check_capacity(&RoomId::from("pair"), &movers)
            .unwrap();
        // Nothing is freed when b moves alone
        assert!(matches!(
            registry.check_capacity(&RoomId::from("pair"), &[(b, Some(b_room))]),
            Err(Error::LimitExceeded(_))
        ));
        assert_eq!(registry.room_count(), 2);
    }

    #[tokio::test]
    async fn test_stats_and_shutdown() {
        let (engine, registry) = registry_with(SfuConfig::default());
        registry.join(&RoomId::from("a"), &PeerId::from("p1")).await.unwrap();
        registry.join(&RoomId::from("a"), &PeerId::from("p2")).await.unwrap();
        registry.join(&RoomId::from("b"), &PeerId::from("p3")).await.unwrap();

        let stats = registry.get_stats();
        assert_eq!(stats.active_rooms, 2);
        assert_eq!(stats.total_peers, 3);

        registry.shutdown().await;
        assert_eq!(registry.room_count(), 0);
        assert_eq!(engine.routers_closed(), 2);
    }
}
