//! Session Broker - pairs two connected peers and moves them into a shared room

use crate::error::{Error, Result};
use crate::protocol::ServerMessage;
use crate::service::SignalingService;
use crate::types::{PeerId, RoomId, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A pairing of exactly two peers
#[derive(Debug, Clone)]
pub struct Session {
    pub peers: [PeerId; 2],
    pub room_id: Option<RoomId>,
    pub created_at: Instant,
    /// Held for the whole of one room id update
    update_lock: Arc<Mutex<()>>,
}

impl Session {
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains(peer_id)
    }
}

pub struct SessionBroker {
    service: Arc<SignalingService>,
    sessions: DashMap<SessionId, Session>,
}

impl SessionBroker {
    pub fn new(service: Arc<SignalingService>) -> Self {
        Self {
            service,
            sessions: DashMap::new(),
        }
    }

    /// Open a session between `requester` and `target`.
    ///
    /// Both peers receive `newSession` naming the other one.
    pub fn request_session(&self, requester: &PeerId, target: &PeerId) -> Result<SessionId> {
        if requester == target {
            return Err(Error::Precondition(
                "cannot open a session with yourself".to_string(),
            ));
        }
        let hub = self.service.hub();
        if !hub.get(target).is_some_and(|peer| peer.is_connected()) {
            return Err(Error::NotFound(format!("peer {target}")));
        }

        let session_id = SessionId::generate();
        self.sessions.insert(
            session_id.clone(),
            Session {
                peers: [requester.clone(), target.clone()],
                room_id: None,
                created_at: Instant::now(),
                update_lock: Arc::new(Mutex::new(())),
            },
        );

        for (recipient, other) in [(requester, target), (target, requester)] {
            hub.send_to(
                recipient,
                ServerMessage::NewSession {
                    session_id: session_id.clone(),
                    peer_id: other.clone(),
                },
            );
        }
        info!(
            session_id = %session_id,
            requester = %requester,
            target = %target,
            "Session created"
        );
        Ok(session_id)
    }

    /// Move both peers of a session into `room_id`.
    ///
    /// Each peer leaves its current room (if any), joins the new one and is
    /// told `roomIdUpdate`. Only a member of the session may ask. Updates of
    /// one session run one at a time, and room limits are checked for both
    /// peers before either of them moves.
    pub async fn update_room_id(
        &self,
        caller: &PeerId,
        session_id: &SessionId,
        room_id: RoomId,
    ) -> Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if !session.contains(caller) {
            return Err(Error::Precondition(format!(
                "peer {caller} is not a member of session {session_id}"
            )));
        }
        self.service.validate_room_id(&room_id)?;

        let _update = session.update_lock.lock().await;
        self.service.ensure_engine()?;

        let hub = self.service.hub();
        let mut movers = Vec::with_capacity(session.peers.len());
        let mut current = Vec::with_capacity(session.peers.len());
        for peer_id in &session.peers {
            let peer = match hub.get(peer_id) {
                Some(peer) if peer.is_connected() => peer,
                _ => {
                    warn!(
                        session_id = %session_id,
                        peer_id = %peer_id,
                        "Session peer no longer connected, skipping"
                    );
                    continue;
                }
            };
            if peer.is_closed().await {
                continue;
            }
            current.push((peer.id.clone(), peer.room_id().await));
            movers.push(peer);
        }
        self.service.registry().check_capacity(&room_id, &current)?;

        for peer in movers {
            let left = self.service.leave_room(&peer).await;
            if let Err(err) = self.service.join_room(&peer, room_id.clone()).await {
                if peer.is_closed().await {
                    warn!(
                        session_id = %session_id,
                        peer_id = %peer.id,
                        "Session peer disconnected during room update, skipping"
                    );
                    continue;
                }
                warn!(
                    session_id = %session_id,
                    peer_id = %peer.id,
                    room_id = %room_id,
                    error = %err,
                    "Session peer could not join the new room"
                );
                peer.push(ServerMessage::Left { room_id: left });
                peer.push(ServerMessage::from(&err));
                return Err(err);
            }
            peer.push(ServerMessage::RoomIdUpdate {
                session_id: session_id.clone(),
                room_id: room_id.clone(),
            });
        }

        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.room_id = Some(room_id.clone());
        }
        info!(session_id = %session_id, room_id = %room_id, "Session moved to room");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every session naming `peer_id`
    pub fn forget_peer(&self, peer_id: &PeerId) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.contains(peer_id));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(peer_id = %peer_id, removed, "Dropped sessions of disconnected peer");
        }
        removed
    }

    /// Drop sessions older than `ttl`
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.created_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(removed, remaining = self.sessions.len(), "Expired sessions swept");
        }
        removed
    }

    /// Periodically sweep expired sessions until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broker.sweep_expired(ttl);
            }
        })
    }
}
