//! End-to-end signaling flows against the in-process engine

use async_trait::async_trait;
use proxima_sfu::engine::{EngineEventReceiver, Router};
use proxima_sfu::{
    CodecConfig, LocalEngine, OutboundReceiver, PeerHub, PeerId, ProducerId, RoomId,
    RoomRegistry, ServerMessage, SessionBroker, SfuConfig, SfuEngine, SignalingDispatcher,
    SignalingService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Arc<LocalEngine>,
    service: Arc<SignalingService>,
    broker: Arc<SessionBroker>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SfuConfig::default())
    }

    fn with_config(config: SfuConfig) -> Self {
        let engine = Arc::new(LocalEngine::new(config.transport.clone()));
        let registry = Arc::new(RoomRegistry::new(engine.clone(), Arc::new(config)));
        let service = Arc::new(SignalingService::new(registry, Arc::new(PeerHub::new())));
        let broker = Arc::new(SessionBroker::new(Arc::clone(&service)));
        Self {
            engine,
            service,
            broker,
        }
    }

    fn connect(&self) -> Client {
        let (dispatcher, mut outbound, engine_events) =
            SignalingDispatcher::connect(Arc::clone(&self.service), Arc::clone(&self.broker));
        let welcome = outbound.try_recv().expect("welcome frame");
        assert_eq!(
            welcome.message,
            ServerMessage::Welcome {
                peer_id: dispatcher.peer_id().clone()
            }
        );
        Client {
            dispatcher,
            outbound,
            engine_events,
            pushed: Vec::new(),
            next_request_id: 0,
        }
    }

    fn has_room(&self, room_id: &str) -> bool {
        self.service
            .registry()
            .get(&RoomId::from(room_id))
            .is_some()
    }
}

struct Client {
    dispatcher: SignalingDispatcher,
    outbound: OutboundReceiver,
    engine_events: EngineEventReceiver,
    pushed: Vec<ServerMessage>,
    next_request_id: u64,
}

impl Client {
    fn id(&self) -> PeerId {
        self.dispatcher.peer_id().clone()
    }

    /// Send one request and return its reply; pushed events are kept aside
    async fn request(&mut self, mut body: Value) -> Option<ServerMessage> {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        body["requestId"] = json!(request_id);
        self.dispatcher.handle_text(&body.to_string()).await;

        let mut reply = None;
        while let Ok(frame) = self.outbound.try_recv() {
            if frame.request_id == Some(request_id) {
                reply = Some(frame.message);
            } else {
                self.pushed.push(frame.message);
            }
        }
        reply
    }

    async fn ok(&mut self, body: Value) -> ServerMessage {
        let reply = self.request(body).await.expect("reply");
        assert!(
            !matches!(reply, ServerMessage::Error { .. }),
            "unexpected error reply: {reply:?}"
        );
        reply
    }

    async fn error_code(&mut self, body: Value) -> String {
        match self.request(body).await {
            Some(ServerMessage::Error { code, .. }) => code,
            other => panic!("expected an error reply, got {other:?}"),
        }
    }

    /// Every event pushed since the last call
    fn events(&mut self) -> Vec<ServerMessage> {
        while let Ok(frame) = self.outbound.try_recv() {
            self.pushed.push(frame.message);
        }
        std::mem::take(&mut self.pushed)
    }

    /// Feed pending engine notifications through the dispatcher
    async fn pump_engine_events(&mut self) {
        while let Ok(event) = self.engine_events.try_recv() {
            self.dispatcher.handle_engine_event(event).await;
        }
    }

    async fn join(&mut self, room_id: &str) -> ServerMessage {
        self.ok(json!({ "type": "joinRoom", "roomId": room_id })).await
    }

    async fn publish(&mut self, kind: &str) -> ProducerId {
        match self
            .ok(json!({
                "type": "produce",
                "kind": kind,
                "rtpParameters": { "codecs": [], "encodings": [{ "ssrc": 1111 }] }
            }))
            .await
        {
            ServerMessage::Produced { id } => id,
            other => panic!("expected produced, got {other:?}"),
        }
    }

    async fn create_transports(&mut self) {
        for sender in [true, false] {
            let reply = self
                .ok(json!({ "type": "createTransport", "sender": sender }))
                .await;
            assert!(matches!(reply, ServerMessage::TransportCreated { .. }));
        }
    }
}

#[tokio::test]
async fn two_peers_publish_subscribe_and_leave() {
    let h = Harness::new();
    let mut x = h.connect();
    let mut y = h.connect();

    assert_eq!(
        x.join("r").await,
        ServerMessage::Joined {
            room_id: RoomId::from("r"),
            existing_producers: vec![],
        }
    );
    y.join("r").await;
    assert_eq!(x.events(), vec![ServerMessage::PeerJoined { peer_id: y.id() }]);

    x.create_transports().await;
    let connect = x
        .request(json!({
            "type": "connectTransport",
            "direction": "send",
            "dtlsParameters": { "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA" }] }
        }))
        .await;
    assert!(connect.is_none());

    let audio = x.publish("audio").await;
    let video = x.publish("video").await;
    assert_eq!(
        y.events(),
        vec![
            ServerMessage::NewProducer {
                producer_id: audio.clone(),
                peer_id: x.id(),
                kind: proxima_sfu::MediaKind::Audio,
            },
            ServerMessage::NewProducer {
                producer_id: video.clone(),
                peer_id: x.id(),
                kind: proxima_sfu::MediaKind::Video,
            },
        ]
    );

    y.create_transports().await;
    let caps = match y.ok(json!({ "type": "getRtpCapabilities" })).await {
        ServerMessage::RtpCapabilities { rtp_capabilities } => rtp_capabilities,
        other => panic!("expected capabilities, got {other:?}"),
    };
    let mut consumer_ids = Vec::new();
    for producer_id in [&audio, &video] {
        let reply = y
            .ok(json!({ "type": "consume", "producerId": producer_id, "rtpCapabilities": caps }))
            .await;
        let ServerMessage::Consumed {
            id,
            producer_id: consumed,
            ..
        } = reply
        else {
            panic!("expected consumed");
        };
        assert_eq!(&consumed, producer_id);
        assert_eq!(
            y.ok(json!({ "type": "resumeConsumer", "consumerId": id })).await,
            ServerMessage::ConsumerResumed {
                consumer_id: id.clone()
            }
        );
        consumer_ids.push(id);
    }

    x.dispatcher.disconnect().await;
    assert_eq!(
        y.events(),
        vec![
            ServerMessage::ProducerClosed {
                producer_id: audio.clone()
            },
            ServerMessage::ProducerClosed {
                producer_id: video.clone()
            },
            ServerMessage::PeerDisconnected { peer_id: x.id() },
        ]
    );

    y.pump_engine_events().await;
    assert_eq!(
        y.events(),
        vec![
            ServerMessage::ConsumerClosed {
                consumer_id: consumer_ids[0].clone(),
                producer_id: audio,
            },
            ServerMessage::ConsumerClosed {
                consumer_id: consumer_ids[1].clone(),
                producer_id: video,
            },
        ]
    );
    assert!(h.has_room("r"));

    assert_eq!(
        y.ok(json!({ "type": "leaveRoom" })).await,
        ServerMessage::Left {
            room_id: Some(RoomId::from("r"))
        }
    );
    assert!(!h.has_room("r"));
    assert_eq!(h.engine.routers_created(), 1);
    assert_eq!(h.engine.routers_closed(), 1);
}

#[tokio::test]
async fn join_lists_only_other_peers_producers() {
    let h = Harness::new();
    let mut a = h.connect();
    let mut b = h.connect();
    let mut c = h.connect();

    a.join("room").await;
    a.create_transports().await;
    let a_audio = a.publish("audio").await;
    b.join("room").await;
    b.create_transports().await;
    let b_video = b.publish("video").await;

    let ServerMessage::Joined {
        existing_producers, ..
    } = c.join("room").await
    else {
        panic!("expected joined");
    };
    let listed: Vec<_> = existing_producers
        .iter()
        .map(|p| (p.producer_id.clone(), p.peer_id.clone()))
        .collect();
    assert_eq!(
        listed,
        vec![(a_audio.clone(), a.id()), (b_video.clone(), b.id())]
    );

    // getProducers is not filtered by owner
    assert_eq!(
        a.ok(json!({ "type": "getProducers" })).await,
        ServerMessage::Producers {
            producers: vec![a_audio, b_video],
        }
    );
}

#[tokio::test]
async fn leave_closes_each_producer_before_peer_disconnected() {
    let h = Harness::new();
    let mut x = h.connect();
    let mut y = h.connect();
    x.join("r").await;
    y.join("r").await;
    x.create_transports().await;
    let produced = vec![
        x.publish("audio").await,
        x.publish("video").await,
        x.publish("video").await,
    ];
    y.events();

    assert_eq!(
        x.ok(json!({ "type": "leaveRoom" })).await,
        ServerMessage::Left {
            room_id: Some(RoomId::from("r"))
        }
    );
    let mut expected: Vec<_> = produced
        .into_iter()
        .map(|producer_id| ServerMessage::ProducerClosed { producer_id })
        .collect();
    expected.push(ServerMessage::PeerDisconnected { peer_id: x.id() });
    assert_eq!(y.events(), expected);

    // A second leave and a disconnect after it change nothing
    assert_eq!(
        x.ok(json!({ "type": "leaveRoom" })).await,
        ServerMessage::Left { room_id: None }
    );
    x.dispatcher.disconnect().await;
    assert!(y.events().is_empty());
    assert_eq!(h.service.registry().get_stats().total_peers, 1);
    assert_eq!(h.service.registry().get_stats().total_producers, 0);
}

#[tokio::test]
async fn registry_holds_a_room_only_while_it_has_peers() {
    let h = Harness::new();
    let mut a = h.connect();
    let mut b = h.connect();
    assert!(!h.has_room("r"));

    a.join("r").await;
    assert!(h.has_room("r"));
    b.join("r").await;

    a.ok(json!({ "type": "leaveRoom" })).await;
    assert!(h.has_room("r"));
    b.dispatcher.disconnect().await;
    assert!(!h.has_room("r"));
    assert_eq!(h.engine.routers_closed(), 1);

    // Re-using the id builds a fresh router
    a.join("r").await;
    assert!(h.has_room("r"));
    assert_eq!(h.engine.routers_created(), 2);
}

#[tokio::test]
async fn concurrent_joins_share_one_router() {
    let h = Harness::new();
    let clients: Vec<Client> = (0..8).map(|_| h.connect()).collect();

    futures::future::join_all(
        clients
            .iter()
            .map(|c| c.dispatcher.handle_text(r#"{"type":"joinRoom","roomId":"busy"}"#)),
    )
    .await;

    assert_eq!(h.engine.routers_created(), 1);
    let room = h
        .service
        .registry()
        .get(&RoomId::from("busy"))
        .expect("room");
    assert_eq!(room.peer_count(), clients.len());
}

#[tokio::test]
async fn session_handshake_moves_both_peers() {
    let h = Harness::new();
    let mut a = h.connect();
    let mut b = h.connect();
    a.join("lobby").await;

    let session_id = match a
        .ok(json!({ "type": "requestSession", "targetPeerId": b.id() }))
        .await
    {
        ServerMessage::SessionRequested { session_id } => session_id,
        other => panic!("expected sessionRequested, got {other:?}"),
    };
    assert_eq!(
        a.events(),
        vec![ServerMessage::NewSession {
            session_id: session_id.clone(),
            peer_id: b.id(),
        }]
    );
    assert_eq!(
        b.events(),
        vec![ServerMessage::NewSession {
            session_id: session_id.clone(),
            peer_id: a.id(),
        }]
    );

    assert_eq!(
        b.ok(json!({ "type": "updateRoomId", "sessionId": session_id, "roomId": "pair" }))
            .await,
        ServerMessage::RoomIdUpdated {
            session_id: session_id.clone(),
            room_id: RoomId::from("pair"),
        }
    );

    let update = ServerMessage::RoomIdUpdate {
        session_id: session_id.clone(),
        room_id: RoomId::from("pair"),
    };
    let a_events = a.events();
    assert!(a_events.contains(&update));
    assert!(a_events.contains(&ServerMessage::PeerJoined { peer_id: b.id() }));
    assert_eq!(b.events(), vec![update]);

    assert!(!h.has_room("lobby"));
    let room = h.service.registry().get(&RoomId::from("pair")).expect("room");
    assert!(room.contains_peer(&a.id()));
    assert!(room.contains_peer(&b.id()));
    assert_eq!(
        h.broker.get(&session_id).and_then(|s| s.room_id),
        Some(RoomId::from("pair"))
    );
}

#[tokio::test]
async fn session_rules() {
    let h = Harness::new();
    let mut a = h.connect();
    let b = h.connect();
    let mut c = h.connect();

    let own_id = a.id();
    assert_eq!(
        a.error_code(json!({ "type": "requestSession", "targetPeerId": own_id }))
            .await,
        "precondition"
    );
    assert_eq!(
        a.error_code(json!({ "type": "requestSession", "targetPeerId": "ghost" }))
            .await,
        "notFound"
    );

    let ServerMessage::SessionRequested { session_id } = a
        .ok(json!({ "type": "requestSession", "targetPeerId": b.id() }))
        .await
    else {
        panic!("expected sessionRequested");
    };
    assert_eq!(
        c.error_code(json!({ "type": "updateRoomId", "sessionId": session_id, "roomId": "x" }))
            .await,
        "precondition"
    );

    b.dispatcher.disconnect().await;
    assert_eq!(h.broker.session_count(), 0);
    assert_eq!(
        a.error_code(json!({ "type": "updateRoomId", "sessionId": session_id, "roomId": "x" }))
            .await,
        "notFound"
    );
}

#[tokio::test]
async fn sessions_expire() {
    let h = Harness::new();
    let mut a = h.connect();
    let b = h.connect();
    a.ok(json!({ "type": "requestSession", "targetPeerId": b.id() }))
        .await;
    assert_eq!(h.broker.session_count(), 1);

    assert_eq!(h.broker.sweep_expired(Duration::from_secs(600)), 0);
    assert_eq!(h.broker.sweep_expired(Duration::ZERO), 1);
    assert_eq!(h.broker.session_count(), 0);
}

#[tokio::test]
async fn protocol_errors_are_reported_to_the_caller() {
    let h = Harness::new();
    let mut a = h.connect();

    assert_eq!(a.error_code(json!({ "type": "getProducers" })).await, "notJoined");
    assert_eq!(
        a.error_code(json!({ "type": "produce", "kind": "audio", "rtpParameters": {} }))
            .await,
        "notJoined"
    );
    assert_eq!(
        a.error_code(json!({ "type": "joinRoom" })).await,
        "invalidPayload"
    );

    a.join("r").await;
    assert_eq!(
        a.error_code(json!({ "type": "joinRoom", "roomId": "other" }))
            .await,
        "alreadyJoined"
    );
    assert_eq!(
        a.error_code(json!({ "type": "consume", "producerId": "p", "rtpCapabilities": {} }))
            .await,
        "notFound"
    );
    a.create_transports().await;
    assert_eq!(
        a.error_code(json!({ "type": "createTransport", "sender": true }))
            .await,
        "transportExists"
    );
    assert_eq!(
        a.error_code(json!({ "type": "consume", "producerId": "p", "rtpCapabilities": {} }))
            .await,
        "cannotConsume"
    );
}

#[tokio::test]
async fn engine_failures() {
    let h = Harness::new();
    let mut a = h.connect();

    h.engine.fail_next_router();
    assert_eq!(
        a.error_code(json!({ "type": "joinRoom", "roomId": "r" })).await,
        "engine"
    );
    assert!(!h.has_room("r"));
    assert!(a.dispatcher.peer().room_id().await.is_none());

    a.join("r").await;
    h.engine.kill();
    assert_eq!(
        a.error_code(json!({ "type": "getRtpCapabilities" })).await,
        "notReady"
    );
    let mut b = h.connect();
    assert_eq!(
        b.error_code(json!({ "type": "joinRoom", "roomId": "r" })).await,
        "notReady"
    );
}

#[tokio::test]
async fn peer_limit_is_enforced() {
    let h = Harness::with_config(SfuConfig {
        max_peers_per_room: 1,
        ..SfuConfig::default()
    });
    let mut a = h.connect();
    let mut b = h.connect();
    a.join("small").await;
    assert_eq!(
        b.error_code(json!({ "type": "joinRoom", "roomId": "small" }))
            .await,
        "limitExceeded"
    );
    assert!(b.dispatcher.peer().room_id().await.is_none());
}

/// Local engine whose router creation takes `delay`
struct SlowRouters {
    inner: LocalEngine,
    delay: Duration,
}

#[async_trait]
impl SfuEngine for SlowRouters {
    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn create_router(&self, codecs: &[CodecConfig]) -> proxima_sfu::Result<Arc<dyn Router>> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_router(codecs).await
    }
}

#[tokio::test]
async fn peer_disconnecting_during_room_update_is_not_moved() {
    let engine = Arc::new(SlowRouters {
        inner: LocalEngine::default(),
        delay: Duration::from_millis(100),
    });
    let registry = Arc::new(RoomRegistry::new(engine, Arc::new(SfuConfig::default())));
    let service = Arc::new(SignalingService::new(
        Arc::clone(&registry),
        Arc::new(PeerHub::new()),
    ));
    let broker = Arc::new(SessionBroker::new(Arc::clone(&service)));
    let (a, _a_out, _a_events) =
        SignalingDispatcher::connect(Arc::clone(&service), Arc::clone(&broker));
    let (b, _b_out, _b_events) =
        SignalingDispatcher::connect(Arc::clone(&service), Arc::clone(&broker));

    b.handle_text(r#"{"type":"joinRoom","roomId":"other"}"#).await;
    let session_id = broker.request_session(a.peer_id(), b.peer_id()).unwrap();

    // b goes away while a is still waiting on the new room's router
    let (update, ()) = tokio::join!(
        broker.update_room_id(a.peer_id(), &session_id, RoomId::from("pair")),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            b.disconnect().await;
        },
    );
    update.unwrap();

    let room = registry.get(&RoomId::from("pair")).expect("pair room");
    assert_eq!(room.peer_ids(), vec![a.peer_id().clone()]);
    assert!(registry.get(&RoomId::from("other")).is_none());
    assert!(b.peer().room_id().await.is_none());

    a.disconnect().await;
    assert_eq!(registry.room_count(), 0);
}
