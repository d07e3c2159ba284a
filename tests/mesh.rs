use std::{future::Future, rc::Rc, time::Duration};

use mesh_room::{
    component::PeerState,
    error::MediaError,
    proto::{IceCandidate, SdpType, SignalEnvelope, SignalMessage},
    signaling::{memory::MemoryRelay, SignalingChannel},
    store::{MemoryStore, RoomStore},
    sys::{
        fake::{FakeAudioRenderer, FakeMediaDevices, FakePeerConnectionFactory},
        RtpSender as _,
    },
    ConnectionStatus, Room, RoomConfig, RoomError, RoomId, Services, UserId,
};
use tokio::{task::LocalSet, time::sleep};

struct Member {
    room: Rc<Room>,
    factory: Rc<FakePeerConnectionFactory>,
    devices: Rc<FakeMediaDevices>,
    renderer: Rc<FakeAudioRenderer>,
}

impl Member {
    fn link_state(&self, remote: &str) -> Option<PeerState> {
        self.room.peers().link(&remote.into()).map(|l| l.state())
    }

    fn remote_ids(&self) -> Vec<UserId> {
        self.room.peers().remote_ids()
    }
}

struct Mesh {
    store: Rc<MemoryStore>,
    relay: Rc<MemoryRelay>,
    room_id: RoomId,
}

impl Mesh {
    async fn new() -> Self {
        let store = MemoryStore::new();
        let room_id = RoomId::new("standup");
        store
            .create_room(&room_id, "Standup", &"alice".into())
            .await
            .unwrap();
        Self {
            store,
            relay: MemoryRelay::new(),
            room_id,
        }
    }

    fn member(&self, name: &str) -> Member {
        let factory = FakePeerConnectionFactory::new();
        let devices = FakeMediaDevices::new();
        let renderer = FakeAudioRenderer::new();
        let services = Services {
            store: Rc::clone(&self.store) as Rc<dyn RoomStore>,
            channel: Rc::clone(&self.relay) as Rc<dyn SignalingChannel>,
            factory: Rc::clone(&factory) as _,
            devices: Rc::clone(&devices) as _,
            renderer: Rc::clone(&renderer) as _,
        };
        let room = Room::new(
            self.room_id.clone(),
            &UserId::from(name),
            &RoomConfig::default(),
            services,
        );
        Member {
            room,
            factory,
            devices,
            renderer,
        }
    }

    async fn joined(&self, name: &str) -> Member {
        let member = self.member(name);
        member.room.join().await.unwrap();
        settle().await;
        member
    }
}

async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

async fn local(test: impl Future<Output = ()>) {
    LocalSet::new().run_until(test).await
}

#[tokio::test(start_paused = true)]
async fn two_members_connect_with_single_offer() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;
        let bob = mesh.joined("bob").await;

        assert_eq!(alice.link_state("bob"), Some(PeerState::Connected));
        assert_eq!(bob.link_state("alice"), Some(PeerState::Connected));
        assert!(alice.renderer.is_playing(&"bob".into()));
        assert!(bob.renderer.is_playing(&"alice".into()));

        let alice_pc = alice.factory.latest_to(&"bob".into()).unwrap();
        let bob_pc = bob.factory.latest_to(&"alice".into()).unwrap();
        assert_eq!(alice_pc.local_description().unwrap().kind, SdpType::Offer);
        assert_eq!(bob_pc.local_description().unwrap().kind, SdpType::Answer);
        assert_eq!(alice.factory.created_count(), 1);
        assert_eq!(bob.factory.created_count(), 1);
        assert_eq!(
            alice.room.connection_status(),
            ConnectionStatus::Connected
        );
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn every_pair_has_exactly_one_offerer() {
    local(async {
        let mesh = Mesh::new().await;
        let members = vec![
            mesh.joined("carol").await,
            mesh.joined("alice").await,
            mesh.joined("bob").await,
        ];

        for a in &members {
            for b in &members {
                let (a_id, b_id) = (a.room.local_id(), b.room.local_id());
                if a_id == b_id {
                    continue;
                }
                let pc = a.factory.latest_to(b_id).unwrap();
                let offered =
                    pc.local_description().unwrap().kind == SdpType::Offer;
                assert_eq!(offered, a_id < b_id, "{} -> {}", a_id, b_id);
                assert_eq!(
                    a.room.peers().link(b_id).unwrap().state(),
                    PeerState::Connected
                );
            }
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn departure_releases_remote_links() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;
        let bob = mesh.joined("bob").await;
        let to_bob = alice.factory.latest_to(&"bob".into()).unwrap();

        bob.room.leave().await.unwrap();
        settle().await;

        assert!(alice.remote_ids().is_empty());
        assert!(to_bob.is_closed());
        assert!(!alice.renderer.is_playing(&"bob".into()));

        assert!(!bob.room.is_joined());
        assert!(bob.remote_ids().is_empty());
        assert_eq!(bob.devices.live_tracks(), 0);
        assert_eq!(mesh.relay.subscribers(&mesh.room_id), 1);
        assert!(mesh.store.room_exists(&mesh.room_id));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn last_member_leaving_deletes_room() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;

        alice.room.leave().await.unwrap();

        assert!(!mesh.store.room_exists(&mesh.room_id));
        assert_eq!(mesh.relay.subscribers(&mesh.room_id), 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn signaling_reconnect_keeps_peer_links() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;
        let bob = mesh.joined("bob").await;

        mesh.relay.disconnect(&mesh.room_id);
        settle().await;

        assert_eq!(alice.room.connection_status(), ConnectionStatus::Failed);
        assert_eq!(alice.link_state("bob"), Some(PeerState::Connected));
        assert_eq!(bob.link_state("alice"), Some(PeerState::Connected));

        for member in [&alice, &bob] {
            member
                .room
                .when_connection_status(ConnectionStatus::Connected)
                .await
                .unwrap();
        }
        settle().await;

        for member in [&alice, &bob] {
            assert_eq!(
                member.room.connection_status(),
                ConnectionStatus::Connected
            );
            assert_eq!(member.room.signaling().sessions_opened(), 2);
            assert_eq!(member.factory.created_count(), 1);
        }
        assert_eq!(alice.link_state("bob"), Some(PeerState::Connected));
        assert_eq!(mesh.relay.subscribers(&mesh.room_id), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn early_candidate_is_ignored() {
    local(async {
        let mesh = Mesh::new().await;
        let bob = mesh.joined("bob").await;

        let early = SignalEnvelope {
            from: "alice".into(),
            to: "bob".into(),
            payload: SignalMessage::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:0 1 udp 1 10.9.9.9 9 typ host"
                        .to_owned(),
                    sdp_mid: Some("0".to_owned()),
                    sdp_m_line_index: Some(0),
                },
            },
        };
        mesh.relay.inject(&mesh.room_id, &early.to_json().unwrap());
        settle().await;

        let alice = mesh.joined("alice").await;

        let bob_pc = bob.factory.latest_to(&"alice".into()).unwrap();
        assert_eq!(bob_pc.rejected_candidates(), 1);
        assert_eq!(bob.link_state("alice"), Some(PeerState::Connected));
        assert_eq!(alice.link_state("bob"), Some(PeerState::Connected));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn reconciling_same_members_changes_nothing() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;
        let _bob = mesh.joined("bob").await;
        let _carol = mesh.joined("carol").await;

        let before = alice.remote_ids();
        let report = alice.room.refresh_participants().await.unwrap();

        assert!(report.is_noop());
        assert_eq!(alice.remote_ids(), before);
        assert_eq!(alice.factory.created_count(), 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn mute_only_touches_local_tracks() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;
        let bob = mesh.joined("bob").await;
        let to_bob = alice.factory.latest_to(&"bob".into()).unwrap();

        assert_eq!(alice.room.toggle_mute().await, Ok(true));
        settle().await;

        assert!(alice.room.is_muted());
        assert_eq!(alice.devices.live_tracks(), 0);
        let sent = to_bob.senders()[0].track().unwrap();
        assert!(!sent.enabled());
        assert_eq!(alice.remote_ids(), vec![UserId::from("bob")]);
        assert_eq!(alice.factory.created_count(), 1);
        assert_eq!(alice.link_state("bob"), Some(PeerState::Connected));
        let seen_by_bob = bob
            .room
            .participants()
            .into_iter()
            .find(|p| p.user_id.as_str() == "alice")
            .unwrap();
        assert!(seen_by_bob.is_muted);

        assert_eq!(alice.room.toggle_mute().await, Ok(false));
        settle().await;

        assert_eq!(alice.devices.issued().len(), 2);
        assert_eq!(to_bob.senders().len(), 1);
        let sent = to_bob.senders()[0].track().unwrap();
        assert_eq!(sent.id(), "mic-1");
        assert!(sent.enabled());
        assert_eq!(alice.factory.created_count(), 1);
        assert!(bob.renderer.is_playing(&"alice".into()));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn microphone_failure_joins_listen_only() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.joined("alice").await;
        let bob = mesh.member("bob");
        bob.devices.fail_with(Some(MediaError::PermissionDenied));

        let res = bob.room.join().await;
        settle().await;

        assert_eq!(res, Err(RoomError::Media(MediaError::PermissionDenied)));
        assert!(bob.room.is_joined());
        assert!(bob.room.is_muted());
        let stored = mesh.store.participants(&mesh.room_id).await.unwrap();
        assert!(stored.iter().any(|p| p.user_id.as_str() == "bob" && p.is_muted));

        assert_eq!(bob.link_state("alice"), Some(PeerState::Connected));
        assert!(bob.renderer.is_playing(&"alice".into()));
        assert!(!alice.renderer.is_playing(&"bob".into()));

        assert_eq!(
            bob.room.toggle_mute().await,
            Err(RoomError::Media(MediaError::PermissionDenied))
        );
        assert!(bob.room.is_muted());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn failing_link_does_not_affect_others() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.member("alice");
        alice.factory.refuse(&"carol".into());
        alice.room.join().await.unwrap();
        let bob = mesh.joined("bob").await;
        let carol = mesh.joined("carol").await;

        assert_eq!(alice.remote_ids(), vec![UserId::from("bob")]);
        assert_eq!(alice.link_state("bob"), Some(PeerState::Connected));
        assert_eq!(bob.link_state("carol"), Some(PeerState::Connected));
        assert_eq!(carol.link_state("bob"), Some(PeerState::Connected));
        assert_eq!(carol.link_state("alice"), Some(PeerState::Negotiating));

        alice.factory.allow(&"carol".into());
        alice.room.refresh_participants().await.unwrap();
        settle().await;
        assert_eq!(alice.link_state("carol"), Some(PeerState::Connected));
        assert_eq!(carol.link_state("alice"), Some(PeerState::Connected));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn operations_require_join() {
    local(async {
        let mesh = Mesh::new().await;
        let alice = mesh.member("alice");

        assert_eq!(alice.room.toggle_mute().await, Err(RoomError::NotJoined));
        assert_eq!(alice.room.leave().await, Ok(()));
        assert!(mesh.store.room_exists(&mesh.room_id));
    })
    .await;
}
