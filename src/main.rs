use std::{error::Error, rc::Rc, time::Duration};

use mesh_room::{
    signaling::{memory::MemoryRelay, SignalingChannel},
    store::{MemoryStore, RoomStore},
    sys::fake::{FakeAudioRenderer, FakeMediaDevices, FakePeerConnectionFactory},
    Room, RoomConfig, RoomId, Services, UserId,
};
use futures::StreamExt as _;
use tokio::{task, time::sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Time for in-process signaling to settle.
const SETTLE: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    task::LocalSet::new().run_until(run()).await
}

async fn run() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let relay = MemoryRelay::new();
    let config = RoomConfig::default();
    let room_id = RoomId::new("demo");
    store.create_room(&room_id, "Demo", &"alice".into()).await?;

    let mut rooms = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let user = UserId::from(name);
        store.set_display_name(&user, name.to_uppercase());
        let services = Services {
            store: Rc::clone(&store) as Rc<dyn RoomStore>,
            channel: Rc::clone(&relay) as Rc<dyn SignalingChannel>,
            factory: FakePeerConnectionFactory::new(),
            devices: FakeMediaDevices::new(),
            renderer: FakeAudioRenderer::new(),
        };
        let room = Room::new(room_id.clone(), &user, &config, services);
        watch(&room);
        room.join().await?;
        rooms.push(room);
    }
    sleep(SETTLE).await;
    report(&rooms);

    rooms[1].toggle_mute().await?;
    sleep(SETTLE).await;
    for p in rooms[0].participants() {
        info!(member = %p.label(), muted = p.is_muted, "Seen by alice");
    }

    rooms[2].leave().await?;
    sleep(SETTLE).await;
    report(&rooms[..2]);

    for room in &rooms[..2] {
        room.leave().await?;
    }
    info!(
        exists = store.room_exists(&room_id),
        delivered = relay.delivered(),
        "Everybody left"
    );

    Ok(())
}

/// Logs mute and signaling status changes of `room`.
fn watch(room: &Rc<Room>) {
    let user = room.local_id().clone();
    let mut muted = room.on_mute_change();
    task::spawn_local({
        let user = user.clone();
        async move {
            while let Some(muted) = muted.next().await {
                info!(%user, muted, "Mute changed");
            }
        }
    });
    let mut status = room.on_connection_status_change();
    task::spawn_local(async move {
        while let Some(status) = status.next().await {
            info!(%user, ?status, "Signaling status changed");
        }
    });
}

fn report(rooms: &[Rc<Room>]) {
    for room in rooms {
        for (remote, state) in room.peers().states() {
            info!(local = %room.local_id(), %remote, ?state, "Peer link");
        }
    }
}
