use std::sync::Arc;
use std::time::Duration;

use destroyer::registry::Destroyer;
use destroyer::rooms::expiry::MS_PER_MINUTE;
use destroyer::rooms::{Cursor, RoomPhase, SchedulerSettings};
use destroyer::store::RoomStore;
use destroyer::transport::memory::MemoryTransport;
use destroyer::transport::RoomEvent;

const BOT: &str = "@bot:memory";

fn destroyer_with(
    store: RoomStore,
    transport: Arc<MemoryTransport>,
    startup_delay: Duration,
) -> Arc<Destroyer> {
    let settings = SchedulerSettings {
        startup_delay,
        idle_poll: Duration::from_millis(10),
        page_limit: 50,
        ..SchedulerSettings::default()
    };
    Arc::new(Destroyer::new(store, transport, settings))
}

fn enable(store: &RoomStore, room_id: &str) {
    store.create_room(room_id).unwrap();
    store.set_delete_after(room_id, Some(10 * MS_PER_MINUTE)).unwrap();
    store.set_deletion_turned_on(room_id, true).unwrap();
}

#[tokio::test]
async fn start_twice_then_stop() {
    let store = RoomStore::open_memory().unwrap();
    store.create_room("!a:x").unwrap();
    let d = destroyer_with(store, Arc::new(MemoryTransport::new(BOT)), Duration::from_secs(3600));

    assert!(d.start("!a:x"));
    assert!(!d.start("!a:x"));
    assert!(d.is_running("!a:x"));

    assert!(d.stop("!a:x"));
    assert!(!d.stop("!a:x"));
    assert!(!d.stop("!unknown:x"));
}

#[tokio::test]
async fn bootstrap_starts_only_enabled_rooms() {
    let store = RoomStore::open_memory().unwrap();
    enable(&store, "!on1:x");
    enable(&store, "!on2:x");
    store.create_room("!off:x").unwrap();

    let d = destroyer_with(store, Arc::new(MemoryTransport::new(BOT)), Duration::from_secs(3600));
    assert_eq!(d.bootstrap().unwrap(), 2);
    assert_eq!(d.active_rooms(), vec!["!on1:x".to_string(), "!on2:x".to_string()]);

    // A second bootstrap must not double-start anything.
    assert_eq!(d.bootstrap().unwrap(), 0);
    d.shutdown().await;
    assert!(d.active_rooms().is_empty());
}

#[tokio::test]
async fn failed_task_deregisters_and_can_restart() {
    let store = RoomStore::open_memory().unwrap();
    enable(&store, "!a:x");
    let transport = Arc::new(MemoryTransport::new(BOT));
    transport.fail_listings(true);

    let d = destroyer_with(store.clone(), transport.clone(), Duration::ZERO);
    assert!(d.start("!a:x"));

    for _ in 0..500 {
        if !d.is_running("!a:x") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!d.is_running("!a:x"));

    let room = d.rooms().get_existing("!a:x").unwrap().unwrap();
    assert_eq!(room.phase(), RoomPhase::Stopped);
    assert_eq!(transport.notices("!a:x").len(), 1);
    // Persisted flag survives so a restart retries.
    assert!(store.get_room("!a:x").unwrap().unwrap().deletion_turned_on);

    transport.fail_listings(false);
    assert!(d.start("!a:x"));
    d.shutdown().await;
}

#[tokio::test]
async fn restart_waits_for_the_cancelled_task_to_let_go() {
    let store = RoomStore::open_memory().unwrap();
    enable(&store, "!a:x");
    let transport = Arc::new(MemoryTransport::new(BOT));
    let due = chrono::Utc::now().timestamp_millis() - 20 * MS_PER_MINUTE;
    transport.push_event("!a:x", RoomEvent::message("$due", "@alice:memory", due));
    transport.push_event(
        "!a:x",
        RoomEvent::message("$later", "@alice:memory", chrono::Utc::now().timestamp_millis()),
    );

    let d = destroyer_with(store, transport.clone(), Duration::ZERO);
    let room = d.rooms().get_existing("!a:x").unwrap().unwrap();
    room.set_cursor(Some(Cursor {
        event_id: "$due".into(),
        timestamp: due,
        batch_token_start: None,
        batch_token_end: None,
    }))
    .unwrap();

    // First task parks inside the redact of `$due`.
    let gate = transport.hold_redacts().await;
    assert!(d.start("!a:x"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(room.disable().unwrap());
    assert!(d.stop("!a:x"));
    room.request_accept();
    assert!(room.confirm_accept().unwrap());
    assert!(d.start("!a:x"));

    drop(gate);
    for _ in 0..500 {
        if room.cursor().map(|c| c.event_id) == Some("$later".to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    d.shutdown().await;

    assert_eq!(transport.redactions("!a:x"), vec!["$due".to_string()]);
    assert_eq!(room.cursor().unwrap().event_id, "$later");
}
