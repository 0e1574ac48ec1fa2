//! End-to-end exercise of both transports: a notification stream held open
//! by a vehicle owner, a job scheduled onto that owner's vehicle, and a
//! checkpoint pushed back through the ingress socket.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use convoy_common::Checkpoint;
use convoyd::controller::{Controller, VehicleDetails};
use convoyd::egress::spawn_notification_listener;
use convoyd::ingress::spawn_checkpoint_listener;
use convoyd::registry::Registry;
use convoyd::store::JsonStore;
use convoyd_client::{push_checkpoint, NotificationStream};

struct Daemon {
    _dir: tempfile::TempDir,
    registry: Arc<Registry>,
    controller: Arc<Controller>,
    checkpoint_addr: String,
    notify_addr: String,
}

async fn start_daemon() -> Daemon {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(Registry::new());
    let store = Arc::new(JsonStore::open(dir.path().join("store")).expect("store"));
    let controller = Arc::new(Controller::new(
        registry.clone(),
        store,
        dir.path().join("controller.snapshot.json"),
    ));

    let checkpoint_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ingress");
    let checkpoint_addr = checkpoint_listener.local_addr().unwrap().to_string();
    let notify_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind egress");
    let notify_addr = notify_listener.local_addr().unwrap().to_string();

    spawn_checkpoint_listener(checkpoint_listener, controller.clone());
    spawn_notification_listener(notify_listener, registry.clone());

    Daemon {
        _dir: dir,
        registry,
        controller,
        checkpoint_addr,
        notify_addr,
    }
}

async fn wait_for_channel(registry: &Registry, user: &str, want: bool) {
    for _ in 0..50 {
        if registry.has_channel(user).await == want {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for channel state {want} for {user}");
}

async fn wait_for_checkpoints(registry: &Registry, job_id: &str, count: usize) {
    for _ in 0..50 {
        if registry.checkpoint_count(job_id) == count {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {count} checkpoint(s) of {job_id}");
}

fn van(plate: &str) -> VehicleDetails {
    VehicleDetails {
        plate: plate.to_string(),
        jurisdiction: "CA".to_string(),
        make: "Kenworth".to_string(),
        model: "T680".to_string(),
        year: 2022,
        departure_after: Utc::now() + chrono::Duration::hours(12),
        cpu_status: "8 cores idle".to_string(),
        memory_status: "16 GiB free".to_string(),
    }
}

#[tokio::test]
async fn checkpoint_and_notification_round_trip() {
    let daemon = start_daemon().await;

    // Vehicle owner holds a notification connection open.
    let mut stream = NotificationStream::connect(&daemon.notify_addr, "carol")
        .await
        .expect("connect notification stream");
    wait_for_channel(&daemon.registry, "carol", true).await;

    // Recruit carol's vehicle; the approval is pushed to her open channel.
    let request_id = daemon
        .controller
        .submit_vehicle_request("carol", van("VAN100"))
        .await
        .expect("submit vehicle");
    daemon.controller.approve(&request_id).await.expect("approve vehicle");

    let approved = stream
        .next_timeout(Duration::from_secs(5))
        .await
        .expect("read approval")
        .expect("channel open");
    assert!(approved.contains("approved"), "got: {approved}");

    // A redundancy-1 job schedules straight onto the vehicle; carol is told
    // to begin executing.
    let job_request = daemon
        .controller
        .submit_job_request("alice", "sim", 5, 1, Utc::now() + chrono::Duration::hours(48))
        .await
        .expect("submit job");
    daemon.controller.approve(&job_request).await.expect("approve job");
    let job_id = daemon.controller.get_in_progress_jobs().await[0].id.clone();

    let assignment = stream
        .next_timeout(Duration::from_secs(5))
        .await
        .expect("read assignment")
        .expect("channel open");
    assert!(assignment.contains("begin executing"), "got: {assignment}");
    assert!(assignment.contains(&job_id), "got: {assignment}");

    // The vehicle pushes a checkpoint through the ingress socket.
    let checkpoint = Checkpoint::new(&job_id, "VAN100-CA", b"progress at 40%".to_vec());
    let checkpoint_id = checkpoint.id.clone();
    push_checkpoint(&daemon.checkpoint_addr, &checkpoint)
        .await
        .expect("push checkpoint");
    wait_for_checkpoints(&daemon.registry, &job_id, 1).await;
    assert_eq!(
        daemon.registry.latest_checkpoint(&job_id).unwrap().id,
        checkpoint_id
    );

    // A malformed ingress payload is dropped with no side effects.
    let mut garbage = TcpStream::connect(&daemon.checkpoint_addr)
        .await
        .expect("connect ingress");
    garbage.write_all(b"definitely not a frame\n").await.unwrap();
    garbage.shutdown().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(daemon.registry.checkpoint_count(&job_id), 1);

    // Requesting a checkpoint fans out to the assigned vehicle's owner.
    let notified = daemon
        .controller
        .trigger_checkpoint(&job_id)
        .await
        .expect("trigger checkpoint");
    assert_eq!(notified, 1);
    let requested = stream
        .next_timeout(Duration::from_secs(5))
        .await
        .expect("read checkpoint request")
        .expect("channel open");
    assert!(requested.contains("Checkpoint requested"), "got: {requested}");

    // Closing the connection deregisters the channel; later pushes are
    // dropped at the registry, not errors.
    drop(stream);
    wait_for_channel(&daemon.registry, "carol", false).await;
    daemon.controller.complete_job(&job_id).await.expect("complete");
}

#[tokio::test]
async fn reconnecting_user_keeps_exactly_one_channel() {
    let daemon = start_daemon().await;

    let _first = NotificationStream::connect(&daemon.notify_addr, "carol")
        .await
        .expect("first connect");
    wait_for_channel(&daemon.registry, "carol", true).await;

    let mut second = NotificationStream::connect(&daemon.notify_addr, "carol")
        .await
        .expect("second connect");
    // Give the replacement a moment to win the table slot.
    sleep(Duration::from_millis(300)).await;

    assert!(daemon.registry.notify("carol", "hello again").await);
    let message = second
        .next_timeout(Duration::from_secs(5))
        .await
        .expect("read push")
        .expect("channel open");
    assert_eq!(message, "hello again");
}
