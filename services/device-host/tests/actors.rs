//! The host running on its actor loop, driven through `HostClient`.

use std::sync::Arc;
use std::time::Duration;

use fleet_device_host::actors::{spawn_actor, ActorRef, DeviceCommand, HostActor, HostClient};
use fleet_device_host::{
    Host, HostConfig, ManualClock, MapConfigSource, RecordingStatusSink, ResultCode,
};
use fleet_events::{DeviceState, Params, ScheduleWindow};
use fleet_id::DeviceName;

const T0: i64 = 1_000;

fn name(s: &str) -> DeviceName {
    DeviceName::new(s).unwrap()
}

fn spawn_host() -> (HostClient, ActorRef, Arc<ManualClock>, Arc<RecordingStatusSink>) {
    let clock = Arc::new(ManualClock::at_unix(T0));
    let status = Arc::new(RecordingStatusSink::new());
    let host = Host::new(
        HostConfig::default(),
        clock.clone(),
        status.clone(),
        Arc::new(MapConfigSource::new()),
    )
    .unwrap();
    let (handle, actor_ref) = spawn_actor(HostActor::new(host), 64);
    (HostClient::new(handle), actor_ref, clock, status)
}

#[tokio::test(start_paused = true)]
async fn test_schedule_fires_on_the_loop() {
    let (client, actor_ref, clock, _) = spawn_host();
    client
        .create_device("simulated", name("rx0"), Params::new())
        .await
        .unwrap();
    let window = ScheduleWindow::new(T0 + 10, T0 + 20).unwrap();
    client
        .command(
            name("rx0"),
            DeviceCommand::Schedule {
                window,
                params: Params::new(),
            },
        )
        .await
        .unwrap();

    clock.advance_secs(10);
    // Any message makes the loop look at its deadlines again.
    assert_eq!(client.get_state(name("rx0")).await.unwrap(), DeviceState::Idle);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.get_state(name("rx0")).await.unwrap(), DeviceState::Active);

    clock.advance_secs(10);
    client.teardown_candidates().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.get_state(name("rx0")).await.unwrap(), DeviceState::Idle);
    assert_eq!(client.teardown_candidates().await.unwrap(), vec![name("rx0")]);

    actor_ref.stop();
    actor_ref.join().await;
}

#[tokio::test]
async fn test_stop_shuts_devices_down() {
    let (client, actor_ref, _, status) = spawn_host();
    for rx in ["rx0", "rx1"] {
        client
            .create_device("simulated", name(rx), Params::new())
            .await
            .unwrap();
    }
    client.command(name("rx1"), DeviceCommand::Claim).await.unwrap();

    actor_ref.stop();
    actor_ref.join().await;

    assert_eq!(status.states_of("rx0"), vec!["idle", "going_down"]);
    assert_eq!(
        status.states_of("rx1"),
        vec!["idle", "claiming", "claimed", "releasing", "going_down"]
    );
    let err = client.get_state(name("rx0")).await.unwrap_err();
    assert_eq!(err.code(), ResultCode::TransportFailure);
}

#[tokio::test]
async fn test_wrong_state_reaches_the_caller() {
    let (client, actor_ref, _, _) = spawn_host();
    client
        .create_device("simulated", name("rx0"), Params::new())
        .await
        .unwrap();
    let err = client
        .command(name("rx0"), DeviceCommand::Resume)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::WrongState);

    let err = client
        .command(name("ghost"), DeviceCommand::Claim)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::NotFound);

    actor_ref.stop();
    actor_ref.join().await;
}
