//! Remote links: buffering while down, reconnect backoff and replays.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_device_host::{
    Host, HostConfig, LinkEvent, ManualClock, MapConfigSource, MockTransport,
    RecordingStatusSink,
};
use fleet_events::{DeviceEvent, DeviceState, Envelope, ErrorCode, Params};
use fleet_id::{DeviceName, LinkId, LinkSeq};
use fleet_reconcile::BackoffPolicy;

fn name(s: &str) -> DeviceName {
    DeviceName::new(s).unwrap()
}

fn host(buffer_cap: usize) -> (Host, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_000));
    let config = HostConfig {
        event_buffer_cap: buffer_cap,
        reconnect: BackoffPolicy::fixed(Duration::from_secs(1), Duration::from_secs(8)),
        ..HostConfig::default()
    };
    let host = Host::new(
        config,
        clock.clone(),
        Arc::new(RecordingStatusSink::new()),
        Arc::new(MapConfigSource::new()),
    )
    .unwrap();
    (host, clock)
}

fn reported_states(mock: &MockTransport) -> Vec<DeviceState> {
    mock.sent()
        .into_iter()
        .filter_map(|e| match e.event {
            DeviceEvent::StateReport { state, .. } => Some(state),
            _ => None,
        })
        .collect()
}

fn envelope(seq: u64, source: &str, destination: &str, event: DeviceEvent) -> LinkEvent {
    LinkEvent::Event(Envelope {
        seq: LinkSeq::new(seq),
        sent_at: Utc::now(),
        source: name(source),
        destination: name(destination),
        event,
    })
}

fn advance(host: &mut Host, clock: &ManualClock, secs: i64) {
    clock.advance_secs(secs);
    host.advance();
}

#[test]
fn test_reports_buffered_while_down_are_flushed_in_order() {
    let (mut host, clock) = host(16);
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let mock = MockTransport::new();
    host.register_listener(&name("rx0"), &name("ctl"), Box::new(mock.clone()))
        .unwrap();
    assert_eq!(reported_states(&mock), vec![DeviceState::Idle]);

    mock.set_down(true);
    host.claim(&name("rx0")).unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Claimed);
    assert_eq!(reported_states(&mock), vec![DeviceState::Idle]);

    advance(&mut host, &clock, 1);
    let states = reported_states(&mock);
    assert_eq!(
        &states[..3],
        &[DeviceState::Idle, DeviceState::Claiming, DeviceState::Claimed]
    );
    // Reconnecting re-announces the current state.
    assert_eq!(states.last(), Some(&DeviceState::Claimed));

    let seqs: Vec<u64> = mock.sent().iter().map(|e| e.seq.value()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
}

#[test]
fn test_full_buffer_drops_oldest() {
    let (mut host, clock) = host(2);
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let mock = MockTransport::new();
    host.register_listener(&name("rx0"), &name("ctl"), Box::new(mock.clone()))
        .unwrap();

    mock.set_down(true);
    host.claim_and_prepare(&name("rx0"), Params::new()).unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Suspended);

    advance(&mut host, &clock, 1);
    assert_eq!(
        reported_states(&mock),
        vec![
            DeviceState::Idle,
            DeviceState::Preparing,
            DeviceState::Suspended,
            DeviceState::Suspended,
        ]
    );
}

#[test]
fn test_child_link_reconnects_with_backoff() {
    let (mut host, clock) = host(16);
    host.create_device("composite", name("beam0"), Params::new()).unwrap();
    let mock = MockTransport::new();
    mock.fail_opens(2);
    let link = host
        .attach_remote_child(&name("beam0"), name("rx0"), "simulated", Box::new(mock.clone()))
        .unwrap();
    assert_eq!(mock.open_calls(), 1);
    assert!(!host.links().get(link).unwrap().is_connected());

    // Nobody connected to claim through; the composite waits.
    host.claim(&name("beam0")).unwrap();
    assert_eq!(host.get_state(&name("beam0")).unwrap(), DeviceState::Claiming);

    advance(&mut host, &clock, 1);
    assert_eq!(mock.open_calls(), 2);
    advance(&mut host, &clock, 3);
    assert_eq!(mock.open_calls(), 2);
    advance(&mut host, &clock, 1);
    assert_eq!(mock.open_calls(), 3);
    assert!(host.links().get(link).unwrap().is_connected());
    assert!(mock
        .sent()
        .iter()
        .any(|e| e.event == DeviceEvent::QueryState));

    host.deliver(
        link,
        envelope(
            1,
            "rx0",
            "beam0",
            DeviceEvent::StateReport {
                device: name("rx0"),
                device_type: "simulated".into(),
                state: DeviceState::Claimed,
                error: ErrorCode::OK,
            },
        ),
    )
    .unwrap();
    assert_eq!(host.get_state(&name("beam0")).unwrap(), DeviceState::Claimed);
}

#[test]
fn test_command_for_disconnected_child_is_delivered_on_reconnect() {
    let (mut host, clock) = host(16);
    host.create_device("composite", name("beam0"), Params::new()).unwrap();
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    host.connect_child(&name("beam0"), &name("rx0")).unwrap();
    let mock = MockTransport::new();
    let link = host
        .attach_remote_child(&name("beam0"), name("rx9"), "simulated", Box::new(mock.clone()))
        .unwrap();
    host.deliver(
        link,
        envelope(
            1,
            "rx9",
            "beam0",
            DeviceEvent::StateReport {
                device: name("rx9"),
                device_type: "simulated".into(),
                state: DeviceState::Idle,
                error: ErrorCode::OK,
            },
        ),
    )
    .unwrap();

    mock.set_down(true);
    host.deliver(link, LinkEvent::Disconnected).unwrap();

    // rx9 is out of the quorum while down, so rx0 alone is enough.
    host.claim(&name("beam0")).unwrap();
    assert_eq!(host.get_state(&name("beam0")).unwrap(), DeviceState::Claimed);
    assert!(mock.sent().iter().all(|e| e.event != DeviceEvent::Claim));

    advance(&mut host, &clock, 1);
    assert!(host.links().get(link).unwrap().is_connected());
    let events: Vec<DeviceEvent> = mock.sent().into_iter().map(|e| e.event).collect();
    let claim = events.iter().position(|e| *e == DeviceEvent::Claim);
    let query = events.iter().position(|e| *e == DeviceEvent::QueryState);
    assert!(claim.is_some(), "{events:?}");
    assert!(claim < query, "buffered claim flushes before the re-query: {events:?}");
}

#[test]
fn test_replayed_commands_are_dropped() {
    let (mut host, _) = host(16);
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let mock = MockTransport::new();
    let link = host
        .attach_remote_parent(&name("rx0"), &name("beam0"), Box::new(mock.clone()))
        .unwrap();

    host.deliver(link, envelope(1, "beam0", "rx0", DeviceEvent::Claim))
        .unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Claimed);

    host.deliver(link, envelope(1, "beam0", "rx0", DeviceEvent::Release))
        .unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Claimed);

    host.deliver(link, envelope(2, "beam0", "rx0", DeviceEvent::Release))
        .unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Idle);
}

#[test]
fn test_transport_loss_never_changes_state() {
    let (mut host, _) = host(16);
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let mock = MockTransport::new();
    let link = host
        .attach_remote_parent(&name("rx0"), &name("beam0"), Box::new(mock.clone()))
        .unwrap();
    host.claim(&name("rx0")).unwrap();

    host.deliver(link, LinkEvent::Disconnected).unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Claimed);
    assert!(host.next_deadline().is_some());

    host.deliver(link, LinkEvent::Connected).unwrap();
    assert!(host.links().get(link).unwrap().is_connected());
    assert_eq!(reported_states(&mock).last(), Some(&DeviceState::Claimed));
}

#[test]
fn test_removed_device_closes_its_links() {
    let (mut host, _) = host(16);
    host.create_device("composite", name("beam0"), Params::new()).unwrap();
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    host.connect_child(&name("beam0"), &name("rx0")).unwrap();
    let mock = MockTransport::new();
    host.register_listener(&name("rx0"), &name("ctl"), Box::new(mock.clone()))
        .unwrap();
    assert_eq!(host.links().len(), 3);

    host.destroy_device(&name("rx0")).unwrap();
    assert_eq!(host.collect_garbage(), vec![name("rx0")]);

    assert_eq!(mock.close_calls(), 1);
    assert!(host.links().is_empty());
    assert!(host.device(&name("beam0")).unwrap().children().is_empty());
}

#[test]
fn test_unknown_link_is_not_found() {
    let (mut host, _) = host(16);
    let err = host
        .deliver(LinkId::issue(), LinkEvent::Connected)
        .unwrap_err();
    assert_eq!(err.code(), fleet_device_host::ResultCode::NotFound);
}
