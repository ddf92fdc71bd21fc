//! Lifecycle behavior observed through the host.
//!
//! Devices are driven with real commands and watched through the status
//! sink, the way an operator would see them.

use std::sync::Arc;

use fleet_device_host::lifecycle::{step, Trigger};
use fleet_device_host::{
    Host, HostConfig, HookOutcome, ManualClock, MapConfigSource, Phase, RecordingStatusSink,
    ResultCode,
};
use fleet_events::{DeviceState, Params};
use fleet_id::DeviceName;
use proptest::prelude::*;
use rstest::rstest;

fn name(s: &str) -> DeviceName {
    DeviceName::new(s).unwrap()
}

fn host() -> (Host, Arc<RecordingStatusSink>) {
    let status = Arc::new(RecordingStatusSink::new());
    let host = Host::new(
        HostConfig::default(),
        Arc::new(ManualClock::at_unix(1_000)),
        status.clone(),
        Arc::new(MapConfigSource::new()),
    )
    .unwrap();
    (host, status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Claim,
    Prepare,
    Resume,
    Suspend,
    Release,
    Shutdown,
    Disable,
}

fn run(host: &mut Host, device: &DeviceName, command: Command) -> Result<(), ResultCode> {
    let result = match command {
        Command::Claim => host.claim(device),
        Command::Prepare => host.prepare(device, Params::new()),
        Command::Resume => host.resume(device),
        Command::Suspend => host.suspend(device),
        Command::Release => host.release(device),
        Command::Shutdown => host.shutdown(device),
        Command::Disable => host.disable(device),
    };
    result.map_err(|e| e.code())
}

fn parse_state(s: &str) -> DeviceState {
    DeviceState::ALL
        .into_iter()
        .find(|state| state.as_str() == s)
        .unwrap_or_else(|| panic!("unknown state {s}"))
}

#[rstest]
#[case(&[Command::Claim], DeviceState::Claimed)]
#[case(&[Command::Claim, Command::Prepare], DeviceState::Suspended)]
#[case(&[Command::Claim, Command::Prepare, Command::Resume], DeviceState::Active)]
#[case(&[Command::Claim, Command::Prepare, Command::Resume, Command::Suspend], DeviceState::Suspended)]
#[case(&[Command::Claim, Command::Prepare, Command::Resume, Command::Release], DeviceState::Idle)]
#[case(&[Command::Claim, Command::Prepare, Command::Resume, Command::Shutdown], DeviceState::GoingDown)]
#[case(&[Command::Disable], DeviceState::Disabled)]
#[case(&[Command::Shutdown], DeviceState::GoingDown)]
fn test_command_sequences(#[case] commands: &[Command], #[case] expected: DeviceState) {
    let (mut host, _) = host();
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    for command in commands {
        run(&mut host, &name("rx0"), *command).unwrap();
    }
    assert_eq!(host.get_state(&name("rx0")).unwrap(), expected);
}

#[rstest]
#[case(&[], Command::Resume)]
#[case(&[], Command::Prepare)]
#[case(&[Command::Claim], Command::Claim)]
#[case(&[Command::Claim, Command::Prepare, Command::Resume], Command::Prepare)]
#[case(&[Command::Claim], Command::Disable)]
#[case(&[Command::Disable], Command::Claim)]
#[case(&[Command::Shutdown], Command::Release)]
fn test_illegal_commands_leave_state(#[case] setup: &[Command], #[case] command: Command) {
    let (mut host, status) = host();
    host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    for c in setup {
        run(&mut host, &name("rx0"), *c).unwrap();
    }
    let before = host.get_state(&name("rx0")).unwrap();
    let published = status.published().len();

    assert_eq!(run(&mut host, &name("rx0"), command), Err(ResultCode::WrongState));
    assert_eq!(host.get_state(&name("rx0")).unwrap(), before);
    assert_eq!(status.published().len(), published);
}

#[test]
fn test_deferred_prepare_failure_returns_to_claimed() {
    let (mut host, _) = host();
    host.create_device("simulated", name("rx0"), Params::new().with("defer", "prepare"))
        .unwrap();
    host.claim(&name("rx0")).unwrap();
    host.prepare(&name("rx0"), Params::new()).unwrap();
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Preparing);

    let fault = fleet_events::ErrorCode::DEVICE_FAULT;
    assert!(host
        .complete(&name("rx0"), Phase::Prepare, HookOutcome::Failed(fault))
        .unwrap());
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Claimed);

    // Completing the same phase again is stale.
    assert!(!host
        .complete(&name("rx0"), Phase::Prepare, HookOutcome::Done)
        .unwrap());
}

#[test]
fn test_failed_claim_releases_back_to_idle() {
    let (mut host, status) = host();
    host.create_device("simulated", name("rx0"), Params::new().with("fail", "claim"))
        .unwrap();
    let err = host.claim(&name("rx0")).unwrap_err();
    assert_eq!(err.code(), ResultCode::DeviceFault);
    assert_eq!(host.get_state(&name("rx0")).unwrap(), DeviceState::Idle);
    assert_eq!(
        status.states_of("rx0"),
        vec!["idle", "claiming", "releasing", "idle"]
    );
}

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::Claim),
        Just(Command::Prepare),
        Just(Command::Resume),
        Just(Command::Suspend),
        Just(Command::Release),
        Just(Command::Shutdown),
        Just(Command::Disable),
    ]
}

proptest! {
    /// Whatever callers do, every published change is a legal table step
    /// and a rejected command changes nothing.
    #[test]
    fn prop_published_transitions_are_legal(commands in prop::collection::vec(command_strategy(), 1..24)) {
        let (mut host, status) = host();
        host.create_device("simulated", name("rx0"), Params::new()).unwrap();

        for command in commands {
            let before = host.get_state(&name("rx0")).unwrap();
            if run(&mut host, &name("rx0"), command) == Err(ResultCode::WrongState) {
                prop_assert_eq!(host.get_state(&name("rx0")).unwrap(), before);
            }
        }

        let states: Vec<DeviceState> = status
            .states_of("rx0")
            .iter()
            .map(|s| parse_state(s))
            .collect();
        prop_assert_eq!(states.first().copied(), Some(DeviceState::Idle));
        for pair in states.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let legal = Trigger::ALL
                .iter()
                .any(|t| step(from, *t).is_some_and(|s| s.next == to));
            prop_assert!(legal, "{} -> {} is not a table step", from, to);
        }
    }
}
