//! The lifecycle transition table.
//!
//! Every state change a device makes goes through [`step`]. The table is a
//! pure function of `(state, trigger)`; it knows nothing about hooks,
//! children or links.

use fleet_events::DeviceState;

/// Something that may move a device from one state to another.
///
/// Commands come from callers; the `*Done`/`*Failed` triggers come from the
/// device's own hooks completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Initialize,
    InitializeDone,
    InitializeFailed,
    Schedule,
    CancelSchedule,
    Claim,
    ClaimDone,
    ClaimFailed,
    Prepare,
    PrepareDone,
    PrepareFailed,
    Resume,
    Suspend,
    Release,
    ReleaseDone { teardown: bool },
    Shutdown,
    Disable,
}

impl Trigger {
    /// Every trigger, for exhaustive table tests.
    pub const ALL: [Trigger; 18] = [
        Trigger::Initialize,
        Trigger::InitializeDone,
        Trigger::InitializeFailed,
        Trigger::Schedule,
        Trigger::CancelSchedule,
        Trigger::Claim,
        Trigger::ClaimDone,
        Trigger::ClaimFailed,
        Trigger::Prepare,
        Trigger::PrepareDone,
        Trigger::PrepareFailed,
        Trigger::Resume,
        Trigger::Suspend,
        Trigger::Release,
        Trigger::ReleaseDone { teardown: false },
        Trigger::ReleaseDone { teardown: true },
        Trigger::Shutdown,
        Trigger::Disable,
    ];

    /// Command name used in wrong-state errors.
    pub fn command(&self) -> &'static str {
        match self {
            Trigger::Initialize | Trigger::InitializeDone | Trigger::InitializeFailed => {
                "initialize"
            }
            Trigger::Schedule => "schedule",
            Trigger::CancelSchedule => "cancel_schedule",
            Trigger::Claim | Trigger::ClaimDone | Trigger::ClaimFailed => "claim",
            Trigger::Prepare | Trigger::PrepareDone | Trigger::PrepareFailed => "prepare",
            Trigger::Resume => "resume",
            Trigger::Suspend => "suspend",
            Trigger::Release | Trigger::ReleaseDone { .. } => "release",
            Trigger::Shutdown => "shutdown",
            Trigger::Disable => "disable",
        }
    }
}

/// Device-specific work to run after entering the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    None,
    RunInitialize,
    RunClaim,
    RunPrepare,
    RunResume,
    RunSuspend,
    RunRelease,
    /// Shutdown arrived mid-release; finish the release, then go down.
    MarkTeardown,
}

/// Result of a legal trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub next: DeviceState,
    pub action: Action,
}

impl Step {
    const fn to(next: DeviceState, action: Action) -> Option<Self> {
        Some(Self { next, action })
    }
}

/// Look up the transition for `trigger` in `state`. `None` means illegal.
pub fn step(state: DeviceState, trigger: Trigger) -> Option<Step> {
    use DeviceState::*;

    match trigger {
        Trigger::Initialize => match state {
            Initial => Step::to(Initial, Action::RunInitialize),
            _ => None,
        },
        Trigger::InitializeDone => match state {
            Initial => Step::to(Idle, Action::None),
            _ => None,
        },
        Trigger::InitializeFailed => match state {
            Initial => Step::to(Disabled, Action::None),
            _ => None,
        },

        Trigger::Schedule | Trigger::CancelSchedule => match state {
            Idle => Step::to(Idle, Action::None),
            _ => None,
        },

        Trigger::Claim => match state {
            Idle => Step::to(Claiming, Action::RunClaim),
            _ => None,
        },
        Trigger::ClaimDone => match state {
            Claiming => Step::to(Claimed, Action::None),
            _ => None,
        },
        Trigger::ClaimFailed => match state {
            Claiming => Step::to(Releasing, Action::RunRelease),
            _ => None,
        },

        Trigger::Prepare => match state {
            Claimed | Suspended => Step::to(Preparing, Action::RunPrepare),
            _ => None,
        },
        Trigger::PrepareDone => match state {
            Preparing => Step::to(Suspended, Action::None),
            _ => None,
        },
        Trigger::PrepareFailed => match state {
            Preparing => Step::to(Claimed, Action::None),
            _ => None,
        },

        Trigger::Resume => match state {
            Suspended => Step::to(Active, Action::RunResume),
            _ => None,
        },
        Trigger::Suspend => match state {
            Active => Step::to(Suspended, Action::RunSuspend),
            _ => None,
        },

        Trigger::Release => match state {
            Idle | Claiming | Claimed | Preparing | Suspended | Active => {
                Step::to(Releasing, Action::RunRelease)
            }
            Initial | Releasing | Disabled | GoingDown => None,
        },
        Trigger::ReleaseDone { teardown } => match state {
            Releasing if teardown => Step::to(GoingDown, Action::None),
            Releasing => Step::to(Idle, Action::None),
            _ => None,
        },

        Trigger::Shutdown => match state {
            Initial | Idle => Step::to(GoingDown, Action::None),
            Claiming | Claimed | Preparing | Suspended | Active => {
                Step::to(Releasing, Action::RunRelease)
            }
            Releasing => Step::to(Releasing, Action::MarkTeardown),
            Disabled | GoingDown => None,
        },
        Trigger::Disable => match state {
            Initial | Idle => Step::to(Disabled, Action::None),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use DeviceState::*;

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in [Disabled, GoingDown] {
            for trigger in Trigger::ALL {
                assert_eq!(step(state, trigger), None, "{state} {trigger:?}");
            }
        }
    }

    #[rstest]
    #[case(Idle, Trigger::Claim, Claiming)]
    #[case(Claiming, Trigger::ClaimDone, Claimed)]
    #[case(Claimed, Trigger::Prepare, Preparing)]
    #[case(Suspended, Trigger::Prepare, Preparing)]
    #[case(Preparing, Trigger::PrepareDone, Suspended)]
    #[case(Preparing, Trigger::PrepareFailed, Claimed)]
    #[case(Suspended, Trigger::Resume, Active)]
    #[case(Active, Trigger::Suspend, Suspended)]
    #[case(Active, Trigger::Release, Releasing)]
    #[case(Releasing, Trigger::ReleaseDone { teardown: false }, Idle)]
    #[case(Releasing, Trigger::ReleaseDone { teardown: true }, GoingDown)]
    #[case(Claiming, Trigger::ClaimFailed, Releasing)]
    #[case(Initial, Trigger::InitializeDone, Idle)]
    #[case(Initial, Trigger::InitializeFailed, Disabled)]
    #[case(Idle, Trigger::Shutdown, GoingDown)]
    #[case(Active, Trigger::Shutdown, Releasing)]
    #[case(Idle, Trigger::Disable, Disabled)]
    fn test_legal_transitions(
        #[case] from: DeviceState,
        #[case] trigger: Trigger,
        #[case] to: DeviceState,
    ) {
        assert_eq!(step(from, trigger).map(|s| s.next), Some(to));
    }

    #[rstest]
    #[case(Idle, Trigger::Resume)]
    #[case(Idle, Trigger::Prepare)]
    #[case(Claimed, Trigger::Claim)]
    #[case(Active, Trigger::Prepare)]
    #[case(Suspended, Trigger::Suspend)]
    #[case(Initial, Trigger::Release)]
    #[case(Releasing, Trigger::Release)]
    #[case(Claimed, Trigger::Schedule)]
    #[case(Active, Trigger::Disable)]
    fn test_illegal_transitions(#[case] from: DeviceState, #[case] trigger: Trigger) {
        assert_eq!(step(from, trigger), None);
    }

    #[test]
    fn test_prepare_failure_never_returns_to_idle() {
        let step = step(Preparing, Trigger::PrepareFailed).unwrap();
        assert_ne!(step.next, Idle);
    }

    #[test]
    fn test_bookkeeping_does_not_move() {
        for trigger in [Trigger::Schedule, Trigger::CancelSchedule] {
            let s = step(Idle, trigger).unwrap();
            assert_eq!(s, Step { next: Idle, action: Action::None });
        }
    }

    #[test]
    fn test_shutdown_during_release_keeps_releasing() {
        let s = step(Releasing, Trigger::Shutdown).unwrap();
        assert_eq!(s.next, Releasing);
        assert_eq!(s.action, Action::MarkTeardown);
    }
}
