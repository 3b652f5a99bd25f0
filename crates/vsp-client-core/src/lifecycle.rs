use crate::metrics;
use std::{collections::VecDeque, fmt};
use tracing::{debug, warn};

/// Activation state of the driver extension as seen by this client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExtensionState {
    #[default]
    Unknown,
    Unloaded,
    Activating,
    NeedsApproval,
    Activated,
    ActivationError,
    Removal,
}

impl ExtensionState {
    pub const ALL: [ExtensionState; 7] = [
        ExtensionState::Unknown,
        ExtensionState::Unloaded,
        ExtensionState::Activating,
        ExtensionState::NeedsApproval,
        ExtensionState::Activated,
        ExtensionState::ActivationError,
        ExtensionState::Removal,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ExtensionState::Unknown => "unknown",
            ExtensionState::Unloaded => "unloaded",
            ExtensionState::Activating => "activating",
            ExtensionState::NeedsApproval => "needs-approval",
            ExtensionState::Activated => "activated",
            ExtensionState::ActivationError => "activation-error",
            ExtensionState::Removal => "removal",
        }
    }

    /// User-facing status line for this state.
    pub const fn describe(self) -> &'static str {
        match self {
            ExtensionState::Unknown => "Driver state unknown.",
            ExtensionState::Unloaded => "Driver isn't loaded.",
            ExtensionState::Activating => "Activating driver, please wait.",
            ExtensionState::NeedsApproval => {
                "Please follow the prompt to approve the driver extension."
            }
            ExtensionState::Activated => "Driver has been activated and is ready to use.",
            ExtensionState::ActivationError => {
                "Setup has experienced an error during activation.\nPlease check the logs to find the error."
            }
            ExtensionState::Removal => "Driver has been unloaded.",
        }
    }

    /// States the machine rests in once a request has run its course.
    pub const fn is_settled(self) -> bool {
        matches!(
            self,
            ExtensionState::Activated | ExtensionState::Removal | ExtensionState::ActivationError
        )
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the lifecycle machine, produced by the activation gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtensionEvent {
    DiscoveredUnloaded,
    DiscoveredLoaded,
    ActivationStarted,
    UninstallStarted,
    PromptForApproval,
    ActivationFinished,
    ActivationFailed,
    UninstallFinished,
}

impl ExtensionEvent {
    pub const ALL: [ExtensionEvent; 8] = [
        ExtensionEvent::DiscoveredUnloaded,
        ExtensionEvent::DiscoveredLoaded,
        ExtensionEvent::ActivationStarted,
        ExtensionEvent::UninstallStarted,
        ExtensionEvent::PromptForApproval,
        ExtensionEvent::ActivationFinished,
        ExtensionEvent::ActivationFailed,
        ExtensionEvent::UninstallFinished,
    ];
}

/// Pure lifecycle transition function. Pairs without a defined transition
/// land in [`ExtensionState::ActivationError`].
pub fn transition(state: ExtensionState, event: ExtensionEvent) -> ExtensionState {
    use ExtensionEvent as E;
    use ExtensionState as S;

    match state {
        S::Unknown | S::Unloaded => match event {
            E::DiscoveredUnloaded => S::Unloaded,
            E::DiscoveredLoaded => S::Activated,
            E::ActivationStarted => S::Activating,
            E::UninstallStarted | E::UninstallFinished => S::Removal,
            E::PromptForApproval | E::ActivationFinished | E::ActivationFailed => {
                S::ActivationError
            }
        },
        S::Activating | S::NeedsApproval => match event {
            E::ActivationStarted => S::Activating,
            E::PromptForApproval => S::NeedsApproval,
            E::ActivationFinished => S::Activated,
            E::UninstallStarted | E::UninstallFinished => S::Removal,
            E::ActivationFailed | E::DiscoveredUnloaded | E::DiscoveredLoaded => {
                S::ActivationError
            }
        },
        S::Activated => match event {
            E::ActivationStarted => S::Activating,
            E::ActivationFinished => S::Activated,
            E::UninstallStarted | E::UninstallFinished => S::Removal,
            E::DiscoveredUnloaded
            | E::DiscoveredLoaded
            | E::PromptForApproval
            | E::ActivationFailed => S::ActivationError,
        },
        // Re-invoking activation is the only way out.
        S::ActivationError => match event {
            E::ActivationStarted => S::Activating,
            _ => S::ActivationError,
        },
        S::Removal => match event {
            E::UninstallStarted | E::UninstallFinished => S::Removal,
            _ => S::ActivationError,
        },
    }
}

/// One applied lifecycle step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Transition {
    pub from: ExtensionState,
    pub event: ExtensionEvent,
    pub to: ExtensionState,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Holds the current lifecycle state and a bounded log of recent transitions.
#[derive(Clone, Debug)]
pub struct LifecycleMachine {
    state: ExtensionState,
    history: VecDeque<Transition>,
    history_limit: usize,
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: ExtensionState::Unknown,
            history: VecDeque::with_capacity(history_limit.min(DEFAULT_HISTORY_LIMIT)),
            history_limit,
        }
    }

    pub fn state(&self) -> ExtensionState {
        self.state
    }

    /// Apply `event` and return the transition that was taken.
    pub fn feed(&mut self, event: ExtensionEvent) -> Transition {
        let from = self.state;
        let to = transition(from, event);
        self.state = to;
        let step = Transition { from, event, to };

        if to == ExtensionState::ActivationError && from != ExtensionState::ActivationError {
            warn!(from = %from, ?event, "extension lifecycle entered error state");
        } else {
            debug!(from = %from, ?event, to = %to, "extension lifecycle transition");
        }
        metrics::record_lifecycle_transition(to);

        if self.history_limit > 0 {
            if self.history.len() == self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(step);
        }
        step
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExtensionEvent as E;
    use ExtensionState as S;

    fn run(start: S, events: &[E]) -> S {
        events.iter().fold(start, |state, event| transition(state, *event))
    }

    #[test]
    fn table_is_total_and_deterministic() {
        for state in S::ALL {
            for event in E::ALL {
                let first = transition(state, event);
                assert_eq!(first, transition(state, event));
                assert!(S::ALL.contains(&first));
            }
        }
    }

    #[test]
    fn activation_with_approval_reaches_activated() {
        assert_eq!(
            run(
                S::Unknown,
                &[E::ActivationStarted, E::PromptForApproval, E::ActivationFinished]
            ),
            S::Activated
        );
    }

    #[test]
    fn uninstall_from_activated_settles_in_removal() {
        assert_eq!(transition(S::Activated, E::UninstallStarted), S::Removal);
        assert_eq!(
            run(S::Activated, &[E::UninstallStarted, E::UninstallFinished]),
            S::Removal
        );
    }

    #[test]
    fn failure_while_activating_needs_restart_to_recover() {
        for state in [S::Activating, S::NeedsApproval] {
            assert_eq!(transition(state, E::ActivationFailed), S::ActivationError);
        }
        for event in E::ALL {
            if event == E::ActivationStarted {
                continue;
            }
            assert_eq!(transition(S::ActivationError, event), S::ActivationError);
        }
        assert_eq!(
            run(
                S::ActivationError,
                &[E::ActivationStarted, E::ActivationFinished]
            ),
            S::Activated
        );
    }

    #[test]
    fn discovery_from_unknown() {
        assert_eq!(transition(S::Unknown, E::DiscoveredLoaded), S::Activated);
        assert_eq!(transition(S::Unknown, E::DiscoveredUnloaded), S::Unloaded);
        assert_eq!(transition(S::Unloaded, E::ActivationFinished), S::ActivationError);
    }

    #[test]
    fn unexpected_events_while_activated() {
        assert_eq!(transition(S::Activated, E::ActivationFinished), S::Activated);
        assert_eq!(transition(S::Activated, E::ActivationStarted), S::Activating);
        for event in [
            E::DiscoveredLoaded,
            E::DiscoveredUnloaded,
            E::PromptForApproval,
            E::ActivationFailed,
        ] {
            assert_eq!(transition(S::Activated, event), S::ActivationError);
        }
    }

    #[test]
    fn removal_only_accepts_uninstall_events() {
        for event in E::ALL {
            let expected = match event {
                E::UninstallStarted | E::UninstallFinished => S::Removal,
                _ => S::ActivationError,
            };
            assert_eq!(transition(S::Removal, event), expected);
        }
    }

    #[test]
    fn machine_keeps_bounded_history() {
        let mut machine = LifecycleMachine::with_history_limit(2);
        machine.feed(E::ActivationStarted);
        machine.feed(E::PromptForApproval);
        let last = machine.feed(E::ActivationFinished);
        assert_eq!(machine.state(), S::Activated);
        assert_eq!(
            last,
            Transition {
                from: S::NeedsApproval,
                event: E::ActivationFinished,
                to: S::Activated
            }
        );
        let history: Vec<_> = machine.history().copied().collect();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, E::PromptForApproval);
    }

    #[test]
    fn describe_matches_state() {
        assert_eq!(S::Unloaded.describe(), "Driver isn't loaded.");
        assert!(S::ActivationError.describe().contains("error during activation"));
    }
}
