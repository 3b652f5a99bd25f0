use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    num::NonZeroU32,
};

/// Identifies one outstanding command from submission to completion. Never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationToken(NonZeroU32);

impl CorrelationToken {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandState {
    #[default]
    Unknown,
    Waiting,
    Success,
    NoCallback,
    Error,
}

impl CommandState {
    pub const fn describe(self) -> &'static str {
        match self {
            CommandState::Unknown => "Waiting for action",
            CommandState::Waiting => "Sent request, waiting for response",
            CommandState::Success => "Request returned successfully",
            CommandState::NoCallback => "Assign a callback before you send an async message",
            CommandState::Error => "Request returned an error, check the logs for details",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Success | CommandState::NoCallback | CommandState::Error
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandEvent {
    SentRequest,
    Returned,
    Failed,
    FoundNoCallback,
}

/// Completion transition. Flat: the event alone decides the next state.
pub fn process(_state: CommandState, event: CommandEvent) -> CommandState {
    match event {
        CommandEvent::SentRequest => CommandState::Waiting,
        CommandEvent::Returned => CommandState::Success,
        CommandEvent::Failed => CommandState::Error,
        CommandEvent::FoundNoCallback => CommandState::NoCallback,
    }
}

pub const DEFAULT_TRACKER_RETAIN: usize = 64;

/// Per-token command states. Finished entries beyond the retain limit are
/// forgotten oldest first; waiting entries are never pruned.
#[derive(Clone, Debug)]
pub struct CompletionTracker {
    states: BTreeMap<CorrelationToken, CommandState>,
    finished: VecDeque<CorrelationToken>,
    last: CommandState,
    retain: usize,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::with_retain(DEFAULT_TRACKER_RETAIN)
    }

    pub fn with_retain(retain: usize) -> Self {
        Self {
            states: BTreeMap::new(),
            finished: VecDeque::new(),
            last: CommandState::Unknown,
            retain,
        }
    }

    pub fn record(&mut self, token: CorrelationToken, event: CommandEvent) -> CommandState {
        let next = process(self.state(token), event);
        self.states.insert(token, next);
        self.last = next;
        if next.is_terminal() {
            self.finished.push_back(token);
            self.prune();
        }
        next
    }

    pub fn state(&self, token: CorrelationToken) -> CommandState {
        self.states.get(&token).copied().unwrap_or_default()
    }

    /// State most recently recorded for any token.
    pub fn last(&self) -> CommandState {
        self.last
    }

    pub fn in_flight(&self) -> usize {
        self.states
            .values()
            .filter(|state| **state == CommandState::Waiting)
            .count()
    }

    fn prune(&mut self) {
        while self.finished.len() > self.retain {
            let Some(token) = self.finished.pop_front() else {
                break;
            };
            if self.state(token).is_terminal() {
                self.states.remove(&token);
            }
        }
    }
}
