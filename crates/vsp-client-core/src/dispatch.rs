use crate::{
    completion::{CommandEvent, CommandState, CompletionTracker, CorrelationToken},
    connection::ConnectionManager,
    metrics,
    observer::{ClientEvent, ObserverRegistry},
    status::{DriverStatus, StatusNotice},
    transport::{COMPLETION_SUCCESS, Completion, NoticeSender, TransportError, UserClient},
};
use futures_channel::oneshot;
use futures_util::FutureExt;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU32, Ordering},
    },
    task::{Context, Poll},
    time::Instant,
};
use tracing::{debug, trace, warn};
use vsp_proto::{
    CheckFlags, ControlCommand, ControllerData, DriverStatusError, PortParameters, ProtoError,
    TraceFlags,
};

/// Why a command could not be submitted.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no completion callback registered")]
    NoCallback,
    #[error("driver is not connected")]
    NotConnected,
    #[error("invalid request: {0}")]
    InvalidRequest(ProtoError),
    #[error("transport rejected request: {0}")]
    Transport(#[from] TransportError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Why a submitted command did not produce usable data.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandFailure {
    #[error("driver completed with error 0x{0:08x}")]
    Completion(u32),
    #[error("{0}")]
    Driver(DriverStatusError),
    #[error("malformed driver response: {0}")]
    Malformed(ProtoError),
    #[error("driver disconnected before the command completed")]
    Disconnected,
    #[error("command abandoned")]
    Dropped,
}

impl CommandFailure {
    /// Numeric code reported alongside data errors.
    pub fn code(&self) -> u64 {
        match self {
            CommandFailure::Completion(code) => u64::from(*code),
            CommandFailure::Driver(err) => u64::from(err.code()),
            _ => 0,
        }
    }
}

pub type CommandResult = Result<ControllerData, CommandFailure>;

/// Resolves once the driver completes the command.
#[derive(Debug)]
#[must_use = "a pending command does nothing unless awaited or dropped deliberately"]
pub struct PendingCommand {
    token: CorrelationToken,
    command: ControlCommand,
    rx: oneshot::Receiver<CommandResult>,
}

impl PendingCommand {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub fn command(&self) -> ControlCommand {
        self.command
    }
}

impl Future for PendingCommand {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|res| res.unwrap_or(Err(CommandFailure::Dropped)))
    }
}

struct PendingEntry {
    command: ControlCommand,
    submitted_at: Instant,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Default)]
struct DispatchState {
    pending: BTreeMap<CorrelationToken, PendingEntry>,
    tracker: CompletionTracker,
}

/// Sends commands over the live connection and correlates their completions.
pub struct CommandDispatcher<U> {
    client: U,
    connection: Arc<ConnectionManager>,
    observers: Arc<ObserverRegistry>,
    callback: RwLock<Option<NoticeSender>>,
    next_token: AtomicU32,
    inner: Mutex<DispatchState>,
}

impl<U> CommandDispatcher<U>
where
    U: UserClient,
{
    pub fn new(
        client: U,
        connection: Arc<ConnectionManager>,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        Self {
            client,
            connection,
            observers,
            callback: RwLock::new(None),
            next_token: AtomicU32::new(1),
            inner: Mutex::new(DispatchState::default()),
        }
    }

    pub fn client(&self) -> &U {
        &self.client
    }

    /// Install the channel completions are delivered through. Returns the previous one.
    pub fn register_callback(&self, callback: NoticeSender) -> Option<NoticeSender> {
        self.callback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(callback)
    }

    pub fn clear_callback(&self) -> Option<NoticeSender> {
        self.callback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn has_callback(&self) -> bool {
        self.current_callback().is_some()
    }

    pub fn command_state(&self, token: CorrelationToken) -> CommandState {
        self.lock().tracker.state(token)
    }

    /// Most recently recorded command state across all tokens.
    pub fn last_state(&self) -> CommandState {
        self.lock().tracker.last()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().pending.len()
    }

    /// Submit `request`. `Ok` means the transport accepted it; the returned
    /// future resolves when the driver completes it.
    pub fn send(&self, request: ControllerData) -> DispatchResult<PendingCommand> {
        let token = self.allocate_token();
        let command = request.command;

        let Some(callback) = self.current_callback() else {
            let state = self
                .lock()
                .tracker
                .record(token, CommandEvent::FoundNoCallback);
            warn!(%command, %token, "command sent without a completion callback");
            metrics::record_command_rejected(command);
            self.observers.notify(&ClientEvent::Command { token, state });
            return Err(DispatchError::NoCallback);
        };
        let Some(lease) = self.connection.lease() else {
            debug!(%command, "driver not connected");
            metrics::record_command_rejected(command);
            return Err(DispatchError::NotConnected);
        };

        let (reply, rx) = oneshot::channel();
        let (state, submitted) = {
            let mut inner = self.lock();
            match self
                .client
                .submit(lease.handle(), token, &request, &callback)
            {
                Ok(()) => {
                    inner.pending.insert(
                        token,
                        PendingEntry {
                            command,
                            submitted_at: Instant::now(),
                            reply,
                        },
                    );
                    (inner.tracker.record(token, CommandEvent::SentRequest), Ok(()))
                }
                Err(err) => (inner.tracker.record(token, CommandEvent::Failed), Err(err)),
            }
        };
        drop(lease);
        self.observers.notify(&ClientEvent::Command { token, state });

        match submitted {
            Ok(()) => {
                trace!(%command, %token, "command submitted");
                metrics::record_command_sent(command);
                Ok(PendingCommand { token, command, rx })
            }
            Err(err) => {
                warn!(%command, %token, error = %err, "transport rejected command");
                metrics::record_command_rejected(command);
                Err(DispatchError::Transport(err))
            }
        }
    }

    /// Apply a driver completion. Returns `false` for tokens that are not pending.
    pub fn complete(&self, completion: Completion) -> bool {
        let Completion {
            token,
            result,
            payload,
        } = completion;
        let (entry, outcome, state) = {
            let mut inner = self.lock();
            let Some(entry) = inner.pending.remove(&token) else {
                warn!(%token, result, "completion for unknown token dropped");
                return false;
            };
            let outcome = evaluate(entry.command, result, &payload);
            let event = match &outcome {
                Ok(_) | Err(CommandFailure::Driver(_)) => CommandEvent::Returned,
                Err(_) => CommandEvent::Failed,
            };
            let state = inner.tracker.record(token, event);
            (entry, outcome, state)
        };

        let elapsed = entry.submitted_at.elapsed();
        metrics::observe_command_completed(entry.command, outcome.is_ok(), elapsed);
        match &outcome {
            Ok(_) => debug!(command = %entry.command, %token, ?elapsed, "command completed"),
            Err(err) => {
                warn!(command = %entry.command, %token, error = %err, "command failed")
            }
        }

        self.observers.notify(&ClientEvent::Command { token, state });
        self.observers.notify(&data_event(&outcome));
        if let Err(CommandFailure::Malformed(err)) = &outcome {
            self.observers.notify(&ClientEvent::Status(StatusNotice::new(
                DriverStatus::DataError,
                format!("Unreadable reply to {}: {err}", entry.command),
            )));
        }
        let _ = entry.reply.send(outcome);
        true
    }

    /// Fail every outstanding command, e.g. because the driver went away.
    pub fn fail_all(&self, failure: CommandFailure) -> usize {
        let failed: Vec<_> = {
            let mut inner = self.lock();
            let pending = std::mem::take(&mut inner.pending);
            pending
                .into_iter()
                .map(|(token, entry)| {
                    let state = inner.tracker.record(token, CommandEvent::Failed);
                    (token, entry, state)
                })
                .collect()
        };
        if !failed.is_empty() {
            warn!(count = failed.len(), reason = %failure, "failing outstanding commands");
        }
        let count = failed.len();
        for (token, entry, state) in failed {
            metrics::observe_command_completed(entry.command, false, entry.submitted_at.elapsed());
            self.observers.notify(&ClientEvent::Command { token, state });
            let _ = entry.reply.send(Err(failure.clone()));
        }
        if count > 0 {
            self.observers.notify(&ClientEvent::DataError {
                code: failure.code(),
                message: failure.to_string(),
            });
        }
        count
    }

    pub fn get_status(&self) -> DispatchResult<PendingCommand> {
        self.send(ControllerData::request(ControlCommand::GetStatus))
    }

    pub fn create_port(&self, params: PortParameters) -> DispatchResult<PendingCommand> {
        params.validate().map_err(DispatchError::InvalidRequest)?;
        self.send(
            ControllerData::request(ControlCommand::CreatePort)
                .with_link(1, 1)
                .with_port_parameters(params),
        )
    }

    pub fn remove_port(&self, id: u8) -> DispatchResult<PendingCommand> {
        self.send(ControllerData::request(ControlCommand::RemovePort).with_link(id, id))
    }

    pub fn link_ports(&self, source: u8, target: u8) -> DispatchResult<PendingCommand> {
        self.send(ControllerData::request(ControlCommand::LinkPorts).with_link(source, target))
    }

    pub fn unlink_ports(&self, source: u8, target: u8) -> DispatchResult<PendingCommand> {
        self.send(ControllerData::request(ControlCommand::UnlinkPorts).with_link(source, target))
    }

    pub fn get_port_list(&self) -> DispatchResult<PendingCommand> {
        self.send(ControllerData::request(ControlCommand::GetPortList))
    }

    pub fn get_link_list(&self) -> DispatchResult<PendingCommand> {
        self.send(ControllerData::request(ControlCommand::GetLinkList))
    }

    pub fn enable_checks(&self, port: u8, checks: CheckFlags) -> DispatchResult<PendingCommand> {
        let mut request =
            ControllerData::request(ControlCommand::EnableChecks).with_link(port, port);
        request.check_flags = checks;
        self.send(request)
    }

    pub fn enable_trace(&self, port: u8, traces: TraceFlags) -> DispatchResult<PendingCommand> {
        let mut request =
            ControllerData::request(ControlCommand::EnableTrace).with_link(port, port);
        request.trace_flags = traces;
        self.send(request)
    }

    /// Set both masks on `port` in a single driver call.
    pub fn enable_checks_and_trace(
        &self,
        port: u8,
        checks: CheckFlags,
        traces: TraceFlags,
    ) -> DispatchResult<PendingCommand> {
        let mut request =
            ControllerData::request(ControlCommand::EnableChecks).with_link(port, port);
        request.check_flags = checks;
        request.trace_flags = traces;
        self.send(request)
    }

    fn allocate_token(&self) -> CorrelationToken {
        loop {
            let raw = self.next_token.fetch_add(1, Ordering::Relaxed);
            if let Some(token) = CorrelationToken::new(raw) {
                return token;
            }
        }
    }

    fn current_callback(&self) -> Option<NoticeSender> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evaluate(command: ControlCommand, result: u32, payload: &[u8]) -> CommandResult {
    if result != COMPLETION_SUCCESS {
        return Err(CommandFailure::Completion(result));
    }
    let data = ControllerData::try_from(payload).map_err(CommandFailure::Malformed)?;
    if data.command != command {
        return Err(CommandFailure::Malformed(ProtoError::InvalidSignature {
            expected: command.signature(),
            actual: data.signature,
        }));
    }
    data.verify_signature().map_err(CommandFailure::Malformed)?;
    if let Some(err) = data.status_error() {
        return Err(CommandFailure::Driver(err));
    }
    Ok(data)
}

fn data_event(outcome: &CommandResult) -> ClientEvent {
    match outcome {
        Ok(data) => ClientEvent::DataReady(data.clone()),
        Err(failure) => ClientEvent::DataError {
            code: failure.code(),
            message: failure.to_string(),
        },
    }
}
