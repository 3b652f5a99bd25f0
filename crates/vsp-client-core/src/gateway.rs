use crate::{
    lifecycle::{ExtensionEvent, ExtensionState, LifecycleMachine, Transition},
    observer::{ClientEvent, ObserverRegistry},
    properties::{ExtensionProperties, compare_versions, select_installed},
    status::{DriverStatus, StatusNotice},
};
use std::{
    cmp::Ordering,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{info, warn};

const APPROVAL_MESSAGE: &str = "User must approve in System Settings → Privacy & Security.";
const REBOOT_MESSAGE: &str = "A reboot is required to finalize this change.";

/// Terminal result reported by the system for an activation or deactivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationResult {
    Completed,
    WillCompleteAfterReboot,
    /// A raw result the client does not recognise; treated as a failure.
    Unknown(i64),
}

/// Failure reported by the system. The cause is for display only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationFailure {
    pub code: i64,
    pub domain: String,
    pub message: String,
}

/// Callbacks the system delivers for a submitted extension request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivationCallback {
    NeedsUserApproval,
    Finished(ActivationResult),
    Failed(ActivationFailure),
    ReplaceExtension {
        existing: ExtensionProperties,
        replacement: ExtensionProperties,
    },
    FoundProperties(Vec<ExtensionProperties>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplacementAction {
    Cancel,
    Replace,
}

/// Decides whether an already installed extension gets replaced during activation.
pub trait ReplacementPolicy: Send + Sync {
    fn decide(
        &self,
        existing: &ExtensionProperties,
        replacement: &ExtensionProperties,
    ) -> ReplacementAction;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysReplace;

impl ReplacementPolicy for AlwaysReplace {
    fn decide(&self, _: &ExtensionProperties, _: &ExtensionProperties) -> ReplacementAction {
        ReplacementAction::Replace
    }
}

/// Replace only when the incoming bundle version is strictly newer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplaceIfNewer;

impl ReplacementPolicy for ReplaceIfNewer {
    fn decide(
        &self,
        existing: &ExtensionProperties,
        replacement: &ExtensionProperties,
    ) -> ReplacementAction {
        match compare_versions(&replacement.bundle_version, &existing.bundle_version) {
            Ordering::Greater => ReplacementAction::Replace,
            _ => ReplacementAction::Cancel,
        }
    }
}

/// Which extension request is outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingOperation {
    Activate,
    Deactivate,
}

impl PendingOperation {
    fn started_event(self) -> ExtensionEvent {
        match self {
            PendingOperation::Activate => ExtensionEvent::ActivationStarted,
            PendingOperation::Deactivate => ExtensionEvent::UninstallStarted,
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOperation::Activate => f.write_str("activation"),
            PendingOperation::Deactivate => f.write_str("deactivation"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("{0} request already in flight")]
    Busy(PendingOperation),
    #[error("extension request rejected: {message} ({code})")]
    Rejected { code: i64, message: String },
    #[error("extension manager unavailable")]
    Unavailable,
}

/// The system's extension activation API.
///
/// Submissions return immediately; the outcome arrives later as
/// [`ActivationCallback`]s handed to [`ActivationGateway::handle`].
pub trait ExtensionManager: Send + Sync {
    fn submit_activation(&self, identifier: &str) -> Result<(), GatewayError>;

    fn submit_deactivation(&self, identifier: &str) -> Result<(), GatewayError>;

    fn submit_properties(&self, identifier: &str) -> Result<(), GatewayError>;

    /// Answer a pending [`ActivationCallback::ReplaceExtension`] prompt.
    fn resolve_replacement(&self, _action: ReplacementAction) -> Result<(), GatewayError> {
        Ok(())
    }
}

impl<T> ExtensionManager for Arc<T>
where
    T: ExtensionManager + ?Sized,
{
    fn submit_activation(&self, identifier: &str) -> Result<(), GatewayError> {
        (**self).submit_activation(identifier)
    }

    fn submit_deactivation(&self, identifier: &str) -> Result<(), GatewayError> {
        (**self).submit_deactivation(identifier)
    }

    fn submit_properties(&self, identifier: &str) -> Result<(), GatewayError> {
        (**self).submit_properties(identifier)
    }

    fn resolve_replacement(&self, action: ReplacementAction) -> Result<(), GatewayError> {
        (**self).resolve_replacement(action)
    }
}

struct GatewayState {
    machine: LifecycleMachine,
    pending: Option<PendingOperation>,
    installed: Option<ExtensionProperties>,
}

/// Submits extension requests and turns system callbacks into lifecycle events.
pub struct ActivationGateway<M> {
    manager: M,
    identifier: String,
    policy: Box<dyn ReplacementPolicy>,
    observers: Arc<ObserverRegistry>,
    inner: Mutex<GatewayState>,
}

impl<M> ActivationGateway<M>
where
    M: ExtensionManager,
{
    pub fn new(
        manager: M,
        identifier: impl Into<String>,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        Self::with_machine(manager, identifier, observers, LifecycleMachine::new())
    }

    pub fn with_machine(
        manager: M,
        identifier: impl Into<String>,
        observers: Arc<ObserverRegistry>,
        machine: LifecycleMachine,
    ) -> Self {
        Self {
            manager,
            identifier: identifier.into(),
            policy: Box::new(AlwaysReplace),
            observers,
            inner: Mutex::new(GatewayState {
                machine,
                pending: None,
                installed: None,
            }),
        }
    }

    pub fn set_policy<P>(&mut self, policy: P)
    where
        P: ReplacementPolicy + 'static,
    {
        self.policy = Box::new(policy);
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn state(&self) -> ExtensionState {
        self.lock().machine.state()
    }

    pub fn pending(&self) -> Option<PendingOperation> {
        self.lock().pending
    }

    /// Installation picked by the last properties query.
    pub fn installed(&self) -> Option<ExtensionProperties> {
        self.lock().installed.clone()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.lock().machine.history().copied().collect()
    }

    /// Submit an activation request and move to `Activating` right away.
    pub fn activate(&self) -> Result<Transition, GatewayError> {
        self.submit(PendingOperation::Activate)
    }

    /// Submit a deactivation request and move to `Removal` right away.
    pub fn deactivate(&self) -> Result<Transition, GatewayError> {
        self.submit(PendingOperation::Deactivate)
    }

    /// Ask the system for installed instances; the answer arrives as
    /// [`ActivationCallback::FoundProperties`].
    pub fn query_installed_properties(&self) -> Result<(), GatewayError> {
        self.manager
            .submit_properties(&self.identifier)
            .inspect_err(|err| {
                warn!(error = %err, identifier = %self.identifier, "properties query rejected");
                self.observers.notify(&ClientEvent::Status(StatusNotice::new(
                    DriverStatus::Failure,
                    err.to_string(),
                )));
            })
    }

    fn submit(&self, op: PendingOperation) -> Result<Transition, GatewayError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock();
            if let Some(current) = state.pending {
                warn!(%current, requested = %op, "extension request already in flight");
                return Err(GatewayError::Busy(current));
            }
            state.pending = Some(op);
            let (status, message) = match op {
                PendingOperation::Activate => {
                    (DriverStatus::Loading, "Submitting activation request.")
                }
                PendingOperation::Deactivate => {
                    (DriverStatus::Unloading, "Submitting deactivation request.")
                }
            };
            events.push(ClientEvent::Status(StatusNotice::new(status, message)));
            info!(identifier = %self.identifier, %op, "submitting extension request");

            let submitted = match op {
                PendingOperation::Activate => self.manager.submit_activation(&self.identifier),
                PendingOperation::Deactivate => {
                    self.manager.submit_deactivation(&self.identifier)
                }
            };
            match submitted {
                Ok(()) => Ok(feed(&mut state, op.started_event(), &mut events)),
                Err(err) => {
                    warn!(error = %err, %op, "extension request rejected on submit");
                    state.pending = None;
                    feed(&mut state, ExtensionEvent::ActivationFailed, &mut events);
                    events.push(ClientEvent::Status(StatusNotice::new(
                        DriverStatus::Failure,
                        err.to_string(),
                    )));
                    Err(err)
                }
            }
        };
        self.observers.notify_all(events);
        result
    }

    /// Apply one system callback. Each callback maps to exactly one lifecycle event.
    pub fn handle(&self, callback: ActivationCallback) -> Transition {
        let mut events = Vec::new();
        let step = {
            let mut state = self.lock();
            match callback {
                ActivationCallback::NeedsUserApproval => {
                    info!("extension requires user approval");
                    events.push(ClientEvent::Status(StatusNotice::new(
                        DriverStatus::RequiresUserApproval,
                        APPROVAL_MESSAGE,
                    )));
                    feed(&mut state, ExtensionEvent::PromptForApproval, &mut events)
                }
                ActivationCallback::ReplaceExtension {
                    existing,
                    replacement,
                } => {
                    let action = self.policy.decide(&existing, &replacement);
                    info!(
                        existing = %existing.bundle_version,
                        replacement = %replacement.bundle_version,
                        ?action,
                        "replacing installed extension"
                    );
                    if let Err(err) = self.manager.resolve_replacement(action) {
                        warn!(error = %err, "failed to deliver replacement decision");
                    }
                    events.push(ClientEvent::Status(replacement_notice(
                        action,
                        &existing,
                        &replacement,
                    )));
                    let event = match state.pending {
                        Some(PendingOperation::Deactivate) => ExtensionEvent::UninstallStarted,
                        _ => ExtensionEvent::ActivationStarted,
                    };
                    feed(&mut state, event, &mut events)
                }
                ActivationCallback::Finished(result) => {
                    let op = state.pending.take();
                    info!(?result, ?op, "extension request finished");
                    let (event, notice) = finished_outcome(op, result);
                    events.push(ClientEvent::Status(notice));
                    feed(&mut state, event, &mut events)
                }
                ActivationCallback::Failed(failure) => {
                    let op = state.pending.take();
                    warn!(
                        code = failure.code,
                        domain = %failure.domain,
                        message = %failure.message,
                        ?op,
                        "extension request failed"
                    );
                    events.push(ClientEvent::Status(
                        StatusNotice::new(DriverStatus::Failure, failure.message)
                            .with_code(failure.code)
                            .with_domain(failure.domain),
                    ));
                    feed(&mut state, ExtensionEvent::ActivationFailed, &mut events)
                }
                ActivationCallback::FoundProperties(properties) => {
                    let installed = select_installed(&properties).cloned();
                    let (event, status) = match &installed {
                        Some(props) => {
                            info!(version = %props.bundle_version, "found enabled extension");
                            (ExtensionEvent::DiscoveredLoaded, DriverStatus::Loaded)
                        }
                        None => {
                            info!(reported = properties.len(), "no enabled extension installed");
                            (ExtensionEvent::DiscoveredUnloaded, DriverStatus::NotLoaded)
                        }
                    };
                    state.installed = installed;
                    let step = feed(&mut state, event, &mut events);
                    events.push(ClientEvent::Status(StatusNotice::new(
                        status,
                        step.to.describe(),
                    )));
                    step
                }
            }
        };
        self.observers.notify_all(events);
        step
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn feed(
    state: &mut GatewayState,
    event: ExtensionEvent,
    events: &mut Vec<ClientEvent>,
) -> Transition {
    let step = state.machine.feed(event);
    events.push(ClientEvent::Lifecycle(step));
    step
}

fn replacement_notice(
    action: ReplacementAction,
    existing: &ExtensionProperties,
    replacement: &ExtensionProperties,
) -> StatusNotice {
    match action {
        ReplacementAction::Replace => StatusNotice::new(
            DriverStatus::Loading,
            format!(
                "Replacing driver {} with {}.",
                existing.bundle_version, replacement.bundle_version
            ),
        ),
        ReplacementAction::Cancel => StatusNotice::new(
            DriverStatus::Loaded,
            format!(
                "Keeping driver {}, not replacing it with {}.",
                existing.bundle_version, replacement.bundle_version
            ),
        ),
    }
}

fn finished_outcome(
    op: Option<PendingOperation>,
    result: ActivationResult,
) -> (ExtensionEvent, StatusNotice) {
    match (op, result) {
        (Some(PendingOperation::Deactivate), ActivationResult::Completed) => (
            ExtensionEvent::UninstallFinished,
            StatusNotice::new(DriverStatus::Unloaded, "Driver deactivated successfully."),
        ),
        (Some(PendingOperation::Deactivate), ActivationResult::WillCompleteAfterReboot) => (
            ExtensionEvent::UninstallFinished,
            StatusNotice::new(DriverStatus::WillCompleteAfterReboot, REBOOT_MESSAGE),
        ),
        (_, ActivationResult::Completed) => (
            ExtensionEvent::ActivationFinished,
            StatusNotice::new(DriverStatus::Loaded, "Driver activated successfully."),
        ),
        (_, ActivationResult::WillCompleteAfterReboot) => (
            ExtensionEvent::ActivationFinished,
            StatusNotice::new(DriverStatus::WillCompleteAfterReboot, REBOOT_MESSAGE),
        ),
        (_, ActivationResult::Unknown(raw)) => (
            ExtensionEvent::ActivationFailed,
            StatusNotice::new(DriverStatus::Failure, "Unknown system state returned.")
                .with_code(raw),
        ),
    }
}
