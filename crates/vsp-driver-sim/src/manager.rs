use crate::deliver;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use vsp_client_core::{
    ActivationCallback, ActivationFailure, ActivationResult, DriverNotice, ExtensionManager,
    ExtensionProperties, GatewayError, NoticeSender, ReplacementAction, compare_versions,
};
use vsp_proto::DEFAULT_EXTENSION_ID;

pub const EXTENSION_ERROR_DOMAIN: &str = "OSSystemExtensionErrorDomain";
pub const ERROR_EXTENSION_NOT_FOUND: i64 = 4;
pub const ERROR_CODE_SIGNATURE_INVALID: i64 = 8;
pub const ERROR_REQUEST_CANCELED: i64 = 11;

/// How the simulated system answers extension requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimScript {
    /// Extension identifier the system knows about.
    pub identifier: String,
    /// Version a successful activation installs.
    pub bundle_version: String,
    pub require_approval: bool,
    pub reboot_required: bool,
    /// Report this failure instead of finishing.
    pub fail_with: Option<ActivationFailure>,
    /// Refuse requests on submit instead of answering later.
    pub reject_submission: bool,
    pub installed: Vec<ExtensionProperties>,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_EXTENSION_ID.to_string(),
            bundle_version: "1.0".to_string(),
            require_approval: false,
            reboot_required: false,
            fail_with: None,
            reject_submission: false,
            installed: Vec::new(),
        }
    }
}

impl SimScript {
    pub fn with_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_reboot(mut self) -> Self {
        self.reboot_required = true;
        self
    }

    pub fn with_installed(mut self, bundle_version: &str) -> Self {
        self.installed
            .push(ExtensionProperties::enabled(self.identifier.clone(), bundle_version));
        self
    }

    pub fn with_bundle_version(mut self, bundle_version: &str) -> Self {
        self.bundle_version = bundle_version.to_string();
        self
    }

    pub fn failing(mut self, code: i64, message: &str) -> Self {
        self.fail_with = Some(failure(code, message));
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.reject_submission = true;
        self
    }
}

struct ManagerState {
    script: SimScript,
    /// Callbacks held back until a replacement prompt is answered.
    parked: Option<(ExtensionProperties, Vec<ActivationCallback>)>,
    submissions: usize,
}

/// Scripted stand-in for the OS extension manager.
pub struct SimExtensionManager {
    notices: NoticeSender,
    inner: Mutex<ManagerState>,
}

impl SimExtensionManager {
    pub fn new(notices: NoticeSender, script: SimScript) -> Self {
        Self {
            notices,
            inner: Mutex::new(ManagerState {
                script,
                parked: None,
                submissions: 0,
            }),
        }
    }

    /// Change the script for subsequent requests.
    pub fn update_script<F>(&self, f: F)
    where
        F: FnOnce(&mut SimScript),
    {
        f(&mut self.lock().script);
    }

    pub fn installed(&self) -> Vec<ExtensionProperties> {
        self.lock().script.installed.clone()
    }

    pub fn submissions(&self) -> usize {
        self.lock().submissions
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, callbacks: Vec<ActivationCallback>) {
        deliver(
            &self.notices,
            callbacks.into_iter().map(DriverNotice::Activation),
        );
    }

    fn accept(&self, state: &mut ManagerState, identifier: &str) -> Result<(), GatewayError> {
        state.submissions += 1;
        if state.script.reject_submission {
            return Err(GatewayError::Rejected {
                code: ERROR_REQUEST_CANCELED,
                message: "request rejected by the system".to_string(),
            });
        }
        if identifier != state.script.identifier {
            debug!(identifier, "request for unknown extension");
            return Err(GatewayError::Rejected {
                code: ERROR_EXTENSION_NOT_FOUND,
                message: format!("unknown extension {identifier}"),
            });
        }
        Ok(())
    }
}

impl ExtensionManager for SimExtensionManager {
    fn submit_activation(&self, identifier: &str) -> Result<(), GatewayError> {
        let mut state = self.lock();
        self.accept(&mut state, identifier)?;

        let replacement = ExtensionProperties::enabled(
            state.script.identifier.clone(),
            state.script.bundle_version.clone(),
        );
        let mut callbacks = Vec::new();
        if state.script.require_approval {
            callbacks.push(ActivationCallback::NeedsUserApproval);
        }
        match state.script.fail_with.clone() {
            Some(failure) => callbacks.push(ActivationCallback::Failed(failure)),
            None => {
                callbacks.push(ActivationCallback::Finished(finish(
                    state.script.reboot_required,
                )));
            }
        }

        let existing = state
            .script
            .installed
            .iter()
            .filter(|props| props.enabled)
            .find(|props| {
                compare_versions(&props.bundle_version, &replacement.bundle_version).is_ne()
            })
            .cloned();
        if let Some(existing) = existing {
            info!(
                existing = %existing.bundle_version,
                replacement = %replacement.bundle_version,
                "asking whether to replace installed extension"
            );
            state.parked = Some((replacement.clone(), callbacks));
            drop(state);
            self.send(vec![ActivationCallback::ReplaceExtension {
                existing,
                replacement,
            }]);
            return Ok(());
        }

        if state.script.fail_with.is_none() {
            install(&mut state.script, replacement);
        }
        drop(state);
        self.send(callbacks);
        Ok(())
    }

    fn submit_deactivation(&self, identifier: &str) -> Result<(), GatewayError> {
        let mut state = self.lock();
        self.accept(&mut state, identifier)?;

        let before = state.script.installed.len();
        state.script.installed.retain(|props| props.identifier != identifier);
        let callback = if before == state.script.installed.len() {
            ActivationCallback::Failed(failure(ERROR_EXTENSION_NOT_FOUND, "extension not found"))
        } else {
            ActivationCallback::Finished(finish(state.script.reboot_required))
        };
        drop(state);
        self.send(vec![callback]);
        Ok(())
    }

    fn submit_properties(&self, identifier: &str) -> Result<(), GatewayError> {
        let found = self
            .lock()
            .script
            .installed
            .iter()
            .filter(|props| props.identifier == identifier)
            .cloned()
            .collect();
        self.send(vec![ActivationCallback::FoundProperties(found)]);
        Ok(())
    }

    fn resolve_replacement(&self, action: ReplacementAction) -> Result<(), GatewayError> {
        let mut state = self.lock();
        let Some((replacement, callbacks)) = state.parked.take() else {
            return Err(GatewayError::Unavailable);
        };
        let callbacks = match action {
            ReplacementAction::Replace => {
                if state.script.fail_with.is_none() {
                    install(&mut state.script, replacement);
                }
                callbacks
            }
            ReplacementAction::Cancel => vec![ActivationCallback::Failed(failure(
                ERROR_REQUEST_CANCELED,
                "request canceled",
            ))],
        };
        drop(state);
        self.send(callbacks);
        Ok(())
    }
}

fn finish(reboot_required: bool) -> ActivationResult {
    if reboot_required {
        ActivationResult::WillCompleteAfterReboot
    } else {
        ActivationResult::Completed
    }
}

fn install(script: &mut SimScript, replacement: ExtensionProperties) {
    script
        .installed
        .retain(|props| props.identifier != replacement.identifier);
    script.installed.push(replacement);
}

fn failure(code: i64, message: &str) -> ActivationFailure {
    ActivationFailure {
        code,
        domain: EXTENSION_ERROR_DOMAIN.to_string(),
        message: message.to_string(),
    }
}
