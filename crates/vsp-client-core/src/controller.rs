use crate::{
    connection::ConnectionManager,
    dispatch::{CommandDispatcher, CommandFailure, DispatchResult, PendingCommand},
    gateway::{ActivationGateway, ExtensionManager, GatewayError, ReplacementPolicy},
    lifecycle::{DEFAULT_HISTORY_LIMIT, ExtensionState, LifecycleMachine, Transition},
    observer::{ClientEvent, ObserverRegistry, SubscriptionId},
    pump::{CompletionPumpHandle, CompletionPumpTask, NoticeSink, start_completion_pump},
    transport::{
        ConnectionHandle, DriverNotice, NoticeSender, NoticeSource, TransportResult, UserClient,
    },
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vsp_proto::{CheckFlags, DEFAULT_EXTENSION_ID, PortParameters, TraceFlags};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VspControllerConfig {
    pub extension_id: String,
    pub history_limit: usize,
}

impl Default for VspControllerConfig {
    fn default() -> Self {
        Self {
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Composition root: one extension gateway, one connection, one dispatcher
/// and the observers they all report to.
pub struct VspController<M, U> {
    gateway: ActivationGateway<M>,
    connection: Arc<ConnectionManager>,
    dispatcher: CommandDispatcher<U>,
    observers: Arc<ObserverRegistry>,
}

impl<M, U> VspController<M, U>
where
    M: ExtensionManager,
    U: UserClient,
{
    pub fn new(manager: M, client: U) -> Self {
        Self::with_config(manager, client, VspControllerConfig::default())
    }

    pub fn with_config(manager: M, client: U, config: VspControllerConfig) -> Self {
        let observers = Arc::new(ObserverRegistry::new());
        let connection = Arc::new(ConnectionManager::new(observers.clone()));
        let gateway = ActivationGateway::with_machine(
            manager,
            config.extension_id,
            observers.clone(),
            LifecycleMachine::with_history_limit(config.history_limit),
        );
        let dispatcher = CommandDispatcher::new(client, connection.clone(), observers.clone());
        Self {
            gateway,
            connection,
            dispatcher,
            observers,
        }
    }

    pub fn set_replacement_policy<P>(&mut self, policy: P)
    where
        P: ReplacementPolicy + 'static,
    {
        self.gateway.set_policy(policy);
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn gateway(&self) -> &ActivationGateway<M> {
        &self.gateway
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<U> {
        &self.dispatcher
    }

    pub fn activate(&self) -> Result<Transition, GatewayError> {
        self.gateway.activate()
    }

    pub fn deactivate(&self) -> Result<Transition, GatewayError> {
        self.gateway.deactivate()
    }

    pub fn query_installed(&self) -> Result<(), GatewayError> {
        self.gateway.query_installed_properties()
    }

    pub fn extension_state(&self) -> ExtensionState {
        self.gateway.state()
    }

    /// Look for a published driver and open it. Returns `false` when none is published yet.
    pub fn connect_driver(&self) -> TransportResult<bool> {
        let Some(attachment) = self.dispatcher.client().scan()? else {
            debug!("no driver service published");
            return Ok(false);
        };
        let handle = attachment.handle;
        if let Some(previous) = self.connection.on_device_attached(attachment) {
            info!(old = %previous.handle, new = %handle, "driver connection replaced");
            self.dispatcher.fail_all(CommandFailure::Disconnected);
            self.close_quietly(previous.handle);
        }
        Ok(true)
    }

    /// Drop the live connection, failing anything still outstanding on it.
    pub fn disconnect_driver(&self) -> TransportResult<bool> {
        let Some(removed) = self.connection.on_device_removed() else {
            return Ok(false);
        };
        self.dispatcher.fail_all(CommandFailure::Disconnected);
        self.dispatcher.client().close(removed.handle)?;
        Ok(true)
    }

    pub fn is_driver_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn register_callback(&self, callback: NoticeSender) -> Option<NoticeSender> {
        self.dispatcher.register_callback(callback)
    }

    pub fn get_status(&self) -> DispatchResult<PendingCommand> {
        self.dispatcher.get_status()
    }

    pub fn create_port(&self, params: PortParameters) -> DispatchResult<PendingCommand> {
        self.dispatcher.create_port(params)
    }

    pub fn remove_port(&self, id: u8) -> DispatchResult<PendingCommand> {
        self.dispatcher.remove_port(id)
    }

    pub fn link_ports(&self, source: u8, target: u8) -> DispatchResult<PendingCommand> {
        self.dispatcher.link_ports(source, target)
    }

    pub fn unlink_ports(&self, source: u8, target: u8) -> DispatchResult<PendingCommand> {
        self.dispatcher.unlink_ports(source, target)
    }

    pub fn get_port_list(&self) -> DispatchResult<PendingCommand> {
        self.dispatcher.get_port_list()
    }

    pub fn get_link_list(&self) -> DispatchResult<PendingCommand> {
        self.dispatcher.get_link_list()
    }

    pub fn enable_checks(&self, port: u8, checks: CheckFlags) -> DispatchResult<PendingCommand> {
        self.dispatcher.enable_checks(port, checks)
    }

    pub fn enable_trace(&self, port: u8, traces: TraceFlags) -> DispatchResult<PendingCommand> {
        self.dispatcher.enable_trace(port, traces)
    }

    pub fn enable_checks_and_trace(
        &self,
        port: u8,
        checks: CheckFlags,
        traces: TraceFlags,
    ) -> DispatchResult<PendingCommand> {
        self.dispatcher.enable_checks_and_trace(port, checks, traces)
    }

    fn close_quietly(&self, handle: ConnectionHandle) {
        if let Err(err) = self.dispatcher.client().close(handle) {
            warn!(%handle, error = %err, "closing stale driver connection failed");
        }
    }
}

impl<M, U> VspController<M, U>
where
    M: ExtensionManager + 'static,
    U: UserClient + 'static,
{
    /// Route every notice from `source` back into this controller.
    pub fn start_pump<S>(self: &Arc<Self>, source: S) -> (CompletionPumpHandle, CompletionPumpTask)
    where
        S: NoticeSource + 'static,
    {
        start_completion_pump(source, self.clone())
    }
}

impl<M, U> NoticeSink for VspController<M, U>
where
    M: ExtensionManager,
    U: UserClient,
{
    fn apply(&self, notice: DriverNotice) {
        match notice {
            DriverNotice::Completion(completion) => {
                self.dispatcher.complete(completion);
            }
            DriverNotice::Attached(attachment) => {
                let handle = attachment.handle;
                if let Some(previous) = self.connection.on_device_attached(attachment) {
                    info!(old = %previous.handle, new = %handle, "driver re-published");
                    self.dispatcher.fail_all(CommandFailure::Disconnected);
                    self.close_quietly(previous.handle);
                }
            }
            DriverNotice::Removed => {
                if let Some(removed) = self.connection.on_device_removed() {
                    self.dispatcher.fail_all(CommandFailure::Disconnected);
                    self.close_quietly(removed.handle);
                }
            }
            DriverNotice::Activation(callback) => {
                self.gateway.handle(callback);
            }
        }
    }
}
