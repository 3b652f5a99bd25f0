use futures::StreamExt;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use vsp_client_core::{
    ActivationCallback, ActivationResult, ClientEvent, CommandFailure, CommandState, Completion,
    ConnectionHandle, CorrelationToken, DeviceAttachment, DriverNotice, DriverStatus,
    ExtensionManager, ExtensionState, GatewayError, NoticeReceiver, NoticeSender, NoticeSink,
    TransportResult, UserClient, VspController, notice_channel,
};
use vsp_proto::{ControlCommand, ControllerData, PortListItem};

struct EchoDriver {
    silent: AtomicBool,
    closed: AtomicUsize,
}

impl EchoDriver {
    fn new() -> Self {
        Self {
            silent: AtomicBool::new(false),
            closed: AtomicUsize::new(0),
        }
    }
}

impl UserClient for EchoDriver {
    fn scan(&self) -> TransportResult<Option<DeviceAttachment>> {
        Ok(Some(DeviceAttachment {
            handle: ConnectionHandle::new(0x10).unwrap(),
            name: "VSPDriver".into(),
            path: "IOService:/IOResources/VSPDriver".into(),
        }))
    }

    fn close(&self, _handle: ConnectionHandle) -> TransportResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn submit(
        &self,
        _handle: ConnectionHandle,
        token: CorrelationToken,
        request: &ControllerData,
        callback: &NoticeSender,
    ) -> TransportResult<()> {
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut response = ControllerData::response_to(request);
        if request.command == ControlCommand::GetPortList {
            response
                .ports
                .push(PortListItem::new(1, 0, "serial-1").unwrap())
                .unwrap();
        }
        callback.complete(Completion::success(token, &response))
    }
}

struct ApprovingManager {
    callbacks: NoticeSender,
    submitted: Mutex<Vec<String>>,
}

impl ExtensionManager for ApprovingManager {
    fn submit_activation(&self, identifier: &str) -> Result<(), GatewayError> {
        self.submitted.lock().unwrap().push(identifier.to_string());
        let _ = self
            .callbacks
            .activation(ActivationCallback::NeedsUserApproval);
        let _ = self
            .callbacks
            .activation(ActivationCallback::Finished(ActivationResult::Completed));
        Ok(())
    }

    fn submit_deactivation(&self, _identifier: &str) -> Result<(), GatewayError> {
        let _ = self
            .callbacks
            .activation(ActivationCallback::Finished(ActivationResult::Completed));
        Ok(())
    }

    fn submit_properties(&self, _identifier: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

type Controller = VspController<Arc<ApprovingManager>, Arc<EchoDriver>>;

fn controller() -> (Arc<Controller>, Arc<EchoDriver>, NoticeReceiver) {
    let (tx, rx) = notice_channel();
    let manager = Arc::new(ApprovingManager {
        callbacks: tx.clone(),
        submitted: Mutex::new(Vec::new()),
    });
    let driver = Arc::new(EchoDriver::new());
    let controller = Arc::new(VspController::new(manager, driver.clone()));
    controller.register_callback(tx);
    (controller, driver, rx)
}

#[tokio::test]
async fn activation_walks_through_approval() {
    let (controller, _driver, rx) = controller();
    let (_id, mut events) = controller.observers().subscribe_channel();
    let (handle, task) = controller.start_pump(rx);
    let pump = tokio::spawn(task);

    let started = controller.activate().unwrap();
    assert_eq!(started.to, ExtensionState::Activating);

    let mut states = Vec::new();
    let mut statuses = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            ClientEvent::Lifecycle(t) => {
                states.push(t.to);
                if t.to == ExtensionState::Activated {
                    break;
                }
            }
            ClientEvent::Status(notice) => statuses.push(notice.status),
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            ExtensionState::Activating,
            ExtensionState::NeedsApproval,
            ExtensionState::Activated
        ]
    );
    assert!(statuses.contains(&DriverStatus::RequiresUserApproval));
    assert_eq!(controller.gateway().pending(), None);
    assert_eq!(
        *controller.gateway().manager().submitted.lock().unwrap(),
        vec![vsp_proto::DEFAULT_EXTENSION_ID.to_string()]
    );

    handle.shutdown().unwrap();
    let summary = pump.await.unwrap().unwrap();
    assert_eq!(summary.activation_callbacks, 2);
}

#[tokio::test]
async fn commands_complete_through_the_pump() {
    let (controller, _driver, rx) = controller();
    let (handle, task) = controller.start_pump(rx);
    let pump = tokio::spawn(task);

    assert!(controller.connect_driver().unwrap());
    let ports = controller.get_port_list().unwrap().await.unwrap();
    assert_eq!(ports.ports.len(), 1);
    assert_eq!(ports.ports[0].name.as_str(), "serial-1");

    let pending = controller.link_ports(1, 2).unwrap();
    let token = pending.token();
    let linked = pending.await.unwrap();
    assert_eq!(linked.parameter.link.target, 2);
    assert_eq!(
        controller.dispatcher().command_state(token),
        CommandState::Success
    );

    handle.shutdown().unwrap();
    let summary = pump.await.unwrap().unwrap();
    assert_eq!(summary.completions, 2);
}

#[tokio::test]
async fn removal_fails_outstanding_commands() {
    let (controller, driver, rx) = controller();
    let (handle, task) = controller.start_pump(rx);
    let pump = tokio::spawn(task);

    controller.connect_driver().unwrap();
    driver.silent.store(true, Ordering::SeqCst);
    let pending = controller.get_status().unwrap();
    assert_eq!(controller.dispatcher().in_flight(), 1);

    controller.apply(DriverNotice::Removed);
    assert_eq!(pending.await.unwrap_err(), CommandFailure::Disconnected);
    assert!(!controller.is_driver_connected());
    assert_eq!(driver.closed.load(Ordering::SeqCst), 1);

    handle.shutdown().unwrap();
    pump.await.unwrap().unwrap();
}
