use futures::{StreamExt, channel::mpsc::UnboundedReceiver, future::join_all};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use vsp_client_core::{
    ClientEvent, CommandFailure, CompletionPumpHandle, DriverStatus, ExtensionEvent,
    ExtensionState, GatewayError, PumpSummary, ReplaceIfNewer, Transition, TransportResult,
    VspController, notice_channel,
};
use vsp_driver_sim::{
    ERROR_EXTENSION_NOT_FOUND, ERROR_REQUEST_CANCELED, SimDriver, SimExtensionManager, SimScript,
    SimUserClient,
};
use vsp_proto::{
    DEFAULT_EXTENSION_ID, DriverStatusError, PortLinkRecord, PortParameters, TraceFlags,
};

type Controller = VspController<Arc<SimExtensionManager>, SimUserClient>;

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    controller: Arc<Controller>,
    driver: Arc<SimDriver>,
    events: UnboundedReceiver<ClientEvent>,
    pump: CompletionPumpHandle,
    task: JoinHandle<TransportResult<PumpSummary>>,
}

impl Rig {
    fn new(script: SimScript) -> Self {
        Self::with(script, |_| {})
    }

    fn with(script: SimScript, configure: impl FnOnce(&mut Controller)) -> Self {
        let (tx, rx) = notice_channel();
        let manager = Arc::new(SimExtensionManager::new(tx.clone(), script));
        let driver = SimDriver::new(tx.clone());
        let mut controller = VspController::new(manager, driver.client());
        configure(&mut controller);
        let controller = Arc::new(controller);
        controller.register_callback(tx);
        let (_id, events) = controller.observers().subscribe_channel();
        let (pump, task) = controller.start_pump(rx);
        Self {
            controller,
            driver,
            events,
            pump,
            task: tokio::spawn(task),
        }
    }

    async fn settle(&mut self) -> ExtensionState {
        let wait = async {
            while let Some(event) = self.events.next().await {
                if let ClientEvent::Lifecycle(step) = event {
                    if step.to.is_settled() {
                        return step.to;
                    }
                }
            }
            ExtensionState::Unknown
        };
        timeout(WAIT, wait).await.expect("lifecycle settled")
    }

    /// Collect lifecycle steps up to and including the first `last` event.
    async fn steps_until(&mut self, last: ExtensionEvent) -> Vec<Transition> {
        let wait = async {
            let mut steps = Vec::new();
            while let Some(event) = self.events.next().await {
                if let ClientEvent::Lifecycle(step) = event {
                    steps.push(step);
                    if step.event == last {
                        break;
                    }
                }
            }
            steps
        };
        timeout(WAIT, wait).await.expect("lifecycle steps")
    }

    async fn status(&mut self, wanted: DriverStatus) {
        let wait = async {
            while let Some(event) = self.events.next().await {
                if matches!(&event, ClientEvent::Status(notice) if notice.status == wanted) {
                    return;
                }
            }
        };
        timeout(WAIT, wait).await.expect("status notice");
    }

    async fn finish(self) -> PumpSummary {
        self.pump.shutdown().unwrap();
        self.task.await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn activate_connect_and_link() {
    let mut rig = Rig::new(SimScript::default().with_approval());
    rig.controller.activate().unwrap();
    assert_eq!(rig.settle().await, ExtensionState::Activated);

    rig.driver.publish();
    rig.status(DriverStatus::Connected).await;
    assert!(rig.controller.is_driver_connected());

    let a = rig.controller.create_port(PortParameters::default()).unwrap().await.unwrap();
    let b = rig.controller.create_port(PortParameters::default()).unwrap().await.unwrap();
    let (a, b) = (a.parameter.link.source, b.parameter.link.source);

    rig.controller.link_ports(a, b).unwrap().await.unwrap();
    let links = rig.controller.get_link_list().unwrap().await.unwrap();
    assert_eq!(
        links.link_records().collect::<Vec<_>>(),
        vec![PortLinkRecord::new(1, a, b)]
    );

    let err = rig.controller.link_ports(a, a).unwrap().await.unwrap_err();
    assert_eq!(err, CommandFailure::Driver(DriverStatusError::SelfLink));
    assert_eq!(err.to_string(), "ports cannot be linked to themselves");
    let err = rig.controller.remove_port(a).unwrap().await.unwrap_err();
    assert_eq!(err, CommandFailure::Driver(DriverStatusError::PortInUse));

    rig.controller
        .enable_trace(b, TraceFlags::RX | TraceFlags::TX)
        .unwrap()
        .await
        .unwrap();
    let ports = rig.controller.get_port_list().unwrap().await.unwrap();
    assert_eq!(ports.ports[1].trace_flags(), TraceFlags::RX | TraceFlags::TX);

    rig.driver.terminate();
    rig.status(DriverStatus::Disconnected).await;
    assert!(!rig.controller.is_driver_connected());

    let summary = rig.finish().await;
    assert_eq!(summary.attaches, 1);
    assert_eq!(summary.removals, 1);
}

#[tokio::test]
async fn uninstall_with_reboot() {
    let mut rig = Rig::new(SimScript::default().with_reboot().with_installed("1.0"));
    rig.controller.query_installed().unwrap();
    assert_eq!(rig.settle().await, ExtensionState::Activated);

    rig.controller.deactivate().unwrap();
    rig.status(DriverStatus::WillCompleteAfterReboot).await;
    assert_eq!(rig.controller.extension_state(), ExtensionState::Removal);
    assert_eq!(rig.controller.gateway().pending(), None);
    rig.finish().await;
}

#[tokio::test]
async fn refused_activation_fails_once_and_retry_succeeds() {
    let mut rig = Rig::new(SimScript {
        identifier: "com.example.other".to_string(),
        ..SimScript::default()
    });
    assert!(matches!(
        rig.controller.activate(),
        Err(GatewayError::Rejected {
            code: ERROR_EXTENSION_NOT_FOUND,
            ..
        })
    ));
    assert_eq!(rig.controller.gateway().pending(), None);

    // The properties answer queues behind anything the refused request left.
    rig.controller.query_installed().unwrap();
    let steps = rig.steps_until(ExtensionEvent::DiscoveredUnloaded).await;
    let failures = steps
        .iter()
        .filter(|step| step.event == ExtensionEvent::ActivationFailed)
        .count();
    assert_eq!(failures, 1);
    assert_eq!(rig.controller.extension_state(), ExtensionState::ActivationError);

    rig.controller
        .gateway()
        .manager()
        .update_script(|script| script.identifier = DEFAULT_EXTENSION_ID.to_string());
    assert_eq!(
        rig.controller.activate().unwrap().to,
        ExtensionState::Activating
    );
    assert_eq!(rig.settle().await, ExtensionState::Activated);
    assert_eq!(rig.controller.extension_state(), ExtensionState::Activated);
    rig.finish().await;
}

#[tokio::test]
async fn downgrade_is_canceled() {
    let mut rig = Rig::with(
        SimScript::default()
            .with_installed("2.0")
            .with_bundle_version("1.5"),
        |controller| controller.set_replacement_policy(ReplaceIfNewer),
    );
    rig.controller.activate().unwrap();

    let failure = timeout(WAIT, async {
        while let Some(event) = rig.events.next().await {
            if let ClientEvent::Status(notice) = event {
                if notice.status == DriverStatus::Failure {
                    return Some(notice);
                }
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("failure notice");
    assert_eq!(failure.code, ERROR_REQUEST_CANCELED);
    assert_eq!(failure.domain, "OSSystemExtensionErrorDomain");
    assert_eq!(rig.settle().await, ExtensionState::ActivationError);
    rig.finish().await;
}

#[tokio::test]
async fn interleaved_completions_resolve_by_token() {
    let mut rig = Rig::new(SimScript::default());
    rig.driver.publish();
    rig.status(DriverStatus::Connected).await;
    rig.driver.set_latency(Duration::from_millis(10));

    let pending = vec![
        rig.controller.get_status().unwrap(),
        rig.controller.get_port_list().unwrap(),
        rig.controller.get_link_list().unwrap(),
    ];
    let commands: Vec<_> = pending.iter().map(|p| p.command()).collect();
    assert_eq!(rig.controller.dispatcher().in_flight(), 3);

    let results = timeout(WAIT, join_all(pending)).await.unwrap();
    for (command, result) in commands.into_iter().zip(results) {
        assert_eq!(result.unwrap().command, command);
    }
    assert_eq!(rig.controller.dispatcher().in_flight(), 0);

    rig.driver.set_latency(Duration::from_secs(60));
    let stuck = rig.controller.get_status().unwrap();
    rig.driver.terminate();
    assert_eq!(
        timeout(WAIT, stuck).await.unwrap().unwrap_err(),
        CommandFailure::Disconnected
    );
    rig.finish().await;
}
