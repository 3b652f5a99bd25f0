use std::{
    collections::BTreeMap,
    num::NonZeroU64,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, info, warn};
use vsp_client_core::{
    Completion, ConnectionHandle, CorrelationToken, DeviceAttachment, DriverNotice, NoticeSender,
    TransportError, TransportErrorKind, TransportResult, UserClient,
};
use vsp_proto::{
    CheckFlags, ControlCommand, ControllerData, MAX_PORT_LINKS, MAX_SERIAL_PORTS, PortLinkRecord,
    PortListItem, PortParameters, STATUS_CODE_INVALID_PARAMETER, STATUS_CODE_MAX_PORTS,
    STATUS_CODE_PORT_IN_USE, STATUS_CODE_SELF_LINK, STATUS_FLAG_PORT_ERROR, Status, TraceFlags,
    USER_CLIENT_CLASS,
};

/// One virtual serial port held by the simulated driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimPort {
    pub id: u8,
    pub name: String,
    pub parameters: PortParameters,
    pub trace_flags: TraceFlags,
    pub check_flags: CheckFlags,
}

impl SimPort {
    fn list_item(&self) -> Option<PortListItem> {
        let flags = self.trace_flags.bits() | self.check_flags.bits();
        PortListItem::new(self.id, flags, &self.name).ok()
    }
}

#[derive(Default)]
struct DriverState {
    published: Option<ConnectionHandle>,
    next_handle: u64,
    ports: BTreeMap<u8, SimPort>,
    links: Vec<PortLinkRecord>,
    latency: Duration,
    fail_next: Option<u32>,
    reject_next: bool,
    closed: Vec<ConnectionHandle>,
}

/// In-memory virtual serial port driver.
pub struct SimDriver {
    notices: NoticeSender,
    inner: Mutex<DriverState>,
}

impl SimDriver {
    /// `notices` receives attach and detach announcements.
    pub fn new(notices: NoticeSender) -> Arc<Self> {
        Arc::new(Self {
            notices,
            inner: Mutex::new(DriverState::default()),
        })
    }

    pub fn client(self: &Arc<Self>) -> SimUserClient {
        SimUserClient {
            driver: self.clone(),
        }
    }

    /// Register the user-client service and announce it.
    pub fn publish(&self) -> DeviceAttachment {
        let attachment = {
            let mut state = self.lock();
            if let Some(handle) = state.published {
                attachment(handle)
            } else {
                state.next_handle += 1;
                let raw = NonZeroU64::MIN.saturating_add(0x1000 + state.next_handle);
                let handle = ConnectionHandle::from(raw);
                state.published = Some(handle);
                attachment(handle)
            }
        };
        info!(handle = %attachment.handle, "simulated driver published");
        if self.notices.send(DriverNotice::Attached(attachment.clone())).is_err() {
            debug!("nobody listening for attach");
        }
        attachment
    }

    /// Stop the driver. Ports and links go away with it.
    pub fn terminate(&self) {
        let handle = {
            let mut state = self.lock();
            state.ports.clear();
            state.links.clear();
            state.published.take()
        };
        if let Some(handle) = handle {
            info!(%handle, "simulated driver terminated");
            if self.notices.send(DriverNotice::Removed).is_err() {
                debug!("nobody listening for detach");
            }
        }
    }

    pub fn is_published(&self) -> bool {
        self.lock().published.is_some()
    }

    /// Delay every completion by `latency`. Needs a running tokio runtime to take effect.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Complete the next command with IOKit result `result` instead of running it.
    pub fn fail_next(&self, result: u32) {
        self.lock().fail_next = Some(result);
    }

    /// Refuse the next submission outright.
    pub fn reject_next(&self) {
        self.lock().reject_next = true;
    }

    pub fn ports(&self) -> Vec<SimPort> {
        self.lock().ports.values().cloned().collect()
    }

    pub fn links(&self) -> Vec<PortLinkRecord> {
        self.lock().links.clone()
    }

    pub fn closed_handles(&self) -> Vec<ConnectionHandle> {
        self.lock().closed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client end of the simulated driver's user client.
#[derive(Clone)]
pub struct SimUserClient {
    driver: Arc<SimDriver>,
}

impl SimUserClient {
    pub fn driver(&self) -> &Arc<SimDriver> {
        &self.driver
    }
}

impl UserClient for SimUserClient {
    fn scan(&self) -> TransportResult<Option<DeviceAttachment>> {
        Ok(self.driver.lock().published.map(attachment))
    }

    fn close(&self, handle: ConnectionHandle) -> TransportResult<()> {
        self.driver.lock().closed.push(handle);
        Ok(())
    }

    fn submit(
        &self,
        handle: ConnectionHandle,
        token: CorrelationToken,
        request: &ControllerData,
        callback: &NoticeSender,
    ) -> TransportResult<()> {
        let (completion, latency) = {
            let mut state = self.driver.lock();
            if state.published != Some(handle) {
                return Err(TransportError::with_message(
                    TransportErrorKind::NotConnected,
                    format!("no driver behind {handle}"),
                ));
            }
            if std::mem::take(&mut state.reject_next) {
                return Err(TransportError::with_message(
                    TransportErrorKind::Rejected,
                    "submission refused",
                ));
            }
            let completion = match state.fail_next.take() {
                Some(result) => Completion::failure(token, result),
                None => Completion::success(token, &execute(&mut state, request)),
            };
            (completion, state.latency)
        };

        if latency.is_zero() {
            return callback.complete(completion);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let callback = callback.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(latency).await;
                    if let Err(err) = callback.complete(completion) {
                        debug!(error = %err, "completion dropped");
                    }
                });
                Ok(())
            }
            Err(_) => callback.complete(completion),
        }
    }
}

fn attachment(handle: ConnectionHandle) -> DeviceAttachment {
    DeviceAttachment {
        handle,
        name: USER_CLIENT_CLASS.to_string(),
        path: format!("IOService:/IOResources/{USER_CLIENT_CLASS}@{:x}", handle.get()),
    }
}

/// Run `request` against the driver model and build the response. Every
/// response carries the current port and link lists.
fn execute(state: &mut DriverState, request: &ControllerData) -> ControllerData {
    let mut response = ControllerData::response_to(request);
    let link = request.parameter.link;
    let outcome = match request.command {
        ControlCommand::PingPong
        | ControlCommand::GetStatus
        | ControlCommand::GetPortList
        | ControlCommand::GetLinkList
        | ControlCommand::Shutdown => Ok(()),
        ControlCommand::CreatePort => create_port(state, request, &mut response),
        ControlCommand::RemovePort => remove_port(state, link.source),
        ControlCommand::LinkPorts => link_ports(state, link.source, link.target),
        ControlCommand::UnlinkPorts => unlink_ports(state, link.source, link.target),
        ControlCommand::EnableChecks => with_port(state, link.source, |port| {
            port.check_flags = request.check_flags;
            if !request.trace_flags.is_empty() {
                port.trace_flags = request.trace_flags;
            }
        }),
        ControlCommand::EnableTrace => with_port(state, link.source, |port| {
            port.trace_flags = request.trace_flags;
        }),
    };
    if let Err(code) = outcome {
        warn!(
            command = %request.command,
            code = format_args!("0x{code:08x}"),
            "driver rejected command"
        );
        response.status = Status::new(code, STATUS_FLAG_PORT_ERROR);
    }
    fill_lists(state, &mut response);
    response
}

fn create_port(
    state: &mut DriverState,
    request: &ControllerData,
    response: &mut ControllerData,
) -> Result<(), u32> {
    let Some(parameters) = request.port_parameters else {
        return Err(STATUS_CODE_INVALID_PARAMETER);
    };
    if state.ports.len() >= MAX_SERIAL_PORTS {
        return Err(STATUS_CODE_MAX_PORTS);
    }
    let id = (1..=MAX_SERIAL_PORTS as u8)
        .find(|id| !state.ports.contains_key(id))
        .ok_or(STATUS_CODE_MAX_PORTS)?;
    let port = SimPort {
        id,
        name: format!("tty.vsp{id}"),
        parameters,
        trace_flags: TraceFlags::empty(),
        check_flags: CheckFlags::empty(),
    };
    debug!(id, name = %port.name, baud = parameters.baud_rate, "port created");
    state.ports.insert(id, port);
    response.parameter.link.source = id;
    response.parameter.link.target = id;
    Ok(())
}

fn remove_port(state: &mut DriverState, id: u8) -> Result<(), u32> {
    if !state.ports.contains_key(&id) {
        return Err(STATUS_CODE_INVALID_PARAMETER);
    }
    if state.links.iter().any(|link| link.involves(id)) {
        return Err(STATUS_CODE_PORT_IN_USE);
    }
    state.ports.remove(&id);
    Ok(())
}

fn link_ports(state: &mut DriverState, source: u8, target: u8) -> Result<(), u32> {
    if source == target {
        return Err(STATUS_CODE_SELF_LINK);
    }
    if !state.ports.contains_key(&source) || !state.ports.contains_key(&target) {
        return Err(STATUS_CODE_INVALID_PARAMETER);
    }
    if state
        .links
        .iter()
        .any(|link| link.involves(source) || link.involves(target))
    {
        return Err(STATUS_CODE_PORT_IN_USE);
    }
    if state.links.len() >= MAX_PORT_LINKS {
        return Err(STATUS_CODE_MAX_PORTS);
    }
    let link_id = (1..=MAX_PORT_LINKS as u8)
        .find(|id| state.links.iter().all(|link| link.link_id != *id))
        .ok_or(STATUS_CODE_MAX_PORTS)?;
    state
        .links
        .push(PortLinkRecord::new(link_id, source, target));
    Ok(())
}

fn unlink_ports(state: &mut DriverState, source: u8, target: u8) -> Result<(), u32> {
    let position = state.links.iter().position(|link| {
        (link.source == source && link.target == target)
            || (link.source == target && link.target == source)
    });
    match position {
        Some(index) => {
            state.links.remove(index);
            Ok(())
        }
        None => Err(STATUS_CODE_INVALID_PARAMETER),
    }
}

fn with_port<F>(state: &mut DriverState, id: u8, f: F) -> Result<(), u32>
where
    F: FnOnce(&mut SimPort),
{
    let port = state
        .ports
        .get_mut(&id)
        .ok_or(STATUS_CODE_INVALID_PARAMETER)?;
    f(port);
    Ok(())
}

fn fill_lists(state: &DriverState, response: &mut ControllerData) {
    response.ports.clear();
    for item in state.ports.values().filter_map(SimPort::list_item) {
        if response.ports.push(item).is_err() {
            break;
        }
    }
    response.links.clear();
    for link in &state.links {
        if response.links.push(link.pack()).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsp_client_core::{NoticeReceiver, notice_channel};
    use vsp_proto::DriverStatusError;

    fn run(
        client: &SimUserClient,
        handle: ConnectionHandle,
        request: ControllerData,
    ) -> ControllerData {
        let (tx, mut done) = notice_channel();
        let token = CorrelationToken::new(1).unwrap();
        client.submit(handle, token, &request, &tx).unwrap();
        match done.try_next() {
            Ok(Some(DriverNotice::Completion(c))) => {
                assert_eq!(c.result, 0);
                ControllerData::try_from(c.payload.as_slice()).unwrap()
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    fn setup() -> (Arc<SimDriver>, SimUserClient, NoticeReceiver, ConnectionHandle) {
        let (tx, mut rx) = notice_channel();
        let driver = SimDriver::new(tx);
        let client = driver.client();
        let handle = driver.publish().handle;
        assert!(matches!(rx.try_next(), Ok(Some(DriverNotice::Attached(_)))));
        (driver, client, rx, handle)
    }

    fn create(client: &SimUserClient, handle: ConnectionHandle) -> u8 {
        let request = ControllerData::request(ControlCommand::CreatePort)
            .with_link(1, 1)
            .with_port_parameters(PortParameters::default());
        let response = run(client, handle, request);
        assert_eq!(response.status_error(), None);
        response.parameter.link.source
    }

    fn link(command: ControlCommand, source: u8, target: u8) -> ControllerData {
        ControllerData::request(command).with_link(source, target)
    }

    #[test]
    fn ports_and_links() {
        let (driver, client, _rx, handle) = setup();
        let a = create(&client, handle);
        let b = create(&client, handle);
        assert_eq!((a, b), (1, 2));

        let linked = run(&client, handle, link(ControlCommand::LinkPorts, a, b));
        assert_eq!(linked.status_error(), None);
        assert_eq!(linked.ports.len(), 2);
        assert_eq!(
            linked.link_records().collect::<Vec<_>>(),
            vec![PortLinkRecord::new(1, a, b)]
        );

        let unlinked = run(&client, handle, link(ControlCommand::UnlinkPorts, b, a));
        assert_eq!(unlinked.status_error(), None);
        assert!(unlinked.links.is_empty());
        let removed = run(&client, handle, link(ControlCommand::RemovePort, a, a));
        assert_eq!(removed.ports.len(), 1);
        assert_eq!(driver.ports()[0].id, b);
    }

    #[test]
    fn invalid_requests() {
        let (_driver, client, _rx, handle) = setup();
        let a = create(&client, handle);

        let cases = [
            (link(ControlCommand::LinkPorts, a, a), DriverStatusError::SelfLink),
            (link(ControlCommand::LinkPorts, a, 9), DriverStatusError::InvalidParameter),
            (link(ControlCommand::UnlinkPorts, a, 9), DriverStatusError::InvalidParameter),
            (link(ControlCommand::RemovePort, 7, 7), DriverStatusError::InvalidParameter),
            (link(ControlCommand::EnableTrace, 7, 7), DriverStatusError::InvalidParameter),
            (link(ControlCommand::CreatePort, 1, 1), DriverStatusError::InvalidParameter),
        ];
        for (request, expected) in cases {
            let command = request.command;
            let response = run(&client, handle, request);
            assert_eq!(response.status_error(), Some(expected), "{command}");
            assert_eq!(response.ports.len(), 1);
        }
    }

    #[test]
    fn port_in_use_and_max_ports() {
        let (_driver, client, _rx, handle) = setup();
        let a = create(&client, handle);
        let b = create(&client, handle);
        let c = create(&client, handle);
        run(&client, handle, link(ControlCommand::LinkPorts, a, b));

        let busy = run(&client, handle, link(ControlCommand::LinkPorts, b, c));
        assert_eq!(busy.status_error(), Some(DriverStatusError::PortInUse));
        let removing = run(&client, handle, link(ControlCommand::RemovePort, a, a));
        assert_eq!(removing.status_error(), Some(DriverStatusError::PortInUse));

        for _ in 3..MAX_SERIAL_PORTS {
            create(&client, handle);
        }
        let full = run(
            &client,
            handle,
            link(ControlCommand::CreatePort, 1, 1).with_port_parameters(PortParameters::default()),
        );
        assert_eq!(full.status_error(), Some(DriverStatusError::MaxPortsReached));
        assert_eq!(full.ports.len(), MAX_SERIAL_PORTS);
    }

    #[test]
    fn flags_show_up_in_port_list() {
        let (_driver, client, _rx, handle) = setup();
        let a = create(&client, handle);
        let mut request = link(ControlCommand::EnableChecks, a, a);
        request.check_flags = CheckFlags::BAUD | CheckFlags::PARITY;
        request.trace_flags = TraceFlags::RX;
        let response = run(&client, handle, request);
        let item = &response.ports[0];
        assert_eq!(item.check_flags(), CheckFlags::BAUD | CheckFlags::PARITY);
        assert_eq!(item.trace_flags(), TraceFlags::RX);
    }

    #[test]
    fn submit_requires_published_handle() {
        let (driver, client, _rx, handle) = setup();
        driver.terminate();
        let (tx, _done) = notice_channel();
        let err = client
            .submit(
                handle,
                CorrelationToken::new(1).unwrap(),
                &ControllerData::request(ControlCommand::GetStatus),
                &tx,
            )
            .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NotConnected);
        assert!(client.scan().unwrap().is_none());
    }

    #[test]
    fn injected_failure_completes_with_result() {
        let (driver, client, _rx, handle) = setup();
        driver.fail_next(0xe000_02bc);
        let (tx, mut done) = notice_channel();
        let token = CorrelationToken::new(5).unwrap();
        client
            .submit(handle, token, &ControllerData::request(ControlCommand::GetStatus), &tx)
            .unwrap();
        match done.try_next() {
            Ok(Some(DriverNotice::Completion(c))) => {
                assert_eq!(c.token, token);
                assert_eq!(c.result, 0xe000_02bc);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
