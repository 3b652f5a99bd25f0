use crate::{completion::CorrelationToken, gateway::ActivationCallback};
use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::StreamExt;
use std::{fmt, num::NonZeroU64, sync::Arc};
use vsp_proto::ControllerData;

/// Transport error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    NotConnected,
    Disconnected,
    Rejected,
    Protocol,
    Timeout,
    Other,
}

/// Errors surfaced by user-client transports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: Option<String>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = core::result::Result<T, TransportError>;

/// Opaque handle of an open user-client channel. Zero is not a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(NonZeroU64);

impl ConnectionHandle {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for ConnectionHandle {
    fn from(raw: NonZeroU64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A driver instance announcing its published user-client service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAttachment {
    pub handle: ConnectionHandle,
    pub name: String,
    pub path: String,
}

/// Result code of a successful completion.
pub const COMPLETION_SUCCESS: u32 = 0;

/// Asynchronous completion of one submitted command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub token: CorrelationToken,
    pub result: u32,
    pub payload: Vec<u8>,
}

impl Completion {
    pub fn success(token: CorrelationToken, response: &ControllerData) -> Self {
        Self {
            token,
            result: COMPLETION_SUCCESS,
            payload: response.encode().to_vec(),
        }
    }

    pub fn failure(token: CorrelationToken, result: u32) -> Self {
        Self {
            token,
            result,
            payload: Vec::new(),
        }
    }
}

/// Everything the driver side reports back to the client, in delivery order.
#[derive(Clone, Debug)]
pub enum DriverNotice {
    Completion(Completion),
    Attached(DeviceAttachment),
    Removed,
    Activation(ActivationCallback),
}

/// Cloneable sending half of the notice channel. Driver-side code may use it
/// from any thread.
#[derive(Clone, Debug)]
pub struct NoticeSender {
    tx: mpsc::UnboundedSender<DriverNotice>,
}

pub type NoticeReceiver = mpsc::UnboundedReceiver<DriverNotice>;

pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    let (tx, rx) = mpsc::unbounded();
    (NoticeSender { tx }, rx)
}

impl NoticeSender {
    pub fn send(&self, notice: DriverNotice) -> TransportResult<()> {
        self.tx
            .unbounded_send(notice)
            .map_err(|_| disconnected_err())
    }

    pub fn complete(&self, completion: Completion) -> TransportResult<()> {
        self.send(DriverNotice::Completion(completion))
    }

    pub fn activation(&self, callback: ActivationCallback) -> TransportResult<()> {
        self.send(DriverNotice::Activation(callback))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Source of driver notices consumed by the completion pump.
#[async_trait]
pub trait NoticeSource: Send {
    /// Wait for the next notice. `None` once the driver side has hung up.
    async fn next_notice(&mut self) -> TransportResult<Option<DriverNotice>>;
}

#[async_trait]
impl NoticeSource for NoticeReceiver {
    async fn next_notice(&mut self) -> TransportResult<Option<DriverNotice>> {
        Ok(self.next().await)
    }
}

/// Abstracts the IPC channel to a running driver instance.
///
/// All calls return immediately; results come back as [`DriverNotice`]s.
pub trait UserClient: Send + Sync {
    /// Look for a published driver service and open it.
    fn scan(&self) -> TransportResult<Option<DeviceAttachment>>;

    fn close(&self, handle: ConnectionHandle) -> TransportResult<()>;

    /// Submit `request`; its completion is delivered through `callback`.
    fn submit(
        &self,
        handle: ConnectionHandle,
        token: CorrelationToken,
        request: &ControllerData,
        callback: &NoticeSender,
    ) -> TransportResult<()>;
}

impl<T> UserClient for Arc<T>
where
    T: UserClient + ?Sized,
{
    fn scan(&self) -> TransportResult<Option<DeviceAttachment>> {
        (**self).scan()
    }

    fn close(&self, handle: ConnectionHandle) -> TransportResult<()> {
        (**self).close(handle)
    }

    fn submit(
        &self,
        handle: ConnectionHandle,
        token: CorrelationToken,
        request: &ControllerData,
        callback: &NoticeSender,
    ) -> TransportResult<()> {
        (**self).submit(handle, token, request, callback)
    }
}

fn disconnected_err() -> TransportError {
    TransportError::with_message(TransportErrorKind::Disconnected, "notice channel closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn handle_rejects_zero() {
        assert!(ConnectionHandle::new(0).is_none());
        assert_eq!(ConnectionHandle::new(0x2a).unwrap().to_string(), "0x2a");
    }

    #[test]
    fn notices_arrive_in_order() {
        let (tx, mut rx) = notice_channel();
        let token = CorrelationToken::new(1).unwrap();
        tx.send(DriverNotice::Removed).unwrap();
        tx.complete(Completion::failure(token, 5)).unwrap();
        drop(tx);

        assert!(matches!(
            block_on(rx.next_notice()),
            Ok(Some(DriverNotice::Removed))
        ));
        match block_on(rx.next_notice()) {
            Ok(Some(DriverNotice::Completion(c))) => assert_eq!(c.result, 5),
            other => panic!("unexpected notice {other:?}"),
        }
        assert!(matches!(block_on(rx.next_notice()), Ok(None)));
    }

    #[test]
    fn send_after_receiver_dropped() {
        let (tx, rx) = notice_channel();
        drop(rx);
        assert!(tx.is_closed());
        let err = tx.send(DriverNotice::Removed).unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Disconnected);
        assert_eq!(err.to_string(), "Disconnected: notice channel closed");
    }
}
