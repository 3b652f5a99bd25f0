use crate::{
    observer::{ClientEvent, ObserverRegistry},
    status::{DriverStatus, StatusNotice},
    transport::{ConnectionHandle, DeviceAttachment},
};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Owns the single live user-client connection.
///
/// Attach and detach are the only writers. Dispatch holds a [`ConnectionLease`]
/// while it submits so a concurrent detach waits for the submit to finish.
#[derive(Debug)]
pub struct ConnectionManager {
    slot: RwLock<Option<DeviceAttachment>>,
    observers: Arc<ObserverRegistry>,
}

/// Read access to the current connection for the duration of one submit.
pub struct ConnectionLease<'a> {
    _guard: RwLockReadGuard<'a, Option<DeviceAttachment>>,
    handle: ConnectionHandle,
}

impl ConnectionLease<'_> {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }
}

impl ConnectionManager {
    pub fn new(observers: Arc<ObserverRegistry>) -> Self {
        Self {
            slot: RwLock::new(None),
            observers,
        }
    }

    pub fn current(&self) -> Option<ConnectionHandle> {
        self.read().as_ref().map(|attachment| attachment.handle)
    }

    pub fn is_connected(&self) -> bool {
        self.read().is_some()
    }

    pub fn attachment(&self) -> Option<DeviceAttachment> {
        self.read().clone()
    }

    pub fn lease(&self) -> Option<ConnectionLease<'_>> {
        let guard = self.read();
        let handle = guard.as_ref()?.handle;
        Some(ConnectionLease {
            _guard: guard,
            handle,
        })
    }

    /// Record a driver attach. Returns the attachment it replaced, if any.
    pub fn on_device_attached(&self, attachment: DeviceAttachment) -> Option<DeviceAttachment> {
        let handle = attachment.handle;
        let name = attachment.name.clone();
        let previous = {
            let mut slot = self.write();
            if slot.as_ref().map(|current| current.handle) == Some(handle) {
                debug!(%handle, "driver re-announced existing connection");
                *slot = Some(attachment);
                return None;
            }
            slot.replace(attachment)
        };
        info!(%handle, device = %name, "driver connected");
        self.observers.notify(&ClientEvent::Status(StatusNotice::new(
            DriverStatus::Connected,
            "Driver successfully connected.",
        )));
        previous
    }

    /// Record a driver detach. Returns the attachment that was dropped.
    pub fn on_device_removed(&self) -> Option<DeviceAttachment> {
        let removed = self.write().take()?;
        info!(handle = %removed.handle, device = %removed.name, "driver disconnected");
        self.observers.notify(&ClientEvent::Status(StatusNotice::new(
            DriverStatus::Disconnected,
            "Driver successfully disconnected.",
        )));
        Some(removed)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<DeviceAttachment>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<DeviceAttachment>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(raw: u64) -> DeviceAttachment {
        DeviceAttachment {
            handle: ConnectionHandle::new(raw).unwrap(),
            name: "VSPDriver".into(),
            path: format!("IOService:/VSPDriver@{raw}"),
        }
    }

    fn statuses(
        rx: &mut futures_channel::mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Vec<DriverStatus> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = rx.try_next() {
            if let ClientEvent::Status(notice) = event {
                out.push(notice.status);
            }
        }
        out
    }

    #[test]
    fn attach_then_detach() {
        let observers = Arc::new(ObserverRegistry::new());
        let (_id, mut rx) = observers.subscribe_channel();
        let manager = ConnectionManager::new(observers);
        assert!(!manager.is_connected());
        assert!(manager.lease().is_none());

        assert!(manager.on_device_attached(attachment(7)).is_none());
        assert_eq!(manager.current().map(ConnectionHandle::get), Some(7));
        assert_eq!(manager.lease().unwrap().handle().get(), 7);

        let removed = manager.on_device_removed().unwrap();
        assert_eq!(removed.handle.get(), 7);
        assert!(manager.current().is_none());
        assert!(manager.on_device_removed().is_none());

        assert_eq!(
            statuses(&mut rx),
            vec![DriverStatus::Connected, DriverStatus::Disconnected]
        );
    }

    #[test]
    fn same_handle_does_not_renotify() {
        let observers = Arc::new(ObserverRegistry::new());
        let (_id, mut rx) = observers.subscribe_channel();
        let manager = ConnectionManager::new(observers);
        manager.on_device_attached(attachment(3));
        manager.on_device_attached(attachment(3));
        let previous = manager.on_device_attached(attachment(4)).unwrap();
        assert_eq!(previous.handle.get(), 3);
        assert_eq!(
            statuses(&mut rx),
            vec![DriverStatus::Connected, DriverStatus::Connected]
        );
    }
}
