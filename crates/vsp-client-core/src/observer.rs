use crate::{
    completion::{CommandState, CorrelationToken},
    lifecycle::Transition,
    status::StatusNotice,
};
use futures_channel::mpsc;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use vsp_proto::ControllerData;

/// Everything observers can be told about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Status(StatusNotice),
    DataReady(ControllerData),
    DataError { code: u64, message: String },
    Lifecycle(Transition),
    Command {
        token: CorrelationToken,
        state: CommandState,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Explicit observer registry owned by the composition root.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<BTreeMap<SubscriptionId, Observer>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().insert(id, Arc::new(observer));
        id
    }

    /// Forward every event into a channel.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let id = self.subscribe(move |event| {
            let _ = tx.unbounded_send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to a snapshot of the current observers. Observers may
    /// subscribe or unsubscribe from inside the callback.
    pub fn notify(&self, event: &ClientEvent) {
        let snapshot: Vec<Observer> = self.lock().values().cloned().collect();
        for observer in snapshot {
            observer(event);
        }
    }

    pub fn notify_all(&self, events: impl IntoIterator<Item = ClientEvent>) {
        for event in events {
            self.notify(&event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Observer>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}
