pub mod completion;
pub mod connection;
pub mod controller;
pub mod dispatch;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod observer;
pub mod properties;
pub mod pump;
pub mod status;
pub mod transport;

pub use completion::{CommandEvent, CommandState, CompletionTracker, CorrelationToken};
pub use connection::{ConnectionLease, ConnectionManager};
pub use controller::{VspController, VspControllerConfig};
pub use dispatch::{
    CommandDispatcher, CommandFailure, CommandResult, DispatchError, DispatchResult, PendingCommand,
};
pub use gateway::{
    ActivationCallback, ActivationFailure, ActivationGateway, ActivationResult, AlwaysReplace,
    ExtensionManager, GatewayError, PendingOperation, ReplaceIfNewer, ReplacementAction,
    ReplacementPolicy,
};
pub use lifecycle::{ExtensionEvent, ExtensionState, LifecycleMachine, Transition, transition};
pub use observer::{ClientEvent, ObserverRegistry, SubscriptionId};
pub use properties::{ExtensionProperties, compare_versions, select_installed};
pub use pump::{
    CompletionPumpHandle, CompletionPumpTask, NoticeSink, PumpSummary, start_completion_pump,
};
pub use status::{DriverStatus, ERROR_DOMAIN, StatusNotice};
pub use transport::{
    COMPLETION_SUCCESS, Completion, ConnectionHandle, DeviceAttachment, DriverNotice,
    NoticeReceiver, NoticeSender, NoticeSource, TransportError, TransportErrorKind,
    TransportResult, UserClient, notice_channel,
};
