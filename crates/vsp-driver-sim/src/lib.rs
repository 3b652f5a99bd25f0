//! Simulated system services for the VSP client.
//!
//! [`SimExtensionManager`] plays the OS extension manager and [`SimDriver`]
//! plays a loaded driver with its user client. Both report back through the
//! same notice channel the client's completion pump drains.

mod driver;
mod manager;

pub use driver::{SimDriver, SimPort, SimUserClient};
pub use manager::{
    ERROR_CODE_SIGNATURE_INVALID, ERROR_EXTENSION_NOT_FOUND, ERROR_REQUEST_CANCELED,
    EXTENSION_ERROR_DOMAIN, SimExtensionManager, SimScript,
};

use vsp_client_core::{DriverNotice, NoticeSender};

/// Queue `notices` for the completion pump in the order given. The channel
/// is unbounded, so this never blocks the caller.
pub(crate) fn deliver<I>(sender: &NoticeSender, notices: I)
where
    I: IntoIterator<Item = DriverNotice>,
{
    for notice in notices {
        if sender.send(notice).is_err() {
            tracing::debug!("notice receiver gone, dropping remaining notices");
            break;
        }
    }
}
