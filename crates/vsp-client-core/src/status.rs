use std::fmt;

/// Error domain attached to notices produced by this client.
pub const ERROR_DOMAIN: &str = "VSPDMErrorDomain";

/// Coarse driver status published to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    NotLoaded,
    Loading,
    Loaded,
    Unloading,
    Unloaded,
    RequiresUserApproval,
    WillCompleteAfterReboot,
    Failure,
    Connected,
    Disconnected,
    DataError,
}

impl DriverStatus {
    pub const fn is_error(self) -> bool {
        matches!(self, DriverStatus::Failure | DriverStatus::DataError)
    }
}

/// A status change with the code/domain/message triple a UI would display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusNotice {
    pub status: DriverStatus,
    pub code: i64,
    pub domain: String,
    pub message: String,
}

impl StatusNotice {
    pub fn new(status: DriverStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            code: 0,
            domain: ERROR_DOMAIN.to_string(),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

impl fmt::Display for StatusNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            write!(f, "{:?}: {}", self.status, self.message)
        } else {
            write!(
                f,
                "{:?}: {} ({} {})",
                self.status, self.message, self.domain, self.code
            )
        }
    }
}
