use core::fmt;

/// Status flags marking a port-level error with a specific code.
pub const STATUS_FLAG_PORT_ERROR: u64 = 0xfa00_0001;
/// Status flags marking a generic driver error.
pub const STATUS_FLAG_DRIVER_ERROR: u64 = 0xfa00_0000;

pub const STATUS_CODE_SELF_LINK: u32 = 0xe000_0001;
pub const STATUS_CODE_PORT_IN_USE: u32 = 0xe000_02d5;
pub const STATUS_CODE_INVALID_PARAMETER: u32 = 0xe000_02c2;
pub const STATUS_CODE_MAX_PORTS: u32 = 0xe000_02db;

/// Driver-reported failure decoded from a status block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverStatusError {
    SelfLink,
    PortInUse,
    InvalidParameter,
    MaxPortsReached,
    /// Generic driver error flag with an arbitrary code.
    Driver { code: u32 },
    /// Anything else non-zero.
    Unknown { flags: u64, code: u32 },
}

impl DriverStatusError {
    pub const fn code(&self) -> u32 {
        match self {
            DriverStatusError::SelfLink => STATUS_CODE_SELF_LINK,
            DriverStatusError::PortInUse => STATUS_CODE_PORT_IN_USE,
            DriverStatusError::InvalidParameter => STATUS_CODE_INVALID_PARAMETER,
            DriverStatusError::MaxPortsReached => STATUS_CODE_MAX_PORTS,
            DriverStatusError::Driver { code } => *code,
            DriverStatusError::Unknown { code, .. } => *code,
        }
    }

    pub const fn flags(&self) -> u64 {
        match self {
            DriverStatusError::Driver { .. } => STATUS_FLAG_DRIVER_ERROR,
            DriverStatusError::Unknown { flags, .. } => *flags,
            _ => STATUS_FLAG_PORT_ERROR,
        }
    }
}

impl fmt::Display for DriverStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverStatusError::SelfLink => f.write_str("ports cannot be linked to themselves"),
            DriverStatusError::PortInUse => f.write_str("port already in use"),
            DriverStatusError::InvalidParameter => f.write_str("invalid parameter"),
            DriverStatusError::MaxPortsReached => f.write_str("maximum ports reached"),
            DriverStatusError::Driver { code } => write!(f, "generic driver error 0x{code:08x}"),
            DriverStatusError::Unknown { code, .. } => write!(f, "driver error 0x{code:08x}"),
        }
    }
}

/// Map a `(flags, code)` status pair to a driver error. `(0, 0)` means success.
///
/// Specific port errors only match under [`STATUS_FLAG_PORT_ERROR`]; a code
/// that would be recognised under other flags falls through to the fallback.
pub fn lookup_status(flags: u64, code: u32) -> Option<DriverStatusError> {
    if flags == 0 && code == 0 {
        return None;
    }
    let err = match (flags, code) {
        (STATUS_FLAG_PORT_ERROR, STATUS_CODE_SELF_LINK) => DriverStatusError::SelfLink,
        (STATUS_FLAG_PORT_ERROR, STATUS_CODE_PORT_IN_USE) => DriverStatusError::PortInUse,
        (STATUS_FLAG_PORT_ERROR, STATUS_CODE_INVALID_PARAMETER) => {
            DriverStatusError::InvalidParameter
        }
        (STATUS_FLAG_PORT_ERROR, STATUS_CODE_MAX_PORTS) => DriverStatusError::MaxPortsReached,
        (STATUS_FLAG_DRIVER_ERROR, code) => DriverStatusError::Driver { code },
        (flags, code) => DriverStatusError::Unknown { flags, code },
    };
    Some(err)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::{String, ToString};

    fn message(flags: u64, code: u32) -> Option<String> {
        lookup_status(flags, code).map(|err| err.to_string())
    }

    #[test]
    fn zero_status_is_success() {
        assert_eq!(lookup_status(0, 0), None);
    }

    #[test]
    fn known_port_errors() {
        assert_eq!(
            lookup_status(STATUS_FLAG_PORT_ERROR, 0xe000_0001),
            Some(DriverStatusError::SelfLink)
        );
        assert_eq!(
            lookup_status(STATUS_FLAG_PORT_ERROR, 0xe000_02d5),
            Some(DriverStatusError::PortInUse)
        );
        assert_eq!(
            lookup_status(STATUS_FLAG_PORT_ERROR, 0xe000_02c2),
            Some(DriverStatusError::InvalidParameter)
        );
        assert_eq!(
            lookup_status(STATUS_FLAG_PORT_ERROR, 0xe000_02db),
            Some(DriverStatusError::MaxPortsReached)
        );
    }

    #[test]
    fn generic_driver_error() {
        let err = lookup_status(STATUS_FLAG_DRIVER_ERROR, 0x1234).unwrap();
        assert_eq!(err, DriverStatusError::Driver { code: 0x1234 });
        assert_eq!(err.flags(), STATUS_FLAG_DRIVER_ERROR);
    }

    #[test]
    fn port_code_under_other_flags_falls_back() {
        let err = lookup_status(0x1, STATUS_CODE_SELF_LINK).unwrap();
        assert_eq!(
            err,
            DriverStatusError::Unknown {
                flags: 0x1,
                code: STATUS_CODE_SELF_LINK
            }
        );
        assert_eq!(err.code(), STATUS_CODE_SELF_LINK);
    }

    #[test]
    fn unmapped_port_code_falls_back() {
        let err = lookup_status(STATUS_FLAG_PORT_ERROR, 0x1).unwrap();
        assert_eq!(
            err,
            DriverStatusError::Unknown {
                flags: STATUS_FLAG_PORT_ERROR,
                code: 0x1
            }
        );
    }

    #[test]
    fn flags_alone_is_an_error() {
        assert!(lookup_status(STATUS_FLAG_PORT_ERROR, 0).is_some());
    }

    #[test]
    fn user_facing_messages() {
        assert_eq!(
            message(STATUS_FLAG_PORT_ERROR, 0xe000_0001).as_deref(),
            Some("ports cannot be linked to themselves")
        );
        assert_eq!(
            message(STATUS_FLAG_PORT_ERROR, 0xe000_02d5).as_deref(),
            Some("port already in use")
        );
        assert_eq!(
            message(STATUS_FLAG_PORT_ERROR, 0xe000_02c2).as_deref(),
            Some("invalid parameter")
        );
        assert_eq!(
            message(STATUS_FLAG_PORT_ERROR, 0xe000_02db).as_deref(),
            Some("maximum ports reached")
        );
        assert_eq!(
            message(STATUS_FLAG_DRIVER_ERROR, 0x1234).as_deref(),
            Some("generic driver error 0x00001234")
        );
        assert_eq!(
            message(STATUS_FLAG_PORT_ERROR, 0x1).as_deref(),
            Some("driver error 0x00000001")
        );
        assert_eq!(message(0, 0), None);
    }
}
