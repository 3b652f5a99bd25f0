#![no_std]

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use core::{convert::TryFrom, fmt};

mod status;

pub use status::{
    DriverStatusError, STATUS_CODE_INVALID_PARAMETER, STATUS_CODE_MAX_PORTS,
    STATUS_CODE_PORT_IN_USE, STATUS_CODE_SELF_LINK, STATUS_FLAG_DRIVER_ERROR,
    STATUS_FLAG_PORT_ERROR, lookup_status,
};

/// Reverse-DNS identifier of the driver extension bundle.
pub const DEFAULT_EXTENSION_ID: &str = "org.eof.tools.VSPDriver";
/// Service class name the user client matches against.
pub const USER_CLIENT_CLASS: &str = "VSPDriver";
/// Signature prefix stamped into every request; the low bits carry `1 << command`.
pub const MAGIC_CONTROL: u64 = 0xBE66_0525_0000;
/// Maximum number of serial ports the driver manages.
pub const MAX_SERIAL_PORTS: usize = 16;
/// Maximum number of port links the driver manages.
pub const MAX_PORT_LINKS: usize = 16;
/// Maximum encoded length of a port name.
pub const MAX_PORT_NAME: usize = 64;
/// Parameter flags the driver expects on a CreatePort request carrying port parameters.
pub const CREATE_PORT_PARAM_FLAGS: u64 = 0xff01;

const OFF_CONTEXT: usize = 0;
const OFF_COMMAND: usize = 1;
const OFF_SIGNATURE: usize = 8;
const OFF_TRACE_FLAGS: usize = 16;
const OFF_CHECK_FLAGS: usize = 24;
const OFF_STATUS_CODE: usize = 32;
const OFF_STATUS_FLAGS: usize = 40;
const OFF_PARAM_FLAGS: usize = 48;
const OFF_LINK_SOURCE: usize = 56;
const OFF_LINK_TARGET: usize = 57;
const OFF_PORT_PARAMS: usize = 64;
const OFF_PORT_COUNT: usize = 72;
const OFF_PORT_LIST: usize = 80;
const PORT_ENTRY_LEN: usize = 16 + MAX_PORT_NAME;
const OFF_LINK_COUNT: usize = OFF_PORT_LIST + MAX_SERIAL_PORTS * PORT_ENTRY_LEN;
const OFF_LINK_LIST: usize = OFF_LINK_COUNT + 8;

/// Number of bytes in an encoded [`ControllerData`] record.
pub const CONTROLLER_DATA_LEN: usize = OFF_LINK_LIST + MAX_PORT_LINKS * 8;

/// Errors surfaced while decoding protocol messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Incoming command selector is unsupported.
    InvalidCommand(u8),
    /// Incoming user context is unsupported.
    InvalidContext(u8),
    /// Response signature does not belong to the command it claims to answer.
    InvalidSignature { expected: u64, actual: u64 },
    /// A list count exceeded its fixed capacity.
    InvalidCount { field: &'static str, count: usize },
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidCommand(cmd) => write!(f, "invalid command {cmd}"),
            ProtoError::InvalidContext(ctx) => write!(f, "invalid user context {ctx}"),
            ProtoError::InvalidSignature { expected, actual } => write!(
                f,
                "invalid driver signature 0x{actual:x}, expected 0x{expected:x}"
            ),
            ProtoError::InvalidCount { field, count } => {
                write!(f, "{field} count {count} exceeds capacity")
            }
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

/// Result alias for protocol parsing operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Commands understood by the driver's user client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    #[default]
    PingPong = 0,
    GetStatus = 1,
    CreatePort = 2,
    RemovePort = 3,
    LinkPorts = 4,
    UnlinkPorts = 5,
    GetPortList = 6,
    GetLinkList = 7,
    EnableChecks = 8,
    EnableTrace = 9,
    Shutdown = 10,
}

impl ControlCommand {
    /// Signature a request for this command carries, and its response must echo.
    pub const fn signature(self) -> u64 {
        MAGIC_CONTROL | (1u64 << (self as u8))
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ControlCommand::PingPong => "ping-pong",
            ControlCommand::GetStatus => "get-status",
            ControlCommand::CreatePort => "create-port",
            ControlCommand::RemovePort => "remove-port",
            ControlCommand::LinkPorts => "link-ports",
            ControlCommand::UnlinkPorts => "unlink-ports",
            ControlCommand::GetPortList => "get-port-list",
            ControlCommand::GetLinkList => "get-link-list",
            ControlCommand::EnableChecks => "enable-checks",
            ControlCommand::EnableTrace => "enable-trace",
            ControlCommand::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ControlCommand {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::PingPong),
            1 => Ok(Self::GetStatus),
            2 => Ok(Self::CreatePort),
            3 => Ok(Self::RemovePort),
            4 => Ok(Self::LinkPorts),
            5 => Ok(Self::UnlinkPorts),
            6 => Ok(Self::GetPortList),
            7 => Ok(Self::GetLinkList),
            8 => Ok(Self::EnableChecks),
            9 => Ok(Self::EnableTrace),
            10 => Ok(Self::Shutdown),
            other => Err(ProtoError::InvalidCommand(other)),
        }
    }
}

impl From<ControlCommand> for u8 {
    fn from(cmd: ControlCommand) -> Self {
        cmd as u8
    }
}

/// Context a controller record was issued or answered in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UserContext {
    Ping = 0x01,
    #[default]
    Port = 0x02,
    Result = 0x03,
    Error = 0x04,
}

impl TryFrom<u8> for UserContext {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Port),
            0x03 => Ok(Self::Result),
            0x04 => Ok(Self::Error),
            other => Err(ProtoError::InvalidContext(other)),
        }
    }
}

bitflags! {
    /// Per-port trace switches.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TraceFlags: u64 {
        const RX = 1 << 16;
        const TX = 1 << 17;
        const IO = 1 << 18;
    }
}

bitflags! {
    /// Per-port line-setting checks applied between linked ports.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CheckFlags: u64 {
        const BAUD = 1 << 19;
        const DATA_SIZE = 1 << 20;
        const STOP_BITS = 1 << 21;
        const PARITY = 1 << 22;
        const FLOW_CONTROL = 1 << 23;
    }
}

/// A link between two ports as stored in the driver's link list.
///
/// Encoded as `(link_id << 16) | (source << 8) | target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortLinkRecord {
    pub link_id: u8,
    pub source: u8,
    pub target: u8,
}

impl PortLinkRecord {
    pub const fn new(link_id: u8, source: u8, target: u8) -> Self {
        Self {
            link_id,
            source,
            target,
        }
    }

    pub const fn pack(self) -> u64 {
        ((self.link_id as u64) << 16) | ((self.source as u64) << 8) | self.target as u64
    }

    pub const fn unpack(raw: u64) -> Self {
        Self {
            link_id: ((raw >> 16) & 0xff) as u8,
            source: ((raw >> 8) & 0xff) as u8,
            target: (raw & 0xff) as u8,
        }
    }

    /// Returns true when `port` is either end of this link.
    pub const fn involves(&self, port: u8) -> bool {
        self.source == port || self.target == port
    }
}

/// Parity setting, using the RS-232 wire values the driver expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Parity {
    #[default]
    None = 1,
    Odd = 2,
    Even = 3,
    Mark = 4,
    Space = 5,
}

impl TryFrom<u8> for Parity {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::None),
            2 => Ok(Self::Odd),
            3 => Ok(Self::Even),
            4 => Ok(Self::Mark),
            5 => Ok(Self::Space),
            _ => Err(ProtoError::InvalidValue("parity")),
        }
    }
}

/// Flow control setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlowControl {
    #[default]
    None = 0,
    Hardware = 1,
    Software = 2,
}

impl TryFrom<u8> for FlowControl {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Hardware),
            2 => Ok(Self::Software),
            _ => Err(ProtoError::InvalidValue("flow control")),
        }
    }
}

/// Line settings for a newly created port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortParameters {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for PortParameters {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl PortParameters {
    pub const ENCODED_LEN: usize = 8;

    /// Validate and build a parameter set.
    pub fn new(
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: Parity,
        flow_control: FlowControl,
    ) -> Result<Self> {
        let params = Self {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ProtoError::InvalidValue("baud rate must be non-zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ProtoError::InvalidValue("data bits must be 5-8"));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ProtoError::InvalidValue("stop bits must be 1 or 2"));
        }
        Ok(())
    }

    fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.baud_rate);
        buf[4] = self.data_bits;
        buf[5] = self.stop_bits;
        buf[6] = self.parity as u8;
        buf[7] = self.flow_control as u8;
    }

    fn decode_from(buf: &[u8]) -> Result<Option<Self>> {
        if buf[..Self::ENCODED_LEN].iter().all(|b| *b == 0) {
            return Ok(None);
        }
        let params = Self {
            baud_rate: LittleEndian::read_u32(&buf[0..4]),
            data_bits: buf[4],
            stop_bits: buf[5],
            parity: Parity::try_from(buf[6])?,
            flow_control: FlowControl::try_from(buf[7])?,
        };
        params.validate()?;
        Ok(Some(params))
    }
}

/// One entry of the driver's port list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortListItem {
    pub id: u8,
    pub flags: u64,
    pub name: heapless::String<MAX_PORT_NAME>,
}

impl PortListItem {
    pub fn new(id: u8, flags: u64, name: &str) -> Result<Self> {
        let mut owned = heapless::String::new();
        owned
            .push_str(name)
            .map_err(|_| ProtoError::InvalidValue("port name too long"))?;
        Ok(Self {
            id,
            flags,
            name: owned,
        })
    }

    pub fn trace_flags(&self) -> TraceFlags {
        TraceFlags::from_bits_truncate(self.flags)
    }

    pub fn check_flags(&self) -> CheckFlags {
        CheckFlags::from_bits_truncate(self.flags)
    }
}

/// Status block of a controller record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub code: u32,
    pub flags: u64,
}

impl Status {
    pub const fn new(code: u32, flags: u64) -> Self {
        Self { code, flags }
    }

    /// Translate the (flags, code) pair into a driver error, if it is one.
    pub fn error(&self) -> Option<DriverStatusError> {
        lookup_status(self.flags, self.code)
    }
}

/// Source/target pair a command applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortLink {
    pub source: u8,
    pub target: u8,
}

/// Parameter block of a controller record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Parameter {
    pub flags: u64,
    pub link: PortLink,
}

/// The fixed-size record exchanged with the driver's user client, both as
/// request and as completion payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerData {
    pub context: UserContext,
    pub command: ControlCommand,
    pub signature: u64,
    pub trace_flags: TraceFlags,
    pub check_flags: CheckFlags,
    pub status: Status,
    pub parameter: Parameter,
    pub port_parameters: Option<PortParameters>,
    pub ports: heapless::Vec<PortListItem, MAX_SERIAL_PORTS>,
    pub links: heapless::Vec<u64, MAX_PORT_LINKS>,
}

impl ControllerData {
    /// Build a request for `command` in the port context with its signature set.
    pub fn request(command: ControlCommand) -> Self {
        Self {
            context: UserContext::Port,
            command,
            signature: command.signature(),
            ..Self::default()
        }
    }

    pub fn with_link(mut self, source: u8, target: u8) -> Self {
        self.parameter.link = PortLink { source, target };
        self
    }

    pub fn with_port_parameters(mut self, params: PortParameters) -> Self {
        self.parameter.flags = CREATE_PORT_PARAM_FLAGS;
        self.port_parameters = Some(params);
        self
    }

    /// Build the response skeleton for a request: same command, link and signature.
    pub fn response_to(request: &ControllerData) -> Self {
        Self {
            context: UserContext::Result,
            command: request.command,
            signature: request.signature,
            trace_flags: request.trace_flags,
            check_flags: request.check_flags,
            parameter: request.parameter,
            ..Self::default()
        }
    }

    /// Check that the signature belongs to the command this record carries.
    pub fn verify_signature(&self) -> Result<()> {
        let expected = self.command.signature();
        if self.signature != expected {
            return Err(ProtoError::InvalidSignature {
                expected,
                actual: self.signature,
            });
        }
        Ok(())
    }

    /// Iterate over the decoded link list.
    pub fn link_records(&self) -> impl Iterator<Item = PortLinkRecord> + '_ {
        self.links.iter().map(|raw| PortLinkRecord::unpack(*raw))
    }

    pub fn status_error(&self) -> Option<DriverStatusError> {
        self.status.error()
    }

    /// Serialize the record to its fixed-width wire representation.
    pub fn encode(&self) -> [u8; CONTROLLER_DATA_LEN] {
        let mut buf = [0u8; CONTROLLER_DATA_LEN];
        buf[OFF_CONTEXT] = self.context as u8;
        buf[OFF_COMMAND] = u8::from(self.command);
        LittleEndian::write_u64(&mut buf[OFF_SIGNATURE..OFF_SIGNATURE + 8], self.signature);
        LittleEndian::write_u64(
            &mut buf[OFF_TRACE_FLAGS..OFF_TRACE_FLAGS + 8],
            self.trace_flags.bits(),
        );
        LittleEndian::write_u64(
            &mut buf[OFF_CHECK_FLAGS..OFF_CHECK_FLAGS + 8],
            self.check_flags.bits(),
        );
        LittleEndian::write_u32(
            &mut buf[OFF_STATUS_CODE..OFF_STATUS_CODE + 4],
            self.status.code,
        );
        LittleEndian::write_u64(
            &mut buf[OFF_STATUS_FLAGS..OFF_STATUS_FLAGS + 8],
            self.status.flags,
        );
        LittleEndian::write_u64(
            &mut buf[OFF_PARAM_FLAGS..OFF_PARAM_FLAGS + 8],
            self.parameter.flags,
        );
        buf[OFF_LINK_SOURCE] = self.parameter.link.source;
        buf[OFF_LINK_TARGET] = self.parameter.link.target;
        if let Some(params) = &self.port_parameters {
            params.encode_into(&mut buf[OFF_PORT_PARAMS..OFF_PORT_PARAMS + 8]);
        }

        buf[OFF_PORT_COUNT] = self.ports.len() as u8;
        for (idx, port) in self.ports.iter().enumerate() {
            let base = OFF_PORT_LIST + idx * PORT_ENTRY_LEN;
            buf[base] = port.id;
            LittleEndian::write_u64(&mut buf[base + 8..base + 16], port.flags);
            let name = port.name.as_bytes();
            buf[base + 16..base + 16 + name.len()].copy_from_slice(name);
        }

        buf[OFF_LINK_COUNT] = self.links.len() as u8;
        for (idx, link) in self.links.iter().enumerate() {
            let base = OFF_LINK_LIST + idx * 8;
            LittleEndian::write_u64(&mut buf[base..base + 8], *link);
        }
        buf
    }

    /// Decode a record from its fixed-width wire representation.
    pub fn decode(bytes: &[u8; CONTROLLER_DATA_LEN]) -> Result<Self> {
        let context = UserContext::try_from(bytes[OFF_CONTEXT])?;
        let command = ControlCommand::try_from(bytes[OFF_COMMAND])?;
        let signature = LittleEndian::read_u64(&bytes[OFF_SIGNATURE..OFF_SIGNATURE + 8]);
        let trace_flags = TraceFlags::from_bits_truncate(LittleEndian::read_u64(
            &bytes[OFF_TRACE_FLAGS..OFF_TRACE_FLAGS + 8],
        ));
        let check_flags = CheckFlags::from_bits_truncate(LittleEndian::read_u64(
            &bytes[OFF_CHECK_FLAGS..OFF_CHECK_FLAGS + 8],
        ));
        let status = Status {
            code: LittleEndian::read_u32(&bytes[OFF_STATUS_CODE..OFF_STATUS_CODE + 4]),
            flags: LittleEndian::read_u64(&bytes[OFF_STATUS_FLAGS..OFF_STATUS_FLAGS + 8]),
        };
        let parameter = Parameter {
            flags: LittleEndian::read_u64(&bytes[OFF_PARAM_FLAGS..OFF_PARAM_FLAGS + 8]),
            link: PortLink {
                source: bytes[OFF_LINK_SOURCE],
                target: bytes[OFF_LINK_TARGET],
            },
        };
        let port_parameters =
            PortParameters::decode_from(&bytes[OFF_PORT_PARAMS..OFF_PORT_PARAMS + 8])?;

        let port_count = bytes[OFF_PORT_COUNT] as usize;
        if port_count > MAX_SERIAL_PORTS {
            return Err(ProtoError::InvalidCount {
                field: "port list",
                count: port_count,
            });
        }
        let mut ports = heapless::Vec::new();
        for idx in 0..port_count {
            let base = OFF_PORT_LIST + idx * PORT_ENTRY_LEN;
            let raw_name = &bytes[base + 16..base + PORT_ENTRY_LEN];
            let name_len = raw_name
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(MAX_PORT_NAME);
            let name = core::str::from_utf8(&raw_name[..name_len])
                .map_err(|_| ProtoError::InvalidValue("port name is not UTF-8"))?;
            let item = PortListItem::new(
                bytes[base],
                LittleEndian::read_u64(&bytes[base + 8..base + 16]),
                name,
            )?;
            // Capacity is checked above.
            let _ = ports.push(item);
        }

        let link_count = bytes[OFF_LINK_COUNT] as usize;
        if link_count > MAX_PORT_LINKS {
            return Err(ProtoError::InvalidCount {
                field: "link list",
                count: link_count,
            });
        }
        let mut links = heapless::Vec::new();
        for idx in 0..link_count {
            let base = OFF_LINK_LIST + idx * 8;
            let _ = links.push(LittleEndian::read_u64(&bytes[base..base + 8]));
        }

        Ok(Self {
            context,
            command,
            signature,
            trace_flags,
            check_flags,
            status,
            parameter,
            port_parameters,
            ports,
            links,
        })
    }
}

impl TryFrom<&[u8]> for ControllerData {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != CONTROLLER_DATA_LEN {
            return Err(ProtoError::InvalidLength {
                expected: CONTROLLER_DATA_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; CONTROLLER_DATA_LEN];
        buf.copy_from_slice(value);
        Self::decode(&buf)
    }
}
