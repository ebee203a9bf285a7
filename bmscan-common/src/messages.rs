//! CAN frame model and CANopen message parsing
//!
//! The [`BmscanMessage`] enum is the demultiplexing point for all inbound bus traffic: the
//! dispatcher converts every received [`CanMessage`] and routes the recognized variants.
use snafu::Snafu;

use crate::sdo::{SdoRequest, SdoResponse};

/// A CAN bus identifier, either standard (11-bit) or extended (29-bit)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// An extended 29-bit ID
    Extended(u32),
    /// A standard 11-bit ID
    Std(u16),
}

impl CanId {
    /// Create an extended CanId
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard CanId
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the ID as a raw u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Check if this is an extended ID
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A single CAN data frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanMessage {
    /// Frame payload; only the first `dlc` bytes are valid
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid payload bytes (0-8)
    pub dlc: u8,
    /// The frame identifier
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
        }
    }
}

impl CanMessage {
    /// Create a message from an ID and payload
    ///
    /// Panics if `data` exceeds 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if dlc > MAX_DATA_LENGTH as u8 {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self { id, dlc, data: buf }
    }

    /// Get the frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// NMT command specifier values
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum NmtCommandCmd {
    /// Start the node (enter Operational)
    Start = 1,
    /// Stop the node
    Stop = 2,
    /// Enter pre-operational state
    EnterPreOp = 128,
    /// Reset the application
    ResetApp = 129,
    /// Reset communications
    ResetComm = 130,
}

impl NmtCommandCmd {
    /// Parse a command specifier byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The NMT command COB-ID
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The SYNC object COB-ID
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// The base ID for emergency messages (node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// The base ID for heartbeat messages (node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for receiving SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Base IDs for transmit PDOs 1-4 (node ID is added)
pub const TPDO_BASES: [u16; 4] = [0x180, 0x280, 0x380, 0x480];
/// Base IDs for receive PDOs 1-4 (node ID is added)
pub const RPDO_BASES: [u16; 4] = [0x200, 0x300, 0x400, 0x500];

/// An NMT master command message
#[derive(Debug, Clone, Copy)]
pub struct NmtCommand {
    /// The command to execute
    pub cmd: NmtCommandCmd,
    /// The target node, or 0 to broadcast
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandCmd::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        let mut msg = CanMessage {
            id: NMT_CMD_ID,
            dlc: 2,
            ..Default::default()
        };
        msg.data[0] = cmd.cmd as u8;
        msg.data[1] = cmd.node;
        msg
    }
}

/// NMT state reported by a node in its heartbeat
///
/// The BMS bootloader does not have a dedicated state value; it idles in `PreOperational` until
/// commanded to start or program.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Node has just booted / is initializing
    Bootup = 0,
    /// Node is stopped
    Stopped = 4,
    /// Node is operational
    Operational = 5,
    /// Node is pre-operational (also reported by the bootloader)
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Bootup => "Bootup",
            NmtState::Stopped => "Stopped",
            NmtState::Operational => "Operational",
            NmtState::PreOperational => "PreOperational",
        };
        write!(f, "{s}")
    }
}

/// Error indicating a byte is not a valid NMT state
#[derive(Debug, Clone, Copy)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat message produced by a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    /// The producing node's ID
    pub node: u8,
    /// The heartbeat toggle flag (bit 7 of the payload)
    pub toggle: bool,
    /// The node's reported NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut msg = CanMessage {
            id: CanId::Std(HEARTBEAT_BASE | value.node as u16),
            dlc: 1,
            ..Default::default()
        };
        msg.data[0] = value.state as u8;
        if value.toggle {
            msg.data[0] |= 1 << 7;
        }
        msg
    }
}

/// An emergency (EMCY) message produced by a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmcyMessage {
    /// The producing node's ID
    pub node: u8,
    /// The standard error code
    pub error_code: u16,
    /// The error register value
    pub error_register: u8,
    /// Manufacturer specific error data
    pub data: [u8; 5],
}

/// A transmit PDO frame received from a node
///
/// The payload layout is device-configured; see the client crate's PDO mapping support for
/// decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdoFrame {
    /// Which TPDO (1-4) this frame belongs to
    pub pdo: u8,
    /// The producing node's ID
    pub node: u8,
    /// Frame payload
    pub data: [u8; 8],
    /// Number of valid payload bytes
    pub dlc: u8,
}

impl PdoFrame {
    /// Get the valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }
}

/// All recognized inbound CANopen traffic
#[derive(Debug, Clone, Copy)]
pub enum BmscanMessage {
    /// An NMT master command (only ever sent by us, but parsed for bus monitoring)
    NmtCommand(NmtCommand),
    /// A heartbeat from a node
    Heartbeat(Heartbeat),
    /// An emergency message from a node
    Emcy(EmcyMessage),
    /// A transmit PDO from a node
    Tpdo(PdoFrame),
    /// An SDO response from a node's SDO server
    SdoResponse {
        /// The responding node's ID
        node: u8,
        /// The parsed response
        response: SdoResponse,
    },
    /// An SDO request addressed to a node (seen when another master shares the bus)
    SdoRequest {
        /// The addressed node's ID
        node: u8,
        /// The parsed request
        request: SdoRequest,
    },
    /// A SYNC object
    Sync,
}

impl TryFrom<CanMessage> for BmscanMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        let raw = cob_id.raw();
        if cob_id.is_extended() {
            return Err(MessageError::UnrecognizedId { cob_id });
        }
        let function = (raw & 0x780) as u16;
        let node = (raw & 0x7f) as u8;

        if cob_id == NMT_CMD_ID {
            Ok(BmscanMessage::NmtCommand(msg.try_into()?))
        } else if cob_id == SYNC_ID {
            Ok(BmscanMessage::Sync)
        } else if function == EMCY_BASE && node != 0 {
            let payload = msg.data();
            if payload.len() < 3 {
                return Err(MessageError::MessageTooShort);
            }
            let error_code = u16::from_le_bytes([payload[0], payload[1]]);
            let error_register = payload[2];
            let mut data = [0u8; 5];
            let n = payload.len().saturating_sub(3).min(5);
            data[..n].copy_from_slice(&payload[3..3 + n]);
            Ok(BmscanMessage::Emcy(EmcyMessage {
                node,
                error_code,
                error_register,
                data,
            }))
        } else if function == HEARTBEAT_BASE && node != 0 {
            if msg.dlc < 1 {
                return Err(MessageError::MessageTooShort);
            }
            let toggle = (msg.data[0] & (1 << 7)) != 0;
            let state: NmtState = (msg.data[0] & 0x7f)
                .try_into()
                .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
            Ok(BmscanMessage::Heartbeat(Heartbeat {
                node,
                toggle,
                state,
            }))
        } else if function == SDO_RESP_BASE && node != 0 {
            let response: SdoResponse = msg
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(BmscanMessage::SdoResponse { node, response })
        } else if function == SDO_REQ_BASE && node != 0 {
            let request: SdoRequest = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(BmscanMessage::SdoRequest { node, request })
        } else if let Some(pdo) = TPDO_BASES.iter().position(|&base| function == base) {
            if node == 0 {
                return Err(MessageError::UnrecognizedId { cob_id });
            }
            Ok(BmscanMessage::Tpdo(PdoFrame {
                pdo: pdo as u8 + 1,
                node,
                data: msg.data,
                dlc: msg.dlc,
            }))
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// Errors returned when parsing CAN messages
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// The message payload is too short for its message type
    MessageTooShort,
    /// The message could not be parsed for its COB-ID's message type
    MalformedMsg {
        /// The frame's COB-ID
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// The frame's COB-ID
        cob_id: CanId,
        /// The COB-ID that was expected
        expected: CanId,
    },
    /// A field in the message holds an invalid value
    InvalidField,
    /// The COB-ID does not map to any recognized message type
    UnrecognizedId {
        /// The frame's COB-ID
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The raw state byte
        value: u8,
    },
}
