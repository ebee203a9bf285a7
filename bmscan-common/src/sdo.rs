//! SDO request/response wire codec
//!
//! Implements the CiA 301 SDO framing used by the BMS: expedited and segmented transfers in both
//! directions, plus the block download variant used for firmware upload. All multi-byte fields are
//! little-endian and every SDO frame is padded to 8 bytes.
use crate::messages::{CanId, CanMessage};

/// Error produced while parsing an SDO frame
///
/// Carries the abort code a server would respond with for the malformed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SdoError {
    /// The frame should be answered with an abort carrying this code
    Abort(AbortCode),
}

/// Specifies the possible server command specifier (SCS) values in SDO response packets
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerCommand {
    /// Upload segment response
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Initiate upload response (expedited or segmented)
    Upload = 2,
    /// Acknowledge a download command
    Download = 3,
    /// Abort the transaction
    Abort = 4,
    /// Block download responses (sub-command in bits 1..0)
    BlockDownload = 5,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

/// The CiA 301 SDO abort code table
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC Error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource not available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored to the application because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored to the application because of the device state
    ///
    /// Reported by the BMS bootloader when flash verification fails after a program download.
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl TryFrom<u32> for AbortCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use AbortCode::*;
        match value {
            0x0503_0000 => Ok(ToggleNotAlternated),
            0x0504_0000 => Ok(SdoTimeout),
            0x0504_0001 => Ok(InvalidCommandSpecifier),
            0x0504_0002 => Ok(InvalidBlockSize),
            0x0504_0003 => Ok(InvalidSequenceNumber),
            0x0504_0004 => Ok(CrcError),
            0x0504_0005 => Ok(OutOfMemory),
            0x0601_0000 => Ok(UnsupportedAccess),
            0x0601_0001 => Ok(WriteOnly),
            0x0601_0002 => Ok(ReadOnly),
            0x0602_0000 => Ok(NoSuchObject),
            0x0604_0043 => Ok(IncompatibleParameter),
            0x0606_0000 => Ok(HardwareError),
            0x0607_0010 => Ok(DataTypeMismatch),
            0x0607_0012 => Ok(DataTypeMismatchLengthHigh),
            0x0607_0013 => Ok(DataTypeMismatchLengthLow),
            0x0609_0011 => Ok(NoSuchSubIndex),
            0x0609_0030 => Ok(InvalidValue),
            0x0609_0031 => Ok(ValueTooHigh),
            0x0609_0032 => Ok(ValueTooLow),
            0x060A_0023 => Ok(ResourceNotAvailable),
            0x0800_0000 => Ok(GeneralError),
            0x0800_0020 => Ok(CantStore),
            0x0800_0021 => Ok(CantStoreLocalControl),
            0x0800_0022 => Ok(CantStoreDeviceState),
            0x0800_0023 => Ok(NoObjectDict),
            0x0800_0024 => Ok(NoData),
            _ => Err(value),
        }
    }
}

/// An abort code as found on the wire
///
/// Devices can report codes outside the standard table; those are preserved as `Unknown` with the
/// raw 32-bit value so callers can still match on them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RawAbortCode {
    /// A code from the standard table
    Valid(AbortCode),
    /// A code not in the standard table
    Unknown(u32),
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(raw) => RawAbortCode::Unknown(raw),
        }
    }
}

impl RawAbortCode {
    /// Get the raw 32-bit code value
    pub fn code(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => *code as u32,
            RawAbortCode::Unknown(raw) => *raw,
        }
    }
}

/// Specifies the possible client command specifier (CCS) values in SDO request packets
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate a download
    InitiateDownload = 1,
    /// Initiate an upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort the transaction
    Abort = 4,
    /// Initiate a block upload
    ReqBlockUpload = 5,
    /// Block download requests (sub-command in bit 0)
    ReqBlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(ReqBlockUpload),
            6 => Ok(ReqBlockDownload),
            _ => Err(()),
        }
    }
}

/// An SDO request, sent from the client to a node's SDO server
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SdoRequest {
    /// Initiate a download (write)
    InitiateDownload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value on expedited, total size when e=0 and s=1
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Initiate an upload (read)
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Initiate a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, contains the number of bytes to be downloaded
        size: u32,
    },
    /// A sequence-numbered block download segment
    ///
    /// Block segments carry no command specifier; the sequence number occupies bits 6..0 of the
    /// command byte and bit 7 marks the final segment of the entire transfer. They are only valid
    /// while a block download is in progress, so [`SdoRequest::parse_block_segment`] must be used
    /// instead of the generic parser.
    BlockSegment {
        /// Sequence number within the current block (1..=blksize)
        seqno: u8,
        /// Set on the last segment of the entire transfer
        last: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Finish a block download
    EndBlockDownload {
        /// Number of unused bytes in the final segment
        n: u8,
        /// CRC16 (XMODEM) over the full transferred data
        crc: u16,
    },
    /// Abort the in-flight transaction
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// The abort code
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an initiate download message for a segmented transfer
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create a download segment message
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an expedited download message
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download message
    ///
    /// The client CRC flag is not advertised, matching the behavior observed on the BMS hardware
    /// (initiate command byte 0xC2).
    pub fn initiate_block_download(index: u16, sub: u8, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: false,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create a block download segment
    pub fn block_segment(seqno: u8, last: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::BlockSegment { seqno, last, data }
    }

    /// Create an end block download message
    ///
    /// `valid_bytes` is the number of valid bytes in the final segment (1-7).
    pub fn end_block_download(valid_bytes: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload {
            n: 7 - valid_bytes,
            crc,
        }
    }

    /// Parse a block download segment
    ///
    /// Only valid while a block download is in progress; sequence frames are indistinguishable
    /// from ordinary commands without that context.
    pub fn parse_block_segment(value: &[u8]) -> Result<Self, SdoError> {
        if value.len() < 8 {
            return Err(SdoError::Abort(AbortCode::DataTypeMismatchLengthLow));
        }
        let seqno = value[0] & 0x7f;
        let last = (value[0] & 0x80) != 0;
        let data = value[1..8].try_into().unwrap();
        Ok(SdoRequest::BlockSegment { seqno, last, data })
    }

    /// Serialize to a CAN message with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | (n << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] = (ClientCommand::ReqBlockDownload as u8) << 5
                    | (cc as u8) << 2
                    | (s as u8) << 1;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::BlockSegment { seqno, last, data } => {
                payload[0] = (seqno & 0x7f) | ((last as u8) << 7);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = (ClientCommand::ReqBlockDownload as u8) << 5 | (n & 0x7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }

        CanMessage {
            data: payload,
            dlc: 8,
            id,
        }
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = SdoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(SdoError::Abort(AbortCode::DataTypeMismatchLengthLow));
        }
        let ccs = value[0] >> 5;
        let ccs: ClientCommand = match ccs.try_into() {
            Ok(ccs) => ccs,
            Err(_) => return Err(SdoError::Abort(AbortCode::InvalidCommandSpecifier)),
        };

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (value[0] & (1 << 4)) != 0;
                let n = (value[0] >> 1) & 0x7;
                let c = (value[0] & (1 << 0)) != 0;
                let data = value[1..8].try_into().unwrap();
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let index = value[1] as u16 | ((value[2] as u16) << 8);
                let sub = value[3];
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let index = value[1] as u16 | ((value[2] as u16) << 8);
                let sub = value[3];
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((value[0] >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let index = value[1] as u16 | ((value[2] as u16) << 8);
                let sub = value[3];
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::ReqBlockDownload => {
                if value[0] & 1 == 0 {
                    let cc = (value[0] & (1 << 2)) != 0;
                    let s = (value[0] & (1 << 1)) != 0;
                    let index = value[1] as u16 | ((value[2] as u16) << 8);
                    let sub = value[3];
                    let size = u32::from_le_bytes(value[4..8].try_into().unwrap());
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc,
                        s,
                        index,
                        sub,
                        size,
                    })
                } else {
                    let n = (value[0] >> 2) & 0x7;
                    let crc = u16::from_le_bytes(value[1..3].try_into().unwrap());
                    Ok(SdoRequest::EndBlockDownload { n, crc })
                }
            }
            ClientCommand::ReqBlockUpload => {
                Err(SdoError::Abort(AbortCode::InvalidCommandSpecifier))
            }
        }
    }
}

/// An SDO response, sent from a node's SDO server back to the client
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SdoResponse {
    /// Initiate upload response (expedited value or segmented size)
    ConfirmUpload {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set when there are no more segments
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Acknowledge an initiate download
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Acknowledge a download segment
    ConfirmDownloadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Acknowledge an initiate block download
    ConfirmBlockDownload {
        /// Server CRC supported flag
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Negotiated number of segments per block
        blksize: u8,
    },
    /// Acknowledge a completed (or partially received) block
    ConfirmBlock {
        /// The last sequence number received without gaps
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block download
    ConfirmBlockDownloadEnd,
    /// Abort the in-flight transaction
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// The abort code
        abort_code: u32,
    },
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = ();
    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let scs = msg.data[0] >> 5;
        let command: ServerCommand = scs.try_into()?;
        match command {
            ServerCommand::SegmentUpload => {
                let t = (msg.data[0] & (1 << 4)) != 0;
                let n = (msg.data[0] >> 1) & 7;
                let c = (msg.data[0] & (1 << 0)) != 0;
                let data: [u8; 7] = msg.data[1..8].try_into().unwrap();

                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (msg.data[0] & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (msg.data[0] >> 2) & 0x3;
                let e = (msg.data[0] & (1 << 1)) != 0;
                let s = (msg.data[0] & (1 << 0)) != 0;
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                let data: [u8; 4] = msg.data[4..8].try_into().unwrap();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::BlockDownload => match msg.data[0] & 0x3 {
                0 => {
                    let sc = (msg.data[0] & (1 << 2)) != 0;
                    let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                    let sub = msg.data[3];
                    let blksize = msg.data[4];
                    Ok(SdoResponse::ConfirmBlockDownload {
                        sc,
                        index,
                        sub,
                        blksize,
                    })
                }
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: msg.data[1],
                    blksize: msg.data[2],
                }),
                _ => Err(()),
            },
            ServerCommand::Abort => {
                let index = u16::from_le_bytes(msg.data[1..3].try_into().unwrap());
                let sub = msg.data[3];
                let abort_code = u32::from_le_bytes(msg.data[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// Panics if `data` exceeds 4 bytes.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        if data.len() > 4 {
            panic!("Cannot create expedited upload with more than 4 bytes");
        }

        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: 4 - data.len() as u8,
            data: msg_data,
        }
    }

    /// Create a segmented upload initiate response declaring the total size
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment response
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let n = (7 - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a download acknowledge response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledge response
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a block download initiate acknowledge response
    pub fn block_download_acknowledge(sc: bool, index: u16, sub: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc,
            index,
            sub,
            blksize,
        }
    }

    /// Create a block acknowledge response
    pub fn block_acknowledge(ackseq: u8, blksize: u8) -> SdoResponse {
        SdoResponse::ConfirmBlock { ackseq, blksize }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        let abort_code = abort_code as u32;
        SdoResponse::Abort {
            index,
            sub,
            abort_code,
        }
    }

    /// Serialize to a CAN message with the given COB-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = (ServerCommand::SegmentUpload as u8) << 5
                    | (t as u8) << 4
                    | n << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | (sc as u8) << 2;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 1;
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1] = (index & 0xff) as u8;
                payload[2] = (index >> 8) as u8;
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        CanMessage {
            data: payload,
            dlc: 8,
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: CanId = CanId::Std(0x601);

    #[test]
    fn test_initiate_upload_encoding() {
        let msg = SdoRequest::initiate_upload(0x6060, 0).to_can_message(ID);
        assert_eq!([0x40, 0x60, 0x60, 0x00, 0, 0, 0, 0], msg.data);
    }

    #[test]
    fn test_expedited_download_command_bytes() {
        // 1/2/3/4 byte writes use 0x2F/0x2B/0x27/0x23
        for (len, cmd) in [(1, 0x2Fu8), (2, 0x2B), (3, 0x27), (4, 0x23)] {
            let data = vec![0xAA; len];
            let msg = SdoRequest::expedited_download(0x1F50, 2, &data).to_can_message(ID);
            assert_eq!(cmd, msg.data[0]);
            assert_eq!(&[0x50, 0x1F, 0x02], &msg.data[1..4]);
            assert_eq!(&data[..], &msg.data[4..4 + len]);
        }
    }

    #[test]
    fn test_upload_segment_request_toggle() {
        let msg = SdoRequest::upload_segment_request(false).to_can_message(ID);
        assert_eq!(0x60, msg.data[0]);
        let msg = SdoRequest::upload_segment_request(true).to_can_message(ID);
        assert_eq!(0x70, msg.data[0]);
    }

    #[test]
    fn test_expedited_upload_response_widths() {
        // 0x43/0x47/0x4B/0x4F indicate 4/3/2/1 valid bytes
        for (cmd, n) in [(0x43u8, 0u8), (0x47, 1), (0x4B, 2), (0x4F, 3)] {
            let msg = CanMessage::new(
                CanId::std(0x581),
                &[cmd, 0x60, 0x60, 0x00, 0x00, 0xD8, 0x00, 0x00],
            );
            match SdoResponse::try_from(msg).unwrap() {
                SdoResponse::ConfirmUpload {
                    n: pn,
                    e,
                    s,
                    index,
                    sub,
                    data,
                } => {
                    assert_eq!(n, pn);
                    assert!(e);
                    assert!(s);
                    assert_eq!(0x6060, index);
                    assert_eq!(0, sub);
                    assert_eq!([0x00, 0xD8, 0x00, 0x00], data);
                }
                other => panic!("Unexpected response: {other:?}"),
            }
        }
    }

    #[test]
    fn test_segment_response_parsing() {
        // Segment frames 0x00/0x10/0x20/0x30: bit4 toggle, bit0 no-more-data
        let msg = CanMessage::new(CanId::std(0x581), &[0x10, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            SdoResponse::UploadSegment {
                t: true,
                n: 0,
                c: false,
                data: [1, 2, 3, 4, 5, 6, 7]
            },
            msg.try_into().unwrap()
        );
        // Final segment, 3 valid bytes (n=4), toggle 0
        let msg = CanMessage::new(CanId::std(0x581), &[0x09, 8, 9, 10, 0, 0, 0, 0]);
        assert_eq!(
            SdoResponse::UploadSegment {
                t: false,
                n: 4,
                c: true,
                data: [8, 9, 10, 0, 0, 0, 0]
            },
            msg.try_into().unwrap()
        );
    }

    #[test]
    fn test_block_download_initiate_encoding() {
        let msg = SdoRequest::initiate_block_download(0x1F50, 1, 8192).to_can_message(ID);
        assert_eq!(0xC2, msg.data[0]);
        assert_eq!(&[0x50, 0x1F, 0x01], &msg.data[1..4]);
        assert_eq!(&8192u32.to_le_bytes(), &msg.data[4..8]);
    }

    #[test]
    fn test_block_initiate_ack_parsing() {
        let msg = CanMessage::new(
            CanId::std(0x581),
            &[0xA4, 0x50, 0x1F, 0x01, 127, 0, 0, 0],
        );
        assert_eq!(
            SdoResponse::ConfirmBlockDownload {
                sc: true,
                index: 0x1F50,
                sub: 1,
                blksize: 127
            },
            msg.try_into().unwrap()
        );
    }

    #[test]
    fn test_block_ack_parsing() {
        let msg = CanMessage::new(CanId::std(0x581), &[0xA2, 93, 127, 0, 0, 0, 0, 0]);
        assert_eq!(
            SdoResponse::ConfirmBlock {
                ackseq: 93,
                blksize: 127
            },
            msg.try_into().unwrap()
        );
    }

    #[test]
    fn test_block_segment_encoding() {
        let msg = SdoRequest::block_segment(5, false, &[1, 2, 3, 4, 5, 6, 7]).to_can_message(ID);
        assert_eq!([5, 1, 2, 3, 4, 5, 6, 7], msg.data);
        let msg = SdoRequest::block_segment(9, true, &[0xFF]).to_can_message(ID);
        assert_eq!(0x89, msg.data[0]);
    }

    #[test]
    fn test_end_block_download_encoding() {
        // 3 valid bytes in last segment -> n=4
        let msg = SdoRequest::end_block_download(3, 0xBEEF).to_can_message(ID);
        assert_eq!(0xC1 | 4 << 2, msg.data[0]);
        assert_eq!(&[0xEF, 0xBE], &msg.data[1..3]);
    }

    #[test]
    fn test_abort_code_mapping() {
        assert_eq!(
            RawAbortCode::Valid(AbortCode::NoSuchObject),
            0x0602_0000u32.into()
        );
        assert_eq!(
            RawAbortCode::Valid(AbortCode::SdoTimeout),
            0x0504_0000u32.into()
        );
        assert_eq!(
            RawAbortCode::Valid(AbortCode::DataTypeMismatchLengthHigh),
            0x0607_0012u32.into()
        );
        assert_eq!(
            RawAbortCode::Valid(AbortCode::CantStoreDeviceState),
            0x0800_0022u32.into()
        );
        assert_eq!(RawAbortCode::Unknown(0x1234_5678), 0x1234_5678u32.into());
        assert_eq!(0x1234_5678, RawAbortCode::Unknown(0x1234_5678).code());
    }

    #[test]
    fn test_abort_roundtrip() {
        let msg =
            SdoRequest::abort(0x6060, 0, AbortCode::ToggleNotAlternated).to_can_message(ID);
        assert_eq!(0x80, msg.data[0]);
        let parsed: SdoRequest = msg.data().try_into().unwrap();
        assert_eq!(
            SdoRequest::Abort {
                index: 0x6060,
                sub: 0,
                abort_code: 0x0503_0000
            },
            parsed
        );
    }
}
