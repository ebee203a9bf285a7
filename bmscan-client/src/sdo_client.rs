//! SDO client for reading and writing a node's object dictionary
use std::time::Duration;

use bmscan_common::{
    constants::object_ids,
    sdo::{AbortCode, RawAbortCode, SdoRequest, SdoResponse},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId,
};
use crc16::CrcType as _;
use snafu::Snafu;

/// Default time to wait for an SDO response before aborting the transaction
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors returned by [SdoClient] operations
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum SdoClientError {
    /// No response arrived within the timeout
    ///
    /// An abort frame has already been sent to close the transaction on the server side.
    ProtocolTimeout,
    /// A response was received but could not be parsed
    MalformedResponse,
    /// A valid response was received which does not belong to the current transaction
    UnexpectedResponse,
    /// The server aborted the transaction
    #[snafu(display("Server abort on {index:04X}:{sub:02X}: {abort_code:?}"))]
    ServerAbort {
        /// The aborted object index
        index: u16,
        /// The aborted object sub-index
        sub: u8,
        /// The reported abort code
        abort_code: RawAbortCode,
    },
    /// A segment arrived with the wrong toggle value
    ToggleNotAlternated,
    /// The frame could not be transmitted on the bus
    SendFailed,
    /// The receive channel was closed; the engine transport is down
    TransportClosed,
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// The contents of a node's identity object (0x1018)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// CiA vendor ID
    pub vendor_id: u32,
    /// Product code
    pub product_code: u32,
    /// Revision number
    pub revision: u32,
    /// Serial number
    pub serial: u32,
}

/// A client for a single node's SDO server
///
/// Implements expedited, segmented, and block transfers. One instance serves exactly one node, and
/// only one transaction may be in flight at a time; the engine wraps each client in a per-node
/// lock to enforce this (see `BmsManager`).
pub struct SdoClient<S, R> {
    req_cob_id: CanId,
    resp_cob_id: CanId,
    sender: S,
    receiver: R,
    timeout: Duration,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> SdoClient<S, R> {
    /// Create a client for a node using the standard SDO COB-IDs
    pub fn new_std(server_node_id: u8, sender: S, receiver: R) -> Self {
        Self {
            req_cob_id: CanId::Std(0x600 + server_node_id as u16),
            resp_cob_id: CanId::Std(0x580 + server_node_id as u16),
            sender,
            receiver,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Set the response timeout for this client
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the configured response timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write a value to an object on the server
    pub async fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.flush_stale();
        if data.len() <= 4 {
            // Do an expedited transfer
            let msg =
                SdoRequest::expedited_download(index, sub, data).to_can_message(self.req_cob_id);
            self.send(msg).await?;

            let resp = self.expect_response(index, sub).await?;
            match resp {
                SdoResponse::ConfirmDownload { index: _, sub: _ } => Ok(()),
                SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                } => ServerAbortSnafu {
                    index,
                    sub,
                    abort_code: RawAbortCode::from(abort_code),
                }
                .fail(),
                _ => UnexpectedResponseSnafu.fail(),
            }
        } else {
            let msg = SdoRequest::initiate_download(index, sub, Some(data.len() as u32))
                .to_can_message(self.req_cob_id);
            self.send(msg).await?;

            let resp = self.expect_response(index, sub).await?;
            match resp {
                SdoResponse::ConfirmDownload { index: _, sub: _ } => (),
                SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                } => {
                    return ServerAbortSnafu {
                        index,
                        sub,
                        abort_code: RawAbortCode::from(abort_code),
                    }
                    .fail()
                }
                _ => return UnexpectedResponseSnafu.fail(),
            }

            let mut toggle = false;
            // Send segments
            let total_segments = data.len().div_ceil(7);
            for n in 0..total_segments {
                let last_segment = n == total_segments - 1;
                let segment_size = (data.len() - n * 7).min(7);
                let seg_msg = SdoRequest::download_segment(
                    toggle,
                    last_segment,
                    &data[n * 7..n * 7 + segment_size],
                )
                .to_can_message(self.req_cob_id);
                self.send(seg_msg).await?;
                let resp = self.expect_response(index, sub).await?;
                match resp {
                    SdoResponse::ConfirmDownloadSegment { t } => {
                        if t != toggle {
                            self.send_abort(index, sub, AbortCode::ToggleNotAlternated)
                                .await;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                    }
                    SdoResponse::Abort {
                        index,
                        sub,
                        abort_code,
                    } => {
                        return ServerAbortSnafu {
                            index,
                            sub,
                            abort_code: RawAbortCode::from(abort_code),
                        }
                        .fail()
                    }
                    _ => return UnexpectedResponseSnafu.fail(),
                }
                toggle = !toggle;
            }
            Ok(())
        }
    }

    /// Read the value of an object on the server
    ///
    /// For expedited transfers the full 4-byte data field is returned rather than the width
    /// indicated by the size bits: the BMS firmware answers 0x4F (one valid byte) even for
    /// multi-byte objects, so width selection is left to the object catalog. Segmented transfers
    /// return exactly the number of bytes declared in the initiate response.
    pub async fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.flush_stale();
        let mut read_buf = Vec::new();

        let msg = SdoRequest::initiate_upload(index, sub).to_can_message(self.req_cob_id);
        self.send(msg).await?;

        let resp = self.expect_response(index, sub).await?;

        let (expedited, expected_size) = match resp {
            SdoResponse::ConfirmUpload {
                n: _,
                e,
                s,
                index: _,
                sub: _,
                data,
            } => {
                if e {
                    read_buf.extend_from_slice(&data);
                    (true, None)
                } else {
                    let size = s.then(|| u32::from_le_bytes(data));
                    (false, size)
                }
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                return ServerAbortSnafu {
                    index,
                    sub,
                    abort_code: RawAbortCode::from(abort_code),
                }
                .fail()
            }
            _ => return UnexpectedResponseSnafu.fail(),
        };

        if !expedited {
            // Read segments
            let mut toggle = false;
            loop {
                let msg =
                    SdoRequest::upload_segment_request(toggle).to_can_message(self.req_cob_id);
                self.send(msg).await?;

                let resp = self.expect_response(index, sub).await?;
                match resp {
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            self.send_abort(index, sub, AbortCode::ToggleNotAlternated)
                                .await;
                            return ToggleNotAlternatedSnafu.fail();
                        }
                        read_buf.extend_from_slice(&data[0..7 - n as usize]);
                        if c {
                            // Transfer complete
                            break;
                        }
                    }
                    SdoResponse::Abort {
                        index,
                        sub,
                        abort_code,
                    } => {
                        return ServerAbortSnafu {
                            index,
                            sub,
                            abort_code: RawAbortCode::from(abort_code),
                        }
                        .fail()
                    }
                    _ => return UnexpectedResponseSnafu.fail(),
                }
                toggle = !toggle;
            }
            // The final frame is padded to 8 bytes; drop padding beyond the declared size
            if let Some(size) = expected_size {
                read_buf.truncate(size as usize);
            }
        }
        Ok(read_buf)
    }

    /// Write a large object using the SDO block download protocol
    ///
    /// `data` must not be empty. A block ack reporting fewer segments than were sent causes
    /// retransmission starting at the segment after the acknowledged one, per the block transfer
    /// recovery rule.
    pub async fn block_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        self.flush_stale();
        let mut blksize = self.block_initiate(index, sub, data.len() as u32).await?;

        let total_segments = data.len().div_ceil(7);
        let mut next_segment = 0usize;
        while next_segment < total_segments {
            let sent = self.send_block_segments(data, next_segment, blksize).await?;
            let (ackseq, next_blksize) = self.block_wait_ack(index, sub).await?;
            if ackseq as usize > sent {
                return MalformedResponseSnafu.fail();
            }
            // Resume after the last in-order segment the server received. A short ack
            // retransmits from ackseq+1 rather than restarting or aborting.
            next_segment += ackseq as usize;
            blksize = next_blksize;
        }

        let crc = crc16::XMODEM::get(crc16::XMODEM::update(crc16::XMODEM::init(), data));
        self.block_end(index, sub, data, crc).await
    }

    pub(crate) async fn block_initiate(&mut self, index: u16, sub: u8, size: u32) -> Result<u8> {
        let msg =
            SdoRequest::initiate_block_download(index, sub, size).to_can_message(self.req_cob_id);
        self.send(msg).await?;
        let resp = self.expect_response(index, sub).await?;
        match resp {
            SdoResponse::ConfirmBlockDownload {
                sc: _,
                index: ri,
                sub: rs,
                blksize,
            } => {
                if ri != index || rs != sub || blksize == 0 || blksize > 127 {
                    return MalformedResponseSnafu.fail();
                }
                Ok(blksize)
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => ServerAbortSnafu {
                index,
                sub,
                abort_code: RawAbortCode::from(abort_code),
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    /// Send one block's worth of sequence-numbered segments, starting at segment index
    /// `next_segment` of `data`. Returns the number of segments sent.
    pub(crate) async fn send_block_segments(
        &mut self,
        data: &[u8],
        next_segment: usize,
        blksize: u8,
    ) -> Result<usize> {
        let total_segments = data.len().div_ceil(7);
        let count = (blksize as usize).min(total_segments - next_segment);
        for i in 0..count {
            let seg = next_segment + i;
            let begin = seg * 7;
            let end = (begin + 7).min(data.len());
            let last = seg == total_segments - 1;
            let msg = SdoRequest::block_segment((i + 1) as u8, last, &data[begin..end])
                .to_can_message(self.req_cob_id);
            self.send(msg).await?;
        }
        Ok(count)
    }

    pub(crate) async fn block_wait_ack(&mut self, index: u16, sub: u8) -> Result<(u8, u8)> {
        let resp = self.expect_response(index, sub).await?;
        match resp {
            SdoResponse::ConfirmBlock { ackseq, blksize } => Ok((ackseq, blksize)),
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => ServerAbortSnafu {
                index,
                sub,
                abort_code: RawAbortCode::from(abort_code),
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    pub(crate) async fn block_end(
        &mut self,
        index: u16,
        sub: u8,
        data: &[u8],
        crc: u16,
    ) -> Result<()> {
        let valid_bytes = data.len() - (data.len().div_ceil(7) - 1) * 7;
        let msg =
            SdoRequest::end_block_download(valid_bytes as u8, crc).to_can_message(self.req_cob_id);
        self.send(msg).await?;
        match self.expect_response(index, sub).await? {
            SdoResponse::ConfirmBlockDownloadEnd => Ok(()),
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => ServerAbortSnafu {
                index,
                sub,
                abort_code: RawAbortCode::from(abort_code),
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    /// Read a u8 object value
    pub async fn read_u8(&mut self, index: u16, sub: u8) -> Result<u8> {
        let data = self.upload(index, sub).await?;
        if data.is_empty() {
            return MalformedResponseSnafu.fail();
        }
        Ok(data[0])
    }

    /// Read a u16 object value
    pub async fn read_u16(&mut self, index: u16, sub: u8) -> Result<u16> {
        let data = self.upload(index, sub).await?;
        if data.len() < 2 {
            return MalformedResponseSnafu.fail();
        }
        Ok(u16::from_le_bytes(data[0..2].try_into().unwrap()))
    }

    /// Read a u32 object value
    pub async fn read_u32(&mut self, index: u16, sub: u8) -> Result<u32> {
        let data = self.upload(index, sub).await?;
        if data.len() < 4 {
            return MalformedResponseSnafu.fail();
        }
        Ok(u32::from_le_bytes(data[0..4].try_into().unwrap()))
    }

    /// Read an i16 object value
    pub async fn read_i16(&mut self, index: u16, sub: u8) -> Result<i16> {
        self.read_u16(index, sub).await.map(|v| v as i16)
    }

    /// Read an i32 object value
    pub async fn read_i32(&mut self, index: u16, sub: u8) -> Result<i32> {
        self.read_u32(index, sub).await.map(|v| v as i32)
    }

    /// Read a visible string object value
    ///
    /// The value is truncated at the first NUL byte.
    pub async fn read_string(&mut self, index: u16, sub: u8) -> Result<String> {
        let mut data = self.upload(index, sub).await?;
        if let Some(nul) = data.iter().position(|&b| b == 0) {
            data.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Write a u8 object value
    pub async fn write_u8(&mut self, index: u16, sub: u8, value: u8) -> Result<()> {
        self.download(index, sub, &[value]).await
    }

    /// Write a u16 object value
    pub async fn write_u16(&mut self, index: u16, sub: u8, value: u16) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u32 object value
    pub async fn write_u32(&mut self, index: u16, sub: u8, value: u32) -> Result<()> {
        self.download(index, sub, &value.to_le_bytes()).await
    }

    /// Read the node's identity object (0x1018)
    pub async fn read_identity(&mut self) -> Result<Identity> {
        let vendor_id = self.read_u32(object_ids::IDENTITY, 1).await?;
        let product_code = self.read_u32(object_ids::IDENTITY, 2).await?;
        let revision = self.read_u32(object_ids::IDENTITY, 3).await?;
        let serial = self.read_u32(object_ids::IDENTITY, 4).await?;
        Ok(Identity {
            vendor_id,
            product_code,
            revision,
            serial,
        })
    }

    /// Read the node's device name (0x1008)
    pub async fn read_device_name(&mut self) -> Result<String> {
        self.read_string(object_ids::DEVICE_NAME, 0).await
    }

    pub(crate) async fn send(&mut self, msg: bmscan_common::CanMessage) -> Result<()> {
        self.sender.send(msg).await.map_err(|_| SendFailedSnafu.build())
    }

    /// Send an abort frame for the current transaction. Best effort; a failed send is only
    /// logged, since the transaction is already being torn down.
    pub(crate) async fn send_abort(&mut self, index: u16, sub: u8, code: AbortCode) {
        let msg = SdoRequest::abort(index, sub, code).to_can_message(self.req_cob_id);
        if self.sender.send(msg).await.is_err() {
            log::warn!("Failed to send abort for {index:04X}:{sub:02X}");
        }
    }

    /// Wait for the next response from this node's SDO server, sending an abort to close the
    /// transaction if the timeout elapses first.
    pub(crate) async fn expect_response(&mut self, index: u16, sub: u8) -> Result<SdoResponse> {
        match self.wait_for_response().await {
            Err(SdoClientError::ProtocolTimeout) => {
                self.send_abort(index, sub, AbortCode::SdoTimeout).await;
                ProtocolTimeoutSnafu.fail()
            }
            other => other,
        }
    }

    async fn wait_for_response(&mut self) -> Result<SdoResponse> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(_)) => return TransportClosedSnafu.fail(),
                Err(_) => return ProtocolTimeoutSnafu.fail(),
            };
            if msg.id == self.resp_cob_id {
                return msg.try_into().map_err(|_| MalformedResponseSnafu.build());
            }
        }
    }

    /// Drop any responses left over from a previous (e.g. timed out) transaction
    fn flush_stale(&mut self) {
        let _ = self.receiver.flush();
    }
}
