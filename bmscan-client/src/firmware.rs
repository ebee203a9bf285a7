//! Firmware update session for the BMS bootloader
//!
//! Streams a firmware image to the program data object (0x1F50:1) using the SDO block download
//! protocol, framed by program control writes (0x1F50:2) that stop the application, erase the
//! flash area, and start the new program.
//!
//! A failed or cancelled transfer is not resumable: the bootloader discards partial writes, so a
//! new session always restarts from offset 0.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bmscan_common::{
    constants::{object_ids, program_subs, values},
    sdo::{AbortCode, RawAbortCode},
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};
use crc16::CrcType as _;
use snafu::{ResultExt, Snafu};
use tokio::sync::{watch, Mutex};

use crate::sdo_client::{SdoClient, SdoClientError};

/// Errors terminating a firmware update session
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum FirmwareError {
    /// The provided image is empty
    EmptyImage,
    /// A program control write failed
    #[snafu(display("Program control '{step}' write failed: {source}"))]
    Control {
        /// Which control step failed
        step: &'static str,
        /// The underlying SDO error
        source: SdoClientError,
    },
    /// The device aborted the transfer
    ///
    /// Typical codes are 0x06070012 when a late flash write fails and 0x08000022 when
    /// verification of the written image fails. The session is terminal either way.
    #[snafu(display("Transfer aborted by device: {abort_code:?}"))]
    TransferAborted {
        /// The abort code reported by the device
        abort_code: RawAbortCode,
    },
    /// The device stopped responding during the transfer
    TransferTimeout,
    /// The session was cancelled by the caller
    Cancelled,
    /// The transfer failed for a protocol-level reason
    #[snafu(display("Transfer failed: {source}"))]
    Transfer {
        /// The underlying SDO error
        source: SdoClientError,
    },
}

/// The state of a firmware update session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transfer started yet
    Idle,
    /// The block download initiate request has been sent
    InitiateSent,
    /// Image blocks are being streamed
    BlockTransferring,
    /// The end-of-transfer request has been sent
    EndSent,
    /// The transfer finished and the program was started
    Complete,
    /// The session ended in an abort, timeout, or cancellation
    Aborted,
}

/// Progress of a firmware update session, published via a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Current session state
    pub state: SessionState,
    /// Image bytes acknowledged by the device so far
    pub bytes_sent: usize,
    /// Total image size
    pub total: usize,
}

/// Handle for cancelling a running firmware update from another task
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation
    ///
    /// The session aborts at the next block boundary, sending an abort frame so the device's
    /// flash state machine is not left waiting for more segments.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Drives a firmware update for a single node
///
/// The updater shares the node's exclusive SDO slot with routine polling: while a session runs,
/// polls of the same node queue behind it, and other nodes are unaffected.
pub struct FirmwareUpdater<S, R> {
    node_id: NodeId,
    slot: Arc<Mutex<SdoClient<S, R>>>,
    progress_tx: watch::Sender<TransferProgress>,
    cancel: Arc<AtomicBool>,
}

impl<S: AsyncCanSender, R: AsyncCanReceiver> FirmwareUpdater<S, R> {
    /// Create an updater for the node served by the given SDO client slot
    pub fn new(node_id: NodeId, slot: Arc<Mutex<SdoClient<S, R>>>) -> Self {
        let (progress_tx, _) = watch::channel(TransferProgress {
            state: SessionState::Idle,
            bytes_sent: 0,
            total: 0,
        });
        Self {
            node_id,
            slot,
            progress_tx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to transfer progress
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_tx.subscribe()
    }

    /// Get a handle for cancelling a running session
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Run a complete update session: stop the application, erase the program area, stream the
    /// image, and start the new program.
    ///
    /// Not resumable: any failure leaves the session in [`SessionState::Aborted`] and a retry
    /// must restart from offset 0.
    pub async fn update(&self, image: &[u8]) -> Result<(), FirmwareError> {
        if image.is_empty() {
            return EmptyImageSnafu.fail();
        }
        self.cancel.store(false, Ordering::Relaxed);

        // Hold the node's SDO slot for the entire session
        let mut client = self.slot.lock().await;

        log::info!(
            "Node {}: starting firmware update, {} bytes",
            self.node_id,
            image.len()
        );

        client
            .write_u8(
                object_ids::PROGRAM,
                program_subs::CONTROL,
                values::PROGRAM_CTRL_STOP,
            )
            .await
            .context(ControlSnafu { step: "stop" })?;
        client
            .write_u8(
                object_ids::PROGRAM,
                program_subs::CONTROL,
                values::PROGRAM_CTRL_CLEAR,
            )
            .await
            .context(ControlSnafu { step: "clear" })?;

        match self.transfer(&mut client, image).await {
            Ok(()) => {
                client
                    .write_u8(
                        object_ids::PROGRAM,
                        program_subs::CONTROL,
                        values::PROGRAM_CTRL_START,
                    )
                    .await
                    .context(ControlSnafu { step: "start" })?;
                self.set_progress(SessionState::Complete, image.len(), image.len());
                log::info!("Node {}: firmware update complete", self.node_id);
                Ok(())
            }
            Err(e) => {
                self.set_progress(SessionState::Aborted, self.bytes_sent(), image.len());
                log::error!("Node {}: firmware update failed: {e}", self.node_id);
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        client: &mut SdoClient<S, R>,
        image: &[u8],
    ) -> Result<(), FirmwareError> {
        let index = object_ids::PROGRAM;
        let sub = program_subs::DATA;
        let total = image.len();

        self.set_progress(SessionState::InitiateSent, 0, total);
        let mut blksize = client
            .block_initiate(index, sub, total as u32)
            .await
            .map_err(map_sdo_error)?;

        let total_segments = total.div_ceil(7);
        let mut next_segment = 0usize;
        self.set_progress(SessionState::BlockTransferring, 0, total);

        while next_segment < total_segments {
            if self.cancel.load(Ordering::Relaxed) {
                // Close the transaction so the device is not left mid-block
                client.send_abort(index, sub, AbortCode::GeneralError).await;
                return CancelledSnafu.fail();
            }

            let sent = client
                .send_block_segments(image, next_segment, blksize)
                .await
                .map_err(map_sdo_error)?;
            let (ackseq, next_blksize) = client
                .block_wait_ack(index, sub)
                .await
                .map_err(map_sdo_error)?;

            if ackseq as usize > sent {
                return Err(FirmwareError::Transfer {
                    source: SdoClientError::MalformedResponse,
                });
            }
            if (ackseq as usize) < sent {
                // The server missed segments; resume from the one after its ack rather than
                // restarting the session
                log::warn!(
                    "Node {}: block ack {ackseq} of {sent} segments, retransmitting",
                    self.node_id
                );
            }
            next_segment += ackseq as usize;
            blksize = next_blksize;
            self.set_progress(
                SessionState::BlockTransferring,
                (next_segment * 7).min(total),
                total,
            );
        }

        let crc = crc16::XMODEM::get(crc16::XMODEM::update(crc16::XMODEM::init(), image));
        self.set_progress(SessionState::EndSent, total, total);
        client
            .block_end(index, sub, image, crc)
            .await
            .map_err(map_sdo_error)?;
        Ok(())
    }

    fn set_progress(&self, state: SessionState, bytes_sent: usize, total: usize) {
        self.progress_tx.send_replace(TransferProgress {
            state,
            bytes_sent,
            total,
        });
    }

    fn bytes_sent(&self) -> usize {
        self.progress_tx.borrow().bytes_sent
    }
}

fn map_sdo_error(e: SdoClientError) -> FirmwareError {
    match e {
        SdoClientError::ServerAbort { abort_code, .. } => {
            FirmwareError::TransferAborted { abort_code }
        }
        SdoClientError::ProtocolTimeout => FirmwareError::TransferTimeout,
        source => FirmwareError::Transfer { source },
    }
}
