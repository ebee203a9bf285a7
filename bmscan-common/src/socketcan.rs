use std::sync::Arc;

use crate::{
    messages::{CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};
use snafu::Snafu;

use socketcan::{tokio::CanSocket, CanFrame, EmbeddedFrame, Frame, IoError};

fn socketcan_id_to_bmscan_id(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn bmscan_id_to_socketcan_id(id: CanId) -> socketcan::CanId {
    match id {
        CanId::Extended(id) => socketcan::ExtendedId::new(id).unwrap().into(),
        CanId::Std(id) => socketcan::StandardId::new(id).unwrap().into(),
    }
}

fn bmscan_message_to_socket_frame(msg: CanMessage) -> socketcan::CanFrame {
    let id = bmscan_id_to_socketcan_id(msg.id());
    socketcan::CanFrame::new(id, msg.data()).unwrap()
}

/// Receive half of an opened socketcan device
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

/// Error returned by [SocketCanReceiver]
#[derive(Debug, Snafu)]
pub enum ReceiveError {
    /// An IO error on the underlying socket
    Io {
        /// The underlying error
        source: IoError,
    },
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = ReceiveError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        // The tokio socket has no non-blocking read; the dispatcher only uses recv()
        Ok(None)
    }

    async fn recv(&mut self) -> Result<CanMessage, ReceiveError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => match frame {
                    CanFrame::Data(frame) => {
                        let id = socketcan_id_to_bmscan_id(frame.can_id());
                        return Ok(CanMessage::new(id, frame.data()));
                    }
                    // Remote and error frames carry nothing the engine consumes
                    CanFrame::Remote(_) => continue,
                    CanFrame::Error(frame) => {
                        log::warn!("CAN error frame received: {frame:?}");
                        continue;
                    }
                },
                Err(e) => {
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                    ) {
                        continue;
                    }
                    return Err(ReceiveError::Io { source: e });
                }
            }
        }
    }
}

/// Send half of an opened socketcan device
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let socketcan_frame = bmscan_message_to_socket_frame(msg);

        let result = self.socket.write_frame(socketcan_frame).await;
        if result.is_err() {
            Err(CanSendError(msg))
        } else {
            Ok(())
        }
    }
}

/// Open a socketcan device and split it into a sender and receiver object
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
///
/// A key benefit of this is that by creating both sender and receiver objects from a shared
/// socket, the receiver will not receive messages sent by the sender.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), IoError> {
    let device: &str = device.as_ref();
    let socket = CanSocket::open(device)?;
    let socket = Arc::new(socket);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
