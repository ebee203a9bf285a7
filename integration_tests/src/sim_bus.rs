//! An in-process CAN bus for integration tests
//!
//! Every sender broadcasts to every receiver, like a real bus with no arbitration or loss.
//! Receivers only see frames sent after they were created.
use bmscan_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanMessage,
};
use tokio::sync::broadcast;

const QSIZE: usize = 256;

/// A simulated CAN bus
#[derive(Debug, Clone)]
pub struct SimBus {
    tx: broadcast::Sender<CanMessage>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    /// Create a new bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(QSIZE);
        Self { tx }
    }

    /// Create a sender attached to the bus
    pub fn new_sender(&self) -> SimBusSender {
        SimBusSender {
            tx: self.tx.clone(),
        }
    }

    /// Create a receiver attached to the bus
    pub fn new_receiver(&self) -> SimBusReceiver {
        SimBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// Send half of a [SimBus] attachment
#[derive(Debug)]
pub struct SimBusSender {
    tx: broadcast::Sender<CanMessage>,
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        // Fails only when no receiver is attached, which means the bus is gone
        self.tx.send(msg).map(|_| ()).map_err(|_| CanSendError(msg))
    }
}

/// Error returned when the bus has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusClosedError;

impl core::fmt::Display for BusClosedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sim bus closed")
    }
}
impl std::error::Error for BusClosedError {}

/// Receive half of a [SimBus] attachment
#[derive(Debug)]
pub struct SimBusReceiver {
    rx: broadcast::Receiver<CanMessage>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = BusClosedError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Ok(Some(msg)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("Sim bus receiver lagged, dropped {n} frames");
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusClosedError),
            }
        }
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Sim bus receiver lagged, dropped {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusClosedError),
            }
        }
    }
}
