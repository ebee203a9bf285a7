//! Inbound frame dispatch keyed by COB-ID
//!
//! A single task owns the bus receive half and routes each parsed frame to its consumer: SDO
//! responses to the matching node's channel, heartbeats to the liveness monitor, TPDOs to the PDO
//! decoder. Routing is a single channel hand-off; all waiting happens in the per-node tasks.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bmscan_common::{
    messages::{BmscanMessage, Heartbeat, MessageError, PdoFrame},
    traits::AsyncCanReceiver,
    CanMessage,
};
use tokio::{
    sync::mpsc::{channel, error::TrySendError, Receiver, Sender},
    task::JoinHandle,
};

const CHANNEL_DEPTH: usize = 100;

/// Error returned when receiving on a closed dispatcher channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosedError;

impl core::fmt::Display for ChannelClosedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Dispatcher channel closed")
    }
}
impl std::error::Error for ChannelClosedError {}

#[derive(Debug)]
struct DispatcherInner {
    sdo_channels: HashMap<u8, Sender<CanMessage>>,
    heartbeat_tx: Option<Sender<Heartbeat>>,
    pdo_tx: Option<Sender<PdoFrame>>,
}

/// Routes inbound bus frames to per-consumer channels
#[derive(Debug)]
pub struct Dispatcher {
    _task_handle: JoinHandle<()>,
    inner: Arc<Mutex<DispatcherInner>>,
}

impl Dispatcher {
    /// Create a dispatcher, spawning the receive pump task on `receiver`
    pub fn new<R: AsyncCanReceiver + 'static>(mut receiver: R) -> Self {
        let inner = Arc::new(Mutex::new(DispatcherInner {
            sdo_channels: HashMap::new(),
            heartbeat_tx: None,
            pdo_tx: None,
        }));
        let inner_clone = inner.clone();
        let task_handle = tokio::spawn(async move {
            let mut backoff = Duration::from_millis(100);
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        backoff = Duration::from_millis(100);
                        Self::route(&inner_clone, msg);
                    }
                    Err(e) => {
                        // Transport failure. Retry with backoff; polling tasks will observe
                        // timeouts until the bus comes back.
                        log::error!("CAN receive error: {e}, retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(5));
                    }
                }
            }
        });
        Self {
            _task_handle: task_handle,
            inner,
        }
    }

    fn route(inner: &Arc<Mutex<DispatcherInner>>, msg: CanMessage) {
        let parsed: BmscanMessage = match msg.try_into() {
            Ok(m) => m,
            // Non-CANopen traffic sharing the bus is ignored
            Err(MessageError::UnrecognizedId { .. }) => return,
            Err(e) => {
                log::debug!("Ignoring malformed frame: {e}");
                return;
            }
        };

        let mut inner = inner.lock().unwrap();
        match parsed {
            BmscanMessage::SdoResponse { node, response: _ } => {
                let mut closed = false;
                if let Some(tx) = inner.sdo_channels.get(&node) {
                    match tx.try_send(msg) {
                        Ok(()) => (),
                        Err(TrySendError::Full(_)) => {
                            log::warn!("Dropped SDO response for node {node} due to overflow")
                        }
                        Err(TrySendError::Closed(_)) => closed = true,
                    }
                }
                if closed {
                    inner.sdo_channels.remove(&node);
                }
            }
            BmscanMessage::Heartbeat(heartbeat) => {
                let mut closed = false;
                if let Some(tx) = &inner.heartbeat_tx {
                    match tx.try_send(heartbeat) {
                        Ok(()) => (),
                        Err(TrySendError::Full(_)) => {
                            log::warn!("Dropped heartbeat from node {} due to overflow", heartbeat.node)
                        }
                        Err(TrySendError::Closed(_)) => closed = true,
                    }
                }
                if closed {
                    inner.heartbeat_tx = None;
                }
            }
            BmscanMessage::Tpdo(frame) => {
                let mut closed = false;
                if let Some(tx) = &inner.pdo_tx {
                    match tx.try_send(frame) {
                        Ok(()) => (),
                        Err(TrySendError::Full(_)) => {
                            log::warn!("Dropped TPDO{} from node {} due to overflow", frame.pdo, frame.node)
                        }
                        Err(TrySendError::Closed(_)) => closed = true,
                    }
                }
                if closed {
                    inner.pdo_tx = None;
                }
            }
            BmscanMessage::Emcy(emcy) => {
                log::warn!(
                    "EMCY from node {}: code {:04X}, register {:02X}",
                    emcy.node,
                    emcy.error_code,
                    emcy.error_register
                );
            }
            // Our own requests echoed back, NMT commands, and SYNC need no routing
            _ => (),
        }
    }

    /// Create the SDO response channel for a node
    ///
    /// Replaces any previously created channel for the same node.
    pub fn sdo_channel(&self, node_id: u8) -> SdoChannel {
        let (tx, rx) = channel(CHANNEL_DEPTH);
        self.inner
            .lock()
            .unwrap()
            .sdo_channels
            .insert(node_id, tx);
        SdoChannel { receiver: rx }
    }

    /// Create the heartbeat channel consumed by the liveness monitor
    pub fn heartbeat_channel(&self) -> Receiver<Heartbeat> {
        let (tx, rx) = channel(CHANNEL_DEPTH);
        self.inner.lock().unwrap().heartbeat_tx = Some(tx);
        rx
    }

    /// Create the TPDO channel consumed by the PDO decoder
    pub fn pdo_channel(&self) -> Receiver<PdoFrame> {
        let (tx, rx) = channel(CHANNEL_DEPTH);
        self.inner.lock().unwrap().pdo_tx = Some(tx);
        rx
    }
}

/// The receive side of one node's SDO response channel
///
/// Frames for a node are delivered in bus arrival order.
#[derive(Debug)]
pub struct SdoChannel {
    receiver: Receiver<CanMessage>,
}

impl AsyncCanReceiver for SdoChannel {
    type Error = ChannelClosedError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        Ok(self.receiver.try_recv().ok())
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.receiver.recv().await.ok_or(ChannelClosedError)
    }
}
