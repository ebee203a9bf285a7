//! The engine tying the bus, per-node SDO slots, liveness, and telemetry together
use std::{collections::HashMap, sync::Arc, time::Duration};

use bmscan_common::{
    dictionary::{find_entry, DictEntry, TELEMETRY_ENTRIES},
    messages::{NmtCommand, NmtCommandCmd},
    traits::{AsyncCanReceiver, AsyncCanSender},
    NodeId,
};
use futures::future::join_all;
use snafu::Snafu;
use tokio::{
    sync::{mpsc, Mutex, OwnedMutexGuard},
    task::JoinHandle,
};

use crate::{
    bus::{Dispatcher, SdoChannel, SharedSender},
    config::BusConfig,
    firmware::FirmwareUpdater,
    liveness::{HeartbeatMonitor, NodeStatus},
    sdo_client::{Identity, SdoClient, SdoClientError},
    telemetry::{self, Metric},
};

/// How often the liveness task checks for heartbeat expiry
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Depth of the outbound metric channel
const METRIC_CHANNEL_DEPTH: usize = 256;

/// Errors returned by [BmsManager] operations
#[derive(Debug, Snafu)]
pub enum ManagerError {
    /// The node is not in the configured node set
    #[snafu(display("Node {node_id} is not configured"))]
    UnknownNode {
        /// The requested node ID
        node_id: u8,
    },
    /// An SDO transaction is already in flight for the node
    ///
    /// Retry after backoff; never override an in-flight transaction.
    #[snafu(display("An SDO transaction is already in flight for node {node_id}"))]
    Busy {
        /// The busy node's ID
        node_id: u8,
    },
    /// An NMT command could not be transmitted
    SendFailed,
    /// An SDO operation failed
    #[snafu(display("SDO error: {source}"))]
    Sdo {
        /// The underlying error
        source: SdoClientError,
    },
}

type Slot<S> = Arc<Mutex<SdoClient<SharedSender<S>, SdoChannel>>>;

/// An exclusive handle on one node's SDO client
///
/// Holding the guard is what serializes SDO transactions per node; drop it to release the slot.
pub type SdoClientGuard<S> = OwnedMutexGuard<SdoClient<SharedSender<S>, SdoChannel>>;

/// The master-side engine for a set of BMS nodes sharing one bus
///
/// Owns the frame dispatcher, the per-node SDO slots, and the liveness monitor. Concurrent
/// operations on different nodes proceed independently; operations on the same node are
/// serialized through its slot.
pub struct BmsManager<S: AsyncCanSender + 'static> {
    sender: SharedSender<S>,
    dispatcher: Dispatcher,
    monitor: HeartbeatMonitor,
    slots: HashMap<u8, Slot<S>>,
    metric_tx: mpsc::Sender<Metric>,
    _liveness_task: JoinHandle<()>,
    _pdo_task: JoinHandle<()>,
}

impl<S: AsyncCanSender + 'static> BmsManager<S> {
    /// Create the engine and spawn its background tasks
    ///
    /// Returns the manager and the receive side of the metric channel, which the telemetry
    /// publisher consumes.
    pub fn new<R: AsyncCanReceiver + 'static>(
        sender: S,
        receiver: R,
        config: &BusConfig,
    ) -> (Self, mpsc::Receiver<Metric>) {
        let dispatcher = Dispatcher::new(receiver);
        let sender = SharedSender::new(sender);

        let mut slots = HashMap::new();
        for node in &config.nodes {
            let timeout =
                Duration::from_millis(node.sdo_timeout_ms.unwrap_or(config.sdo_timeout_ms));
            let client =
                SdoClient::new_std(node.id, sender.clone(), dispatcher.sdo_channel(node.id))
                    .with_timeout(timeout);
            slots.insert(node.id, Arc::new(Mutex::new(client)));
        }

        let monitor = HeartbeatMonitor::new(
            &config.node_ids(),
            Duration::from_millis(config.heartbeat_interval_ms),
        );

        let mut heartbeat_rx = dispatcher.heartbeat_channel();
        let task_monitor = monitor.clone();
        let liveness_task = tokio::spawn(async move {
            let mut check = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    heartbeat = heartbeat_rx.recv() => match heartbeat {
                        Some(heartbeat) => task_monitor.handle_heartbeat(heartbeat),
                        None => break,
                    },
                    _ = check.tick() => task_monitor.check_timeouts(),
                }
            }
        });

        let (metric_tx, metric_rx) = mpsc::channel(METRIC_CHANNEL_DEPTH);

        // Resolve the configured PDO mappings against the catalog once
        let mut mappings: HashMap<u8, Vec<&'static DictEntry>> = HashMap::new();
        for mapping in &config.tpdo_mappings {
            let mut entries = Vec::new();
            for e in &mapping.entries {
                match find_entry(e.index, e.sub) {
                    Some(entry) => entries.push(entry),
                    None => {
                        log::warn!(
                            "TPDO{} maps unknown object {:04X}:{:02X}, ignoring mapping",
                            mapping.pdo,
                            e.index,
                            e.sub
                        );
                        entries.clear();
                        break;
                    }
                }
            }
            if !entries.is_empty() {
                mappings.insert(mapping.pdo, entries);
            }
        }

        let mut pdo_rx = dispatcher.pdo_channel();
        let pdo_metric_tx = metric_tx.clone();
        let pdo_task = tokio::spawn(async move {
            while let Some(frame) = pdo_rx.recv().await {
                let Some(entries) = mappings.get(&frame.pdo) else {
                    continue;
                };
                match telemetry::decode_pdo(frame.node, entries, frame.data()) {
                    Ok(metrics) => {
                        for metric in metrics {
                            if pdo_metric_tx.try_send(metric).is_err() {
                                log::warn!("Metric channel full, dropping PDO metric");
                            }
                        }
                    }
                    Err(e) => log::warn!(
                        "Failed to decode TPDO{} from node {}: {e}",
                        frame.pdo,
                        frame.node
                    ),
                }
            }
        });

        (
            Self {
                sender,
                dispatcher,
                monitor,
                slots,
                metric_tx,
                _liveness_task: liveness_task,
                _pdo_task: pdo_task,
            },
            metric_rx,
        )
    }

    fn slot(&self, node_id: NodeId) -> Result<&Slot<S>, ManagerError> {
        self.slots.get(&node_id.raw()).ok_or(ManagerError::UnknownNode {
            node_id: node_id.raw(),
        })
    }

    /// Get exclusive access to a node's SDO client, waiting (FIFO) if it is in use
    pub async fn sdo_client(&self, node_id: NodeId) -> Result<SdoClientGuard<S>, ManagerError> {
        let slot = self.slot(node_id)?;
        Ok(slot.clone().lock_owned().await)
    }

    /// Get exclusive access to a node's SDO client, failing fast if it is in use
    pub fn try_sdo_client(&self, node_id: NodeId) -> Result<SdoClientGuard<S>, ManagerError> {
        let slot = self.slot(node_id)?;
        slot.clone().try_lock_owned().map_err(|_| ManagerError::Busy {
            node_id: node_id.raw(),
        })
    }

    /// Read every telemetry entry from a node and decode it
    ///
    /// Entries the node does not implement (firmware dependent) or which fail this cycle are
    /// logged and skipped. Successfully decoded metrics are also forwarded to the metric channel.
    pub async fn poll_node(&self, node_id: NodeId) -> Result<Vec<Metric>, ManagerError> {
        let mut client = self.sdo_client(node_id).await?;
        let mut metrics = Vec::new();
        for (index, sub) in TELEMETRY_ENTRIES {
            let Some(entry) = find_entry(*index, *sub) else {
                continue;
            };
            match client.upload(*index, *sub).await {
                Ok(raw) => match telemetry::decode(entry, &raw) {
                    Ok(value) => metrics.push(telemetry::metric(node_id.raw(), entry, value)),
                    Err(e) => log::warn!("Node {node_id}: failed to decode {}: {e}", entry.name),
                },
                Err(SdoClientError::ServerAbort { abort_code, .. }) => {
                    // Objects like ah_expended only exist on newer firmware
                    log::debug!(
                        "Node {node_id}: {} not available ({abort_code:?})",
                        entry.name
                    );
                }
                Err(e) => log::warn!("Node {node_id}: failed to read {}: {e}", entry.name),
            }
        }
        drop(client);

        for metric in &metrics {
            if self.metric_tx.try_send(metric.clone()).is_err() {
                log::warn!("Metric channel full, dropping metric");
            }
        }
        Ok(metrics)
    }

    /// Poll every configured node concurrently
    ///
    /// Per-node SDO conversations are independent, so a slow or silent node does not delay the
    /// others. Returns (node_id, metrics) pairs in node-ID order.
    pub async fn poll_all(&self) -> Vec<(u8, Vec<Metric>)> {
        let mut ids: Vec<u8> = self.slots.keys().copied().collect();
        ids.sort_unstable();

        let polls = ids
            .iter()
            .filter_map(|&id| NodeId::new(id).ok())
            .map(|node_id| async move {
                match self.poll_node(node_id).await {
                    Ok(metrics) => (node_id.raw(), metrics),
                    Err(e) => {
                        log::warn!("Poll of node {node_id} failed: {e}");
                        (node_id.raw(), Vec::new())
                    }
                }
            });
        join_all(polls).await
    }

    /// Read a node's identity object
    pub async fn read_identity(&self, node_id: NodeId) -> Result<Identity, ManagerError> {
        let mut client = self.sdo_client(node_id).await?;
        client
            .read_identity()
            .await
            .map_err(|source| ManagerError::Sdo { source })
    }

    /// Create a firmware updater for a node
    ///
    /// The updater shares the node's SDO slot, so a running session blocks routine polls of that
    /// node only.
    pub fn firmware_updater(
        &self,
        node_id: NodeId,
    ) -> Result<FirmwareUpdater<SharedSender<S>, SdoChannel>, ManagerError> {
        let slot = self.slot(node_id)?;
        Ok(FirmwareUpdater::new(node_id, slot.clone()))
    }

    /// Get the liveness status of a single node
    pub fn node_status(&self, node_id: NodeId) -> Option<NodeStatus> {
        self.monitor.node(node_id.raw())
    }

    /// Get the liveness status of all tracked nodes
    pub fn status_snapshot(&self) -> Vec<NodeStatus> {
        self.monitor.snapshot()
    }

    /// Get the frame dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Send NMT start to a node (0 broadcasts to all nodes)
    pub async fn nmt_start(&self, node: u8) -> Result<(), ManagerError> {
        self.send_nmt_cmd(NmtCommandCmd::Start, node).await
    }

    /// Send NMT stop to a node (0 broadcasts to all nodes)
    pub async fn nmt_stop(&self, node: u8) -> Result<(), ManagerError> {
        self.send_nmt_cmd(NmtCommandCmd::Stop, node).await
    }

    /// Send NMT application reset to a node (0 broadcasts to all nodes)
    ///
    /// Note: entering the bootloader via NMT reset is not verified on this firmware; firmware
    /// updates use the program control object instead.
    pub async fn nmt_reset_app(&self, node: u8) -> Result<(), ManagerError> {
        self.send_nmt_cmd(NmtCommandCmd::ResetApp, node).await
    }

    /// Send NMT communications reset to a node (0 broadcasts to all nodes)
    pub async fn nmt_reset_comms(&self, node: u8) -> Result<(), ManagerError> {
        self.send_nmt_cmd(NmtCommandCmd::ResetComm, node).await
    }

    async fn send_nmt_cmd(&self, cmd: NmtCommandCmd, node: u8) -> Result<(), ManagerError> {
        let message = NmtCommand { cmd, node };
        let mut sender = self.sender.clone();
        sender
            .send(message.into())
            .await
            .map_err(|_| ManagerError::SendFailed)
    }
}
