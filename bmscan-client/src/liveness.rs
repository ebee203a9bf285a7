//! Per-node heartbeat and NMT state tracking
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bmscan_common::messages::{Heartbeat, NmtState};

/// Minimum heartbeat timeout, regardless of the configured producer interval
const MIN_TIMEOUT: Duration = Duration::from_millis(3000);

/// Liveness of a node as judged from its heartbeat production
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// No heartbeat has been seen yet
    Unknown,
    /// Heartbeats are arriving
    Online,
    /// Heartbeats stopped arriving
    Timeout,
}

/// The tracked status of one node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeStatus {
    /// The node's ID
    pub node_id: u8,
    /// Current liveness judgment
    pub liveness: LivenessState,
    /// The NMT state from the most recent heartbeat
    pub nmt_state: Option<NmtState>,
    /// When the most recent heartbeat arrived
    pub last_heartbeat: Option<Instant>,
}

impl NodeStatus {
    fn new(node_id: u8) -> Self {
        Self {
            node_id,
            liveness: LivenessState::Unknown,
            nmt_state: None,
            last_heartbeat: None,
        }
    }
}

/// Tracks heartbeat liveness for all nodes on the bus
///
/// Nodes enter the table either at construction (the configured set) or on their first observed
/// heartbeat, and are never removed; a silent node re-enters `Timeout`, not oblivion. A node is
/// judged `Timeout` when no heartbeat arrives within three producer intervals (minimum 3
/// seconds), and any later heartbeat restores `Online` regardless of prior state.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    nodes: Arc<Mutex<HashMap<u8, NodeStatus>>>,
    timeout: Duration,
    epoch: Instant,
}

impl HeartbeatMonitor {
    /// Create a monitor seeded with the configured node set
    pub fn new(configured_nodes: &[u8], heartbeat_interval: Duration) -> Self {
        let mut nodes = HashMap::new();
        for id in configured_nodes {
            nodes.insert(*id, NodeStatus::new(*id));
        }
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
            timeout: (heartbeat_interval * 3).max(MIN_TIMEOUT),
            epoch: Instant::now(),
        }
    }

    /// The timeout after which a silent node is judged `Timeout`
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Process a received heartbeat
    pub fn handle_heartbeat(&self, heartbeat: Heartbeat) {
        let mut nodes = self.nodes.lock().unwrap();
        let status = nodes
            .entry(heartbeat.node)
            .or_insert_with(|| NodeStatus::new(heartbeat.node));
        if status.liveness == LivenessState::Timeout {
            log::info!("Node {} is back online", heartbeat.node);
        }
        status.liveness = LivenessState::Online;
        status.nmt_state = Some(heartbeat.state);
        status.last_heartbeat = Some(Instant::now());
    }

    /// Mark nodes whose heartbeat has expired as `Timeout`
    ///
    /// Called periodically by the engine. A node losing its heartbeat is surfaced here and in the
    /// status snapshot, but never stops polling of other nodes.
    pub fn check_timeouts(&self) {
        let now = Instant::now();
        let mut nodes = self.nodes.lock().unwrap();
        for status in nodes.values_mut() {
            if status.liveness == LivenessState::Timeout {
                continue;
            }
            // Configured nodes that never produce a heartbeat time out against the monitor
            // start instead of a last-heartbeat time
            let reference = status.last_heartbeat.unwrap_or(self.epoch);
            if now.duration_since(reference) > self.timeout {
                log::warn!(
                    "Node {} heartbeat timeout, marking unreachable",
                    status.node_id
                );
                status.liveness = LivenessState::Timeout;
            }
        }
    }

    /// Get the status of a single node
    pub fn node(&self, node_id: u8) -> Option<NodeStatus> {
        self.nodes.lock().unwrap().get(&node_id).copied()
    }

    /// Get a snapshot of all tracked nodes, ordered by node ID
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let nodes = self.nodes.lock().unwrap();
        let mut statuses: Vec<NodeStatus> = nodes.values().copied().collect();
        statuses.sort_by_key(|s| s.node_id);
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(node: u8, state: NmtState) -> Heartbeat {
        Heartbeat {
            node,
            toggle: false,
            state,
        }
    }

    #[test]
    fn test_configured_nodes_start_unknown() {
        let monitor = HeartbeatMonitor::new(&[1, 2], Duration::from_secs(1));
        let statuses = monitor.snapshot();
        assert_eq!(2, statuses.len());
        assert!(statuses
            .iter()
            .all(|s| s.liveness == LivenessState::Unknown));
    }

    #[test]
    fn test_heartbeat_brings_node_online() {
        let monitor = HeartbeatMonitor::new(&[1], Duration::from_secs(1));
        monitor.handle_heartbeat(heartbeat(1, NmtState::Operational));
        let status = monitor.node(1).unwrap();
        assert_eq!(LivenessState::Online, status.liveness);
        assert_eq!(Some(NmtState::Operational), status.nmt_state);
    }

    #[test]
    fn test_unconfigured_node_tracked_on_heartbeat() {
        let monitor = HeartbeatMonitor::new(&[1], Duration::from_secs(1));
        monitor.handle_heartbeat(heartbeat(9, NmtState::PreOperational));
        assert_eq!(
            LivenessState::Online,
            monitor.node(9).unwrap().liveness
        );
    }

    #[test]
    fn test_timeout_floor_is_3s() {
        let monitor = HeartbeatMonitor::new(&[], Duration::from_millis(100));
        assert_eq!(Duration::from_millis(3000), monitor.timeout());
        let monitor = HeartbeatMonitor::new(&[], Duration::from_secs(2));
        assert_eq!(Duration::from_secs(6), monitor.timeout());
    }

    #[test]
    fn test_check_timeouts_leaves_fresh_nodes_alone() {
        let monitor = HeartbeatMonitor::new(&[1, 2], Duration::from_secs(1));
        monitor.handle_heartbeat(heartbeat(1, NmtState::Operational));
        monitor.check_timeouts();
        // Fresh heartbeat: still online; node 2 never seen but the monitor just started
        assert_eq!(LivenessState::Online, monitor.node(1).unwrap().liveness);
        assert_eq!(LivenessState::Unknown, monitor.node(2).unwrap().liveness);
    }
}
