use std::{sync::Arc, time::Duration};

use bmscan_client::{
    config::{BusConfig, PdoMapEntry, PdoMapping},
    BmsManager, LivenessState, ManagerError, MetricValue,
};
use bmscan_common::{
    messages::{Heartbeat, NmtState},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId, CanMessage, NodeId,
};
use integration_tests::{sim_bus::SimBus, sim_node::SimBms};

const NODE: u8 = 1;

fn node_id() -> NodeId {
    NodeId::new(NODE).unwrap()
}

fn make_manager(
    bus: &SimBus,
    config: &BusConfig,
) -> (
    BmsManager<integration_tests::sim_bus::SimBusSender>,
    tokio::sync::mpsc::Receiver<bmscan_client::Metric>,
) {
    BmsManager::new(bus.new_sender(), bus.new_receiver(), config)
}

#[tokio::test]
#[serial_test::serial]
async fn test_poll_node_decodes_all_telemetry() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE, &bus);
    let (manager, mut metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[NODE]));

    let metrics = manager.poll_node(node_id()).await.unwrap();
    assert_eq!(9, metrics.len());

    let find = |name: &str| {
        metrics
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("missing metric {name}"))
    };
    assert_eq!(MetricValue::Float(54.0), find("voltage").value);
    assert_eq!("V", find("voltage").unit);
    assert_eq!(MetricValue::Integer(87), find("soc").value);
    assert_eq!(MetricValue::Float(25.125), find("temperature").value);
    assert_eq!(MetricValue::Float(-2.5), find("current").value);
    assert_eq!(MetricValue::Integer(321), find("cycles").value);
    assert_eq!(MetricValue::Float(-2.0), find("ah_expended").value);
    assert_eq!(MetricValue::Float(1000.0), find("ah_since_eq").value);

    // The same metrics are forwarded to the telemetry sink channel
    for _ in 0..metrics.len() {
        metric_rx.recv().await.unwrap();
    }
}

#[tokio::test]
#[serial_test::serial]
async fn test_poll_skips_unimplemented_objects() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE, &bus);
    // Old firmware: per-direction amp-hour counters not present
    node.set_object(0x6051, 0, vec![], bmscan_common::dictionary::Access::Wo);
    let (manager, _metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[NODE]));

    let metrics = manager.poll_node(node_id()).await.unwrap();
    assert_eq!(8, metrics.len());
    assert!(metrics.iter().all(|m| m.name != "ah_expended"));
}

#[tokio::test]
#[serial_test::serial]
async fn test_read_identity_via_manager() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE, &bus);
    let (manager, _metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[NODE]));

    let identity = manager.read_identity(node_id()).await.unwrap();
    assert_eq!(0x0000_037C, identity.vendor_id);
    assert_eq!(0x0000_000A, identity.product_code);
}

#[tokio::test]
#[serial_test::serial]
async fn test_unknown_node_rejected() {
    let bus = SimBus::new();
    let (manager, _metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[NODE]));

    let other = NodeId::new(9).unwrap();
    assert!(matches!(
        manager.poll_node(other).await,
        Err(ManagerError::UnknownNode { node_id: 9 })
    ));
}

#[tokio::test]
#[serial_test::serial]
async fn test_same_node_requests_do_not_interleave() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE, &bus);
    let (manager, _metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[NODE]));
    let manager = Arc::new(manager);

    // While the slot is held, a fast-path request observes Busy
    let guard = manager.try_sdo_client(node_id()).unwrap();
    assert!(matches!(
        manager.try_sdo_client(node_id()),
        Err(ManagerError::Busy { node_id: NODE })
    ));

    // A queued request completes only after the slot is released
    let queued = manager.clone();
    let handle = tokio::spawn(async move { queued.poll_node(node_id()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    drop(guard);
    let metrics = handle.await.unwrap().unwrap();
    assert!(!metrics.is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_concurrent_polls_of_different_nodes() {
    let bus = SimBus::new();
    let _node1 = SimBms::spawn(1, &bus);
    let _node2 = SimBms::spawn(2, &bus);
    let (manager, _metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[1, 2]));
    let manager = Arc::new(manager);

    let m1 = manager.clone();
    let m2 = manager.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { m1.poll_node(NodeId::new(1).unwrap()).await }),
        tokio::spawn(async move { m2.poll_node(NodeId::new(2).unwrap()).await }),
    );
    assert_eq!(9, r1.unwrap().unwrap().len());
    assert_eq!(9, r2.unwrap().unwrap().len());

    let all = manager.poll_all().await;
    assert_eq!(vec![1, 2], all.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    assert!(all.iter().all(|(_, metrics)| metrics.len() == 9));
}

#[tokio::test]
#[serial_test::serial]
async fn test_heartbeat_liveness_cycle() {
    let bus = SimBus::new();
    let config = BusConfig {
        heartbeat_interval_ms: 100,
        ..BusConfig::with_nodes(&[NODE])
    };
    let (manager, _metric_rx) = make_manager(&bus, &config);
    let mut sender = bus.new_sender();

    assert_eq!(
        LivenessState::Unknown,
        manager.node_status(node_id()).unwrap().liveness
    );

    let heartbeat = Heartbeat {
        node: NODE,
        toggle: false,
        state: NmtState::Operational,
    };
    sender.send(heartbeat.into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = manager.node_status(node_id()).unwrap();
    assert_eq!(LivenessState::Online, status.liveness);
    assert_eq!(Some(NmtState::Operational), status.nmt_state);

    // No heartbeat for longer than the 3s floor: node goes to Timeout, process keeps running
    tokio::time::sleep(Duration::from_millis(3600)).await;
    assert_eq!(
        LivenessState::Timeout,
        manager.node_status(node_id()).unwrap().liveness
    );

    // A single heartbeat restores Online
    sender.send(heartbeat.into()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        LivenessState::Online,
        manager.node_status(node_id()).unwrap().liveness
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_pdo_frames_decode_to_metrics() {
    let bus = SimBus::new();
    let config = BusConfig {
        tpdo_mappings: vec![PdoMapping {
            pdo: 1,
            entries: vec![
                PdoMapEntry {
                    index: 0x6060,
                    sub: 0,
                },
                PdoMapEntry {
                    index: 0x6081,
                    sub: 0,
                },
            ],
        }],
        ..BusConfig::with_nodes(&[NODE])
    };
    let (_manager, mut metric_rx) = make_manager(&bus, &config);
    let mut sender = bus.new_sender();

    let mut payload = Vec::new();
    payload.extend_from_slice(&55296i32.to_le_bytes());
    payload.push(87);
    sender
        .send(CanMessage::new(CanId::std(0x180 + NODE as u16), &payload))
        .await
        .unwrap();

    let voltage = tokio::time::timeout(Duration::from_secs(1), metric_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("voltage", voltage.name);
    assert_eq!(MetricValue::Float(54.0), voltage.value);
    assert_eq!(NODE, voltage.node_id);

    let soc = tokio::time::timeout(Duration::from_secs(1), metric_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("soc", soc.name);
    assert_eq!(MetricValue::Integer(87), soc.value);
}

#[tokio::test]
#[serial_test::serial]
async fn test_nmt_commands_on_the_wire() {
    let bus = SimBus::new();
    let mut observer = bus.new_receiver();
    let (manager, _metric_rx) = make_manager(&bus, &BusConfig::with_nodes(&[NODE]));

    manager.nmt_start(NODE).await.unwrap();
    let frame = loop {
        let msg = observer.recv().await.unwrap();
        if msg.id() == CanId::std(0) {
            break msg;
        }
    };
    assert_eq!(&[1, NODE], frame.data());
}
