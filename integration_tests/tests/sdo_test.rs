use std::time::Duration;

use bmscan_client::{telemetry, MetricValue, SdoClient, SdoClientError};
use bmscan_common::{
    dictionary::{find_entry, Access},
    sdo::{AbortCode, RawAbortCode},
};
use integration_tests::{sim_bus::SimBus, sim_node::SimBms};

const NODE_ID: u8 = 1;

fn make_client(bus: &SimBus) -> SdoClient<integration_tests::sim_bus::SimBusSender, integration_tests::sim_bus::SimBusReceiver> {
    SdoClient::new_std(NODE_ID, bus.new_sender(), bus.new_receiver())
}

#[tokio::test]
#[serial_test::serial]
async fn test_expedited_read_write() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    let mut client = make_client(&bus);

    // Heartbeat producer time is RW
    client.write_u16(0x1017, 0, 2000).await.unwrap();
    assert_eq!(2000, client.read_u16(0x1017, 0).await.unwrap());
    assert_eq!(
        Some(2000u16.to_le_bytes().to_vec()),
        node.object(0x1017, 0)
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_expedited_upload_returns_full_data_field() {
    // The real firmware answers 0x4F (n=3) for 4-byte objects; the client must still deliver
    // all four bytes so the catalog width governs decoding
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_force_expedited_n3(true);
    let mut client = make_client(&bus);

    let raw = client.upload(0x6060, 0).await.unwrap();
    assert_eq!(vec![0x00, 0xD8, 0x00, 0x00], raw);

    let entry = find_entry(0x6060, 0).unwrap();
    assert_eq!(
        MetricValue::Float(54.0),
        telemetry::decode(entry, &raw).unwrap()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_segmented_upload_reassembly() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    // 10 bytes: two segments of 7 + 3, with the final frame padded to a full 7 claimed-valid
    // bytes; the declared size must win
    node.set_object(0x1008, 0, b"0123456789".to_vec(), Access::Ro);
    node.set_pad_upload_segments(true);
    let mut client = make_client(&bus);

    let read = client.upload(0x1008, 0).await.unwrap();
    assert_eq!(b"0123456789".to_vec(), read);
}

#[tokio::test]
#[serial_test::serial]
async fn test_segmented_download() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_object(0x1008, 0, vec![0; 20], Access::Rw);
    let mut client = make_client(&bus);

    let data: Vec<u8> = (0..20).collect();
    client.download(0x1008, 0, &data).await.unwrap();
    assert_eq!(Some(data), node.object(0x1008, 0));
}

#[tokio::test]
#[serial_test::serial]
async fn test_toggle_mismatch_aborts() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_wrong_toggle_once();
    let mut client = make_client(&bus);

    let result = client.upload(0x1008, 0).await;
    assert_eq!(Err(SdoClientError::ToggleNotAlternated), result);

    // The client must have closed the transaction with an abort frame
    tokio::time::sleep(Duration::from_millis(50)).await;
    let aborts = node.received_aborts();
    assert_eq!(1, aborts.len());
    assert_eq!(
        (0x1008, 0, AbortCode::ToggleNotAlternated as u32),
        aborts[0]
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_timeout_sends_abort() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_ignore_index(Some(0x6060));
    let mut client = make_client(&bus).with_timeout(Duration::from_millis(100));

    let result = client.upload(0x6060, 0).await;
    assert_eq!(Err(SdoClientError::ProtocolTimeout), result);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let aborts = node.received_aborts();
    assert_eq!(1, aborts.len());
    assert_eq!((0x6060, 0, AbortCode::SdoTimeout as u32), aborts[0]);
}

#[tokio::test]
#[serial_test::serial]
async fn test_missing_object_abort_kinds() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE_ID, &bus);
    let mut client = make_client(&bus);

    // Unknown index: object does not exist
    assert_eq!(
        Err(SdoClientError::ServerAbort {
            index: 0x7123,
            sub: 0,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject)
        }),
        client.upload(0x7123, 0).await
    );

    // Known index, unknown sub
    assert_eq!(
        Err(SdoClientError::ServerAbort {
            index: 0x1018,
            sub: 9,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchSubIndex)
        }),
        client.upload(0x1018, 9).await
    );

    // Write-only object cannot be read
    assert_eq!(
        Err(SdoClientError::ServerAbort {
            index: 0x1F50,
            sub: 1,
            abort_code: RawAbortCode::Valid(AbortCode::WriteOnly)
        }),
        client.upload(0x1F50, 1).await
    );

    // Read-only object cannot be written
    assert_eq!(
        Err(SdoClientError::ServerAbort {
            index: 0x6060,
            sub: 0,
            abort_code: RawAbortCode::Valid(AbortCode::ReadOnly)
        }),
        client.download(0x6060, 0, &[0; 4]).await
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_read_identity() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE_ID, &bus);
    let mut client = make_client(&bus);

    let identity = client.read_identity().await.unwrap();
    assert_eq!(0x0000_037C, identity.vendor_id);
    assert_eq!(0x0000_000A, identity.product_code);
}

#[tokio::test]
#[serial_test::serial]
async fn test_read_string() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE_ID, &bus);
    let mut client = make_client(&bus);

    assert_eq!("Epsilon V2 BMS", client.read_device_name().await.unwrap());
}

#[tokio::test]
#[serial_test::serial]
async fn test_block_download_single_block() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    let mut client = make_client(&bus);

    let data: Vec<u8> = (0..128u32).map(|i| i as u8).collect();
    client.block_download(0x1F50, 1, &data).await.unwrap();
    assert_eq!(data, node.program_data());
}

#[tokio::test]
#[serial_test::serial]
async fn test_block_download_multiple_blocks() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(16);
    let mut client = make_client(&bus);

    // 1200 bytes = 172 segments = 11 blocks of 16
    let data: Vec<u8> = (0..1200u32).map(|i| i as u8).collect();
    client.block_download(0x1F50, 1, &data).await.unwrap();
    assert_eq!(data, node.program_data());
}

#[tokio::test]
#[serial_test::serial]
async fn test_block_download_retransmits_after_short_ack() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(10);
    // First block ack claims only 4 of 10 segments arrived; the client must resume from
    // segment 5, not abort or restart
    node.set_ack_short_once(4);
    let mut client = make_client(&bus);

    let data: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    client.block_download(0x1F50, 1, &data).await.unwrap();
    assert_eq!(data, node.program_data());
}
