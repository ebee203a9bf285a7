use std::{sync::Arc, time::Duration};

use bmscan_client::{FirmwareError, FirmwareUpdater, SdoClient, SessionState};
use bmscan_common::{
    constants::values,
    sdo::{AbortCode, RawAbortCode},
    NodeId,
};
use integration_tests::{
    sim_bus::{SimBus, SimBusReceiver, SimBusSender},
    sim_node::SimBms,
};
use tokio::sync::Mutex;

const NODE_ID: u8 = 1;

fn make_updater(bus: &SimBus) -> FirmwareUpdater<SimBusSender, SimBusReceiver> {
    let client = SdoClient::new_std(NODE_ID, bus.new_sender(), bus.new_receiver());
    FirmwareUpdater::new(NodeId::new(NODE_ID).unwrap(), Arc::new(Mutex::new(client)))
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_happy_path() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(32);
    let updater = make_updater(&bus);

    let image = test_image(1000);
    updater.update(&image).await.unwrap();

    assert_eq!(image, node.program_data());
    // stop, clear, start
    assert_eq!(
        vec![
            values::PROGRAM_CTRL_STOP,
            values::PROGRAM_CTRL_CLEAR,
            values::PROGRAM_CTRL_START
        ],
        node.control_log()
    );

    let progress = *updater.progress().borrow();
    assert_eq!(SessionState::Complete, progress.state);
    assert_eq!(image.len(), progress.bytes_sent);
    assert_eq!(image.len(), progress.total);
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_retransmits_mid_block() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(10);
    node.set_ack_short_once(3);
    let updater = make_updater(&bus);

    let image = test_image(600);
    updater.update(&image).await.unwrap();
    assert_eq!(image, node.program_data());
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_late_block_flash_failure_is_terminal() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(16);
    // Secondary flash write fails late in the transfer
    node.set_abort_after_bytes(800, 0x0607_0012);
    let updater = make_updater(&bus);

    let image = test_image(1500);
    let result = updater.update(&image).await;
    assert_eq!(
        Err(FirmwareError::TransferAborted {
            abort_code: RawAbortCode::Valid(AbortCode::DataTypeMismatchLengthHigh)
        }),
        result
    );
    assert_eq!(SessionState::Aborted, updater.progress().borrow().state);
    // No program start after a failed transfer
    assert_eq!(
        vec![values::PROGRAM_CTRL_STOP, values::PROGRAM_CTRL_CLEAR],
        node.control_log()
    );
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_verification_failure_is_terminal() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(32);
    node.set_abort_on_end(0x0800_0022);
    let updater = make_updater(&bus);

    let image = test_image(400);
    let result = updater.update(&image).await;
    assert_eq!(
        Err(FirmwareError::TransferAborted {
            abort_code: RawAbortCode::Valid(AbortCode::CantStoreDeviceState)
        }),
        result
    );
    assert_eq!(SessionState::Aborted, updater.progress().borrow().state);
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_cancellation_sends_abort() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(8);
    // Slow the per-block ack down so cancellation lands mid-transfer
    node.set_ack_delay(Duration::from_millis(30));
    let updater = Arc::new(make_updater(&bus));

    let cancel = updater.cancel_handle();
    let task_updater = updater.clone();
    let update_task =
        tokio::spawn(async move { task_updater.update(&test_image(5000)).await });

    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();

    let result = update_task.await.unwrap();
    assert_eq!(Err(FirmwareError::Cancelled), result);
    assert_eq!(SessionState::Aborted, updater.progress().borrow().state);

    // The device must not be left waiting for more segments
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!node.received_aborts().is_empty());
}

#[tokio::test]
#[serial_test::serial]
async fn test_update_rejects_empty_image() {
    let bus = SimBus::new();
    let _node = SimBms::spawn(NODE_ID, &bus);
    let updater = make_updater(&bus);

    assert_eq!(Err(FirmwareError::EmptyImage), updater.update(&[]).await);
}

#[tokio::test]
#[serial_test::serial]
async fn test_progress_reports_block_transfer() {
    let bus = SimBus::new();
    let node = SimBms::spawn(NODE_ID, &bus);
    node.set_blksize(8);
    node.set_ack_delay(Duration::from_millis(20));
    let updater = Arc::new(make_updater(&bus));

    let mut progress = updater.progress();
    let task_updater = updater.clone();
    let update_task = tokio::spawn(async move { task_updater.update(&test_image(2000)).await });

    // Observe at least one mid-transfer progress value
    let mut saw_transfer = false;
    loop {
        if progress.changed().await.is_err() {
            break;
        }
        let current = *progress.borrow();
        if current.state == SessionState::BlockTransferring && current.bytes_sent > 0 {
            saw_transfer = true;
        }
        if matches!(current.state, SessionState::Complete | SessionState::Aborted) {
            break;
        }
    }
    assert!(saw_transfer);
    update_task.await.unwrap().unwrap();
}
