//! A master-side engine for polling and updating CANopen BMS nodes
//!
//! The crate provides the pieces of a battery-monitoring master, and an engine tying them
//! together:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary, including the
//!   block download variant used for firmware upload
//! - A [FirmwareUpdater] driving the bootloader's program objects through a complete,
//!   cancellable update session
//! - A [HeartbeatMonitor] tracking per-node liveness and NMT state
//! - A [telemetry] module decoding raw object bytes into unit-scaled metrics via the object
//!   catalog
//! - A [BmsManager] which owns the bus dispatcher and one exclusive SDO slot per node, so
//!   conversations with different nodes proceed concurrently while each node sees strictly
//!   serialized requests
//!
//! This library is based on tokio/async throughout. Frame transport is abstracted behind the
//! [AsyncCanSender](common::traits::AsyncCanSender) and
//! [AsyncCanReceiver](common::traits::AsyncCanReceiver) traits; a socketcan implementation is
//! available behind the `socketcan` feature.
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bus;
pub mod config;
pub mod firmware;
pub mod liveness;
mod manager;
mod sdo_client;
pub mod telemetry;

pub use bmscan_common as common;

pub use bus::{ChannelClosedError, Dispatcher, SdoChannel, SharedSender};
pub use config::{BusConfig, ConfigError};
pub use firmware::{CancelHandle, FirmwareError, FirmwareUpdater, SessionState, TransferProgress};
pub use liveness::{HeartbeatMonitor, LivenessState, NodeStatus};
pub use manager::{BmsManager, ManagerError, SdoClientGuard};
pub use sdo_client::{Identity, SdoClient, SdoClientError, DEFAULT_RESPONSE_TIMEOUT};
pub use telemetry::{DecodeError, Metric, MetricValue};
