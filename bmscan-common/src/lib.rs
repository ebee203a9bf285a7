//! Common functionality shared among the bmscan crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `bmscan-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;
pub mod dictionary;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::open_socketcan;

pub use node_id::NodeId;

pub use messages::{CanId, CanMessage};
