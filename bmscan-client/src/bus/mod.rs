//! Plumbing for sharing a single CAN socket among per-node tasks
mod dispatcher;
mod shared_sender;

pub use dispatcher::{ChannelClosedError, Dispatcher, SdoChannel};
pub use shared_sender::SharedSender;
