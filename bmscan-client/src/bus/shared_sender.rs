//! Utility for sharing a single socket among tasks
use std::sync::Arc;
use tokio::sync::Mutex;

use bmscan_common::{
    traits::{AsyncCanSender, CanSendError},
    CanMessage,
};

/// A clone-able wrapper serializing sends from many tasks onto one bus socket
#[derive(Debug)]
pub struct SharedSender<S: AsyncCanSender> {
    inner: Arc<Mutex<S>>,
}

impl<S: AsyncCanSender> Clone for SharedSender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncCanSender> SharedSender<S> {
    /// Create a new SharedSender wrapping `sender`
    pub fn new(sender: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sender)),
        }
    }

    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let mut inner = self.inner.lock().await;
        inner.send(msg).await
    }
}

impl<S: AsyncCanSender> AsyncCanSender for SharedSender<S> {
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), CanSendError>> + Send {
        self.send(msg)
    }
}
