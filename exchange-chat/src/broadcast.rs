use std::sync::Arc;

use tracing::debug;

use crate::registry::ConnectionRegistry;

/// Fans a message out to every registered connection.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Sends `message` to every handle in a fresh registry snapshot.
    ///
    /// A failed send is skipped; the handle stays registered until its own
    /// session unregisters it. Returns how many handles accepted the message.
    pub async fn broadcast(&self, message: &str) -> usize {
        let recipients = self.registry.snapshot().await;
        let mut delivered = 0;

        for handle in &recipients {
            match handle.send(message) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(
                        id = handle.id(),
                        peer = ?handle.peer(),
                        error = %err,
                        "failed to deliver message to client"
                    );
                }
            }
        }

        delivered
    }
}
