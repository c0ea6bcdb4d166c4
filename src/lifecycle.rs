//! Mount lifetime tracking.

use std::sync::Arc;
use tokio::sync::watch;

/// Closed once the owning mount is torn down. Background tasks check it
/// before applying a result and select on [`Lifecycle::closed`] to stop.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    closed: Arc<watch::Sender<bool>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            closed: Arc::new(tx),
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Lifecycle::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in self, so wait_for cannot fail here.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
