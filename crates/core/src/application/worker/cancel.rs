// Consumer Cancellation Signal

use tokio::sync::watch;

/// Receiving side of a cancel signal, captured by a worker (or the
/// scheduling loop) at creation time.
///
/// Advisory only: it is observed at the top of the consume loop and while
/// waiting for a delivery, never in the middle of processing. Dropping the
/// `CancelSignal` counts as raising it.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Check if cancellation was requested
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until cancellation is requested (returns at once if it already was)
    pub async fn raised(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }
}

/// Sending side, owned by PoolManager (one per consumer) or the daemon
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    /// Request cancellation; idempotent
    pub fn raise(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Another token observing this signal
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a cancel channel
pub fn cancel_channel() -> (CancelSignal, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSignal { tx }, CancelToken { rx })
}
