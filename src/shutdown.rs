//! Cancellation signal for background loops
//!
//! A `watch` channel carrying `true` once shutdown was requested. Dropping
//! the sender without sending does not cancel anything.

use tokio::sync::watch;

/// Receiving side of the shutdown signal
pub type Shutdown = watch::Receiver<bool>;

/// Create a shutdown signal; send `true` to stop the loops
pub fn channel() -> (watch::Sender<bool>, Shutdown) {
    watch::channel(false)
}

/// A receiver that never fires
pub fn never() -> Shutdown {
    let (_tx, rx) = watch::channel(false);
    rx
}

pub fn is_cancelled(shutdown: &Shutdown) -> bool {
    *shutdown.borrow()
}

/// Resolves once shutdown is requested
pub async fn cancelled(shutdown: &mut Shutdown) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
