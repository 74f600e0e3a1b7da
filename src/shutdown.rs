use std::sync::Arc;

use tokio::sync::watch;

/// Broadcast stop signal shared by a group of workers.
///
/// Triggering is sticky: every clone observes it, including clones created
/// afterwards, and observing it never consumes it. Workers poll
/// [`Shutdown::is_triggered`] once per loop cycle and race
/// [`Shutdown::cancelled`] against their sleeps, so a worker stops within one
/// rate-limiter cycle of the trigger.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on trigger.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_every_clone() {
        let shutdown = Shutdown::new();
        let a = shutdown.clone();
        let b = shutdown.clone();
        assert!(!a.is_triggered());

        shutdown.trigger();

        assert!(a.is_triggered());
        assert!(b.is_triggered());
        a.cancelled().await;
        // Observing the signal twice does not consume it.
        a.cancelled().await;
        assert!(shutdown.clone().is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waits_for_trigger() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        waiter.await.unwrap();
    }
}
