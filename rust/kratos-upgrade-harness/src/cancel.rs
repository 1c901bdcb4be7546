//! Caller-initiated cancellation for polls and the coordinator

use tokio::sync::watch;

/// Sending side: flip once to cancel every linked token
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side, cheap to clone into every poll
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested, never if the handle is gone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_waiter() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        waiter.await.unwrap();
        assert!(token.is_cancelled());
        assert!(handle.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_token_stays_pending() {
        let token = CancelToken::never();
        let result = tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await;
        assert!(result.is_err());
        assert!(!token.is_cancelled());
    }
}
