//! Fire-once notification shared between tasks.
//!
//! A [`Latch`] starts unset and can be fired exactly once; later calls to
//! [`Latch::fire`] are no-ops. Any number of tasks may wait for it, before or
//! after it fires. Service runtimes use one latch for "ready" and one for
//! "exited".

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Latch {
    state: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Fires the latch, waking every waiter.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        self.state
            .send_if_modified(|fired| !std::mem::replace(fired, true))
    }

    pub fn is_fired(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the latch has fired. Returns immediately if it already has.
    pub async fn fired(&self) {
        let mut rx = self.state.subscribe();
        // `self` keeps the sender alive, so the wait cannot end with a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_only_once() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
    }

    #[tokio::test]
    async fn wakes_waiters_registered_before_firing() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.fired().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        latch.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn already_fired_returns_immediately() {
        let latch = Latch::new();
        latch.fire();
        tokio::time::timeout(Duration::from_millis(100), latch.fired())
            .await
            .expect("fired latch should not block");
    }
}
