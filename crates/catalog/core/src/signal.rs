use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use tokio::sync::Notify;
use tracing::info;

/// A cloneable stop signal shared by the controller and its workers.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<StopSignalInner>,
}

#[derive(Debug, Default)]
struct StopSignalInner {
    is_terminating: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn trap_on_sigint(&self) -> Result<()> {
        let signal = self.clone();
        ::ctrlc::set_handler(move || signal.terminate())
            .map_err(|error| anyhow!("failed to set SIGINT handler: {error}"))
    }

    pub fn terminate(&self) {
        info!("Gracefully shutting down...");
        self.inner.is_terminating.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.is_terminating.load(Ordering::SeqCst)
    }

    pub async fn wait_to_terminate(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_terminating() {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn waiters_are_released_on_terminate() {
        let signal = StopSignal::default();
        let waiter = ::tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait_to_terminate().await }
        });

        ::tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_terminating());

        signal.terminate();
        ::tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .expect("waiter should not panic");
        assert!(signal.is_terminating());
    }

    #[tokio::test]
    async fn terminated_signal_returns_immediately() {
        let signal = StopSignal::default();
        signal.terminate();
        signal.wait_to_terminate().await;
    }
}
