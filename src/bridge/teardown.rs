//! Cooperative teardown flag shared by the coordinator and the duties.

use tokio::sync::watch;

pub fn teardown_signal() -> (TeardownTrigger, TeardownListener) {
    let (tx, rx) = watch::channel(false);
    (TeardownTrigger { tx }, TeardownListener { rx })
}

/// Held by the coordinator.
#[derive(Debug)]
pub struct TeardownTrigger {
    tx: watch::Sender<bool>,
}

impl TeardownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn listener(&self) -> TeardownListener {
        TeardownListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Held by each duty that blocks on something other than the audio queue.
#[derive(Debug, Clone)]
pub struct TeardownListener {
    rx: watch::Receiver<bool>,
}

impl TeardownListener {
    /// Resolves once teardown is requested, or once the trigger is dropped.
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}
