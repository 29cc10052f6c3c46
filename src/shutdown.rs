//! Cooperative stop signal
//!
//! Every long-running loop in the service follows the same pattern: select
//! on the shared signal, observe it within one poll interval, exit cleanly.
//! This module is that pattern factored out once.

use tokio::sync::watch;

/// Owning side of the stop signal, held by the supervisor.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiving side, cloned into every spawned task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Signal every subscriber to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    /// Create an additional signal receiver.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// Whether stop has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Complete when stop is requested. A dropped handle counts as stop.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}
