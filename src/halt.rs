//! Graceful termination of the control loop.
//!
//! The loop `select`s its interval sleep against a halt notification, so a
//! termination signal cancels the sleep instead of waiting it out. Any
//! shutdown actuation (parking the fans at the safety duty) happens in the
//! loop after it leaves the select, never inside a signal handler.

use log::info;

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Halt trigger; one per process, shared with the signal tasks
pub struct Sender {
    halt_tx: watch::Sender<bool>,
}

impl Sender {
    /// Notify all receivers. Idempotent; later calls are no-ops.
    pub fn send_halt(&self) {
        // an error here means every receiver is gone already
        let _ = self.halt_tx.send(true);
    }

    /// Hook `SIGINT`, `SIGHUP` and `SIGTERM` to halt the control loop
    pub fn hook_termination_signals(self: Arc<Self>) {
        for kind in [
            SignalKind::interrupt(),
            SignalKind::hangup(),
            SignalKind::terminate(),
        ] {
            let sender = self.clone();
            tokio::spawn(async move {
                let mut stream = signal(kind).expect("BUG: failed hooking signal");
                if stream.recv().await.is_some() {
                    info!("termination signal received");
                    sender.send_halt();
                }
            });
        }
    }
}

/// Clonable receiver side of the halt notification
#[derive(Clone)]
pub struct Receiver {
    halt_rx: watch::Receiver<bool>,
}

impl Receiver {
    /// Completes once halt has been signalled (immediately if it already
    /// was). A dropped sender counts as halt.
    pub async fn wait_for_halt(&mut self) {
        while !*self.halt_rx.borrow() {
            if self.halt_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        *self.halt_rx.borrow()
    }
}

/// Build a halt sender/receiver pair
pub fn make_pair() -> (Arc<Sender>, Receiver) {
    let (halt_tx, halt_rx) = watch::channel(false);

    (Arc::new(Sender { halt_tx }), Receiver { halt_rx })
}
