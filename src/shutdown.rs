//! Cooperative cancellation for a running cleanup

use tokio::sync::watch;
use tracing::warn;

#[derive(Clone)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownListener) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, ShutdownListener { receiver })
    }

    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }
}

impl ShutdownListener {
    /// A listener that never fires
    pub fn never() -> Self {
        let (_, listener) = Shutdown::new();
        listener
    }

    /// Resolves once shutdown is triggered
    ///
    /// Never resolves if every [`Shutdown`] handle was dropped untriggered.
    pub async fn notified(&mut self) {
        if *self.receiver.borrow() {
            return;
        }
        if self.receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Trigger `shutdown` on Ctrl-C, and on SIGTERM where available
pub fn install_signal_handlers(shutdown: Shutdown) {
    let ctrlc = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            ctrlc.trigger();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let term = shutdown.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                warn!("SIGTERM received, stopping after the current step");
                term.trigger();
            }
        });
    }
}
