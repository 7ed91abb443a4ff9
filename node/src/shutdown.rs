//! Graceful shutdown signal.
//!
//! A watch channel flipped exactly once. Subsystems grab a [`ShutdownToken`]
//! and `select!` on [`ShutdownToken::wait`] alongside their main loop.

use tokio::sync::watch;

/// Shutdown broadcaster held by the daemon.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Cloneable receiver side.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal shutdown to every token.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Wait for SIGINT/SIGTERM, then trigger.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }
        self.trigger();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    /// Resolve once shutdown is triggered.
    pub async fn wait(&mut self) {
        // If the sender is gone, treat that as shutdown too.
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_resolves_every_token() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.token();
        let mut b = shutdown.token();
        assert!(!a.is_triggered());

        shutdown.trigger();
        a.wait().await;
        b.wait().await;
        assert!(b.is_triggered());
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let mut token = shutdown.token();
        drop(shutdown);
        token.wait().await;
    }

    #[tokio::test]
    async fn tokens_created_after_trigger_see_it() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let token = shutdown.token();
        assert!(token.is_triggered());
    }
}
