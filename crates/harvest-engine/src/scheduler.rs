//! The supervisor: named concurrency budgets and cooperative
//! cancellation.
//!
//! Components call [`Supervisor::checkpoint`] before suspending on I/O,
//! so a SIGINT/SIGTERM takes effect at well-defined points: in-flight
//! writes finish, metadata is persisted, and the process exits non-zero.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::error::{EngineError, Result};

/// Named concurrency budgets, all overridable from the CLI.
#[derive(Debug, Clone)]
pub struct Budgets {
    /// Concurrent bulk export file downloads.
    pub bulk_download: usize,
    /// Patients in flight during a crawl.
    pub crawl_patients: usize,
    /// Resource-type queries in flight per patient.
    pub crawl_types: usize,
    /// Attachment fetches during hydration; deliberately small so note
    /// servers are not overwhelmed.
    pub hydrate_attachments: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            bulk_download: 5,
            crawl_patients: 8,
            crawl_types: 4,
            hydrate_attachments: 4,
        }
    }
}

/// Owns the budgets and the cancellation flag for one run.
pub struct Supervisor {
    budgets: Budgets,
    cancel_tx: watch::Sender<bool>,
    bulk_downloads: Arc<Semaphore>,
    hydrate_attachments: Arc<Semaphore>,
}

impl Supervisor {
    pub fn new(budgets: Budgets) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            bulk_downloads: Arc::new(Semaphore::new(budgets.bulk_download.max(1))),
            hydrate_attachments: Arc::new(Semaphore::new(budgets.hydrate_attachments.max(1))),
            budgets,
            cancel_tx,
        }
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    /// Flag cancellation; tasks notice at their next checkpoint.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Fails with [`EngineError::Cancelled`] once cancellation was
    /// requested. Call before suspending on I/O.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wire SIGINT and SIGTERM to cancellation. Call once from the CLI.
    pub fn install_signal_handler(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut terminate =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(signal) => signal,
                        Err(err) => {
                            tracing::warn!(error = %err, "Could not install SIGTERM handler");
                            let _ = ctrl_c.await;
                            supervisor.cancel();
                            return;
                        }
                    };
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            tracing::warn!("Interrupt received; finishing in-flight writes");
            supervisor.cancel();
        });
    }

    pub fn bulk_downloads(&self) -> Arc<Semaphore> {
        Arc::clone(&self.bulk_downloads)
    }

    pub fn hydrate_attachments(&self) -> Arc<Semaphore> {
        Arc::clone(&self.hydrate_attachments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let budgets = Budgets::default();
        assert_eq!(budgets.bulk_download, 5);
        assert_eq!(budgets.crawl_patients, 8);
        assert_eq!(budgets.crawl_types, 4);
        assert_eq!(budgets.hydrate_attachments, 4);
    }

    #[test]
    fn test_cancellation_flag() {
        let supervisor = Supervisor::new(Budgets::default());
        assert!(supervisor.checkpoint().is_ok());
        supervisor.cancel();
        assert!(supervisor.is_cancelled());
        assert!(matches!(
            supervisor.checkpoint(),
            Err(EngineError::Cancelled)
        ));
    }
}
