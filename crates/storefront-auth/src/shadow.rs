//! Persisted shadow writer
//!
//! The in-memory credential is authoritative; the SecretStore copy only
//! exists to survive restarts. Writes and deletes are queued to one
//! background worker so state transitions never wait on storage latency,
//! while operations still reach the store in the order they were issued.
//! A failed store call is logged and counted, never rolled back.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::credential::Credential;
use crate::metrics;
use crate::store::SecretStore;

enum ShadowOp {
    Write(Vec<u8>),
    Delete,
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence worker. The worker exits once every handle is
/// dropped and the queue has drained.
#[derive(Clone)]
pub(crate) struct ShadowWriter {
    tx: mpsc::UnboundedSender<ShadowOp>,
}

impl ShadowWriter {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub(crate) fn spawn(store: Arc<dyn SecretStore>, key: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    ShadowOp::Write(bytes) => match store.set(&key, bytes).await {
                        Ok(()) => debug!(key, "credential shadow written"),
                        Err(e) => {
                            metrics::record_persistence_failure("write");
                            warn!(key, error = %e, "failed to persist credential shadow");
                        }
                    },
                    ShadowOp::Delete => match store.delete(&key).await {
                        Ok(()) => debug!(key, "credential shadow deleted"),
                        Err(e) => {
                            metrics::record_persistence_failure("delete");
                            warn!(key, error = %e, "failed to delete credential shadow");
                        }
                    },
                    ShadowOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(key, "credential shadow writer stopped");
        });
        Self { tx }
    }

    pub(crate) fn write(&self, credential: &Credential) {
        match credential.to_shadow() {
            Ok(bytes) => self.send(ShadowOp::Write(bytes)),
            Err(e) => {
                metrics::record_persistence_failure("serialize");
                warn!(error = %e, "failed to serialize credential shadow");
            }
        }
    }

    pub(crate) fn delete(&self) {
        self.send(ShadowOp::Delete);
    }

    /// Wait until every operation queued before this call has been applied.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(ShadowOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn send(&self, op: ShadowOp) {
        if self.tx.send(op).is_err() {
            warn!("credential shadow writer is not running");
        }
    }
}
