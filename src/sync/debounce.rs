use crate::models::ProgressRecord;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives the coalesced progress writes once the window has been quiet.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync + 'static {
    async fn flush(&self, records: Vec<ProgressRecord>);
}

/// Trailing-edge debounce of progress updates.
///
/// Every update restarts the quiet window. When it expires the latest record
/// per `mangaId-chapterId` key is handed to the sink, one write per key.
pub struct ProgressDebouncer {
    tx: mpsc::UnboundedSender<ProgressRecord>,
    task: JoinHandle<()>,
}

impl ProgressDebouncer {
    pub fn spawn(window: Duration, sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(window, rx, sink));
        Self { tx, task }
    }

    pub fn push(&self, record: ProgressRecord) {
        if self.tx.send(record).is_err() {
            debug!("[SYNC] Progress debouncer already stopped");
        }
    }

    /// Flushes whatever is still waiting and stops the task.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            debug!("[SYNC] Progress debouncer ended abnormally: {}", e);
        }
    }
}

async fn run(
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<ProgressRecord>,
    sink: Arc<dyn ProgressSink>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = BTreeMap::new();
        batch.insert(first.key(), first);

        let closed = loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(record) => {
                        batch.insert(record.key(), record);
                    }
                    None => break true,
                },
                _ = tokio::time::sleep(window) => break false,
            }
        };

        debug!("[SYNC] Flushing {} debounced progress writes", batch.len());
        sink.flush(batch.into_values().collect()).await;

        if closed {
            return;
        }
    }
}
