use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskweave_bus::{event_types, Event, EventBus, SubscriptionHandle};
use taskweave_core::TaskweaveResult;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

enum Entry {
    Event(Box<Event>),
    Close(oneshot::Sender<u64>),
}

/// Append-only JSON-lines record of every event published on the bus.
///
/// Events are captured by a synchronous wildcard handler, so they land in
/// publish order, and written by a background task.
pub struct EventJournal {
    tx: mpsc::UnboundedSender<Entry>,
    writer: JoinHandle<()>,
    path: PathBuf,
    subscription: Option<SubscriptionHandle>,
}

impl EventJournal {
    /// Open (or create) the journal file and start the writer task.
    pub async fn open(path: PathBuf) -> TaskweaveResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Entry>();
        let log_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut out = tokio::io::BufWriter::new(file);
            let mut written = 0u64;
            while let Some(entry) = rx.recv().await {
                match entry {
                    Entry::Event(event) => {
                        let Some(line) = encode_line(&*event, &log_path) else {
                            continue;
                        };
                        if let Err(e) = out.write_all(line.as_bytes()).await {
                            warn!(path = %log_path.display(), error = %e, "Journal write failed");
                            continue;
                        }
                        written += 1;
                    }
                    Entry::Close(done) => {
                        if let Err(e) = out.flush().await {
                            warn!(path = %log_path.display(), error = %e, "Journal flush failed");
                        }
                        let _ = done.send(written);
                        return;
                    }
                }
            }
            let _ = out.flush().await;
        });

        Ok(Self {
            tx,
            writer,
            path,
            subscription: None,
        })
    }

    /// Start recording every event published on `bus`.
    pub fn attach(&mut self, bus: &Arc<EventBus>) -> TaskweaveResult<()> {
        let tx = self.tx.clone();
        let handle = bus.subscribe(event_types::WILDCARD, i32::MIN, move |event| {
            let _ = tx.send(Entry::Event(Box::new(event.clone())));
            Ok(())
        })?;
        self.subscription = Some(handle);
        info!(path = %self.path.display(), "Event journal attached");
        Ok(())
    }

    /// Detach from `bus`, flush and return the number of lines written.
    pub async fn close(mut self, bus: &EventBus) -> u64 {
        if let Some(handle) = self.subscription.take() {
            bus.unsubscribe(&handle);
        }
        let (done, written) = oneshot::channel();
        if self.tx.send(Entry::Close(done)).is_err() {
            return 0;
        }
        let count = written.await.unwrap_or(0);
        let _ = self.writer.await;
        info!(path = %self.path.display(), events = count, "Event journal closed");
        count
    }
}

/// `entry` as one newline-terminated JSON line. Entries that cannot be
/// encoded are logged and skipped.
fn encode_line<T: Serialize>(entry: &T, path: &Path) -> Option<String> {
    match serde_json::to_string(entry) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Journal entry not serializable, skipped");
            None
        }
    }
}
