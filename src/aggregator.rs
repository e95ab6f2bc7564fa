//! Debounced aggregation of multi-file submissions (Telegram media groups).
//!
//! Every arrival for a batch key appends to that key's pending buffer and
//! reschedules its flush timer; the batch flushes as one unit after a quiet
//! period with no new arrivals. Single captioned submissions take the same
//! write-and-notify path with an immediate flush.
use crate::config::SharedConfig;
use crate::content::ContentStore;
use crate::model::{FlushSummary, Submission};
use crate::transport::Notifier;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

struct PendingBatch {
    chat_id: i64,
    items: Vec<Submission>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    store: ContentStore,
    config: SharedConfig,
    notifier: Arc<dyn Notifier>,
    quiet: Duration,
    batches: Mutex<HashMap<String, PendingBatch>>,
}

#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(
        store: ContentStore,
        config: SharedConfig,
        notifier: Arc<dyn Notifier>,
        quiet: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                notifier,
                quiet,
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Append `item` to the pending batch for `key`, (re)starting its quiet
    /// period. Append-then-reschedule happens under one lock acquisition, so
    /// concurrent ingestion for the same key is serialized.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn ingest(&self, key: &str, chat_id: i64, item: Submission) {
        let mut batches = self.inner.batches.lock().await;
        let batch = batches.entry(key.to_string()).or_insert_with(|| PendingBatch {
            chat_id,
            items: Vec::new(),
            timer: None,
        });
        batch.items.push(item);
        if let Some(old) = batch.timer.take() {
            old.abort();
        }
        let inner = self.inner.clone();
        let key = key.to_string();
        batch.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.quiet).await;
            Inner::flush(&inner, &key).await;
        }));
    }

    /// Degenerate batch of size one: same filing and notification path as a
    /// timer-fired flush, executed immediately.
    #[instrument(skip_all)]
    pub async fn ingest_single(&self, chat_id: i64, item: Submission) {
        let summary = self.inner.file_items(std::slice::from_ref(&item));
        self.inner.report(chat_id, &summary).await;
    }

    /// Number of batches currently awaiting their quiet period.
    pub async fn pending_batches(&self) -> usize {
        self.inner.batches.lock().await.len()
    }
}

impl Inner {
    async fn flush(inner: &Arc<Inner>, key: &str) {
        let batch = inner.batches.lock().await.remove(key);
        let Some(batch) = batch else {
            return;
        };
        info!(key, items = batch.items.len(), "flushing batch");
        let summary = inner.file_items(&batch.items);
        inner.report(batch.chat_id, &summary).await;
    }

    /// Write every item of a batch into the content tree. The batch caption
    /// is the first non-empty one in arrival order; its first hashtag
    /// resolves the destination and category shared by all items. Per-item
    /// failures are counted but never block the other items.
    fn file_items(&self, items: &[Submission]) -> FlushSummary {
        let cfg = self.config.load();
        let caption = items
            .iter()
            .filter_map(|i| i.caption.as_deref())
            .find(|c| !c.trim().is_empty());
        let hashtag = caption.and_then(first_hashtag);
        let resolved = hashtag.and_then(|tag| {
            cfg.find_category_by_hashtag(tag)
                .map(|(d, c)| (d.id.clone(), c.folder.clone()))
        });

        let mut summary = FlushSummary::default();
        for item in items {
            let err = match (&hashtag, &resolved) {
                (None, _) => Some("no hashtag in the caption (example: #forest)".to_string()),
                (Some(tag), None) => {
                    Some(format!("hashtag {tag} does not match any category"))
                }
                (Some(_), Some((dest_id, folder))) => {
                    summary.destination = Some(dest_id.clone());
                    summary.category = Some(folder.clone());
                    match self
                        .store
                        .write(dest_id, folder, &item.bytes, &item.suggested_name)
                    {
                        Ok(_) => None,
                        Err(err) => Some(err.to_string()),
                    }
                }
            };
            match err {
                None => summary.saved += 1,
                Some(err) => {
                    warn!(error = %err, name = %item.suggested_name, "failed to file submission");
                    summary.errors += 1;
                    summary.first_error.get_or_insert(err);
                }
            }
        }
        summary
    }

    /// Exactly one notification per batch.
    async fn report(&self, chat_id: i64, summary: &FlushSummary) {
        let cfg = self.config.load();
        let text = if summary.saved > 0 {
            let dest_name = summary
                .destination
                .as_deref()
                .and_then(|id| cfg.destination(id))
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "?".to_string());
            let mut text = format!("Saved {} file(s)", summary.saved);
            if summary.errors > 0 {
                text.push_str(&format!(" ({} errors)", summary.errors));
            }
            text.push_str(&format!(
                "\nChannel: {dest_name}\nCategory: {}",
                summary.category.as_deref().unwrap_or("?")
            ));
            text
        } else {
            format!(
                "Failed to save: {}",
                summary.first_error.as_deref().unwrap_or("unknown error")
            )
        };
        self.notifier.reply(chat_id, &text).await;
    }
}

/// First `#word` token of a caption.
fn first_hashtag(caption: &str) -> Option<&str> {
    caption.split_whitespace().find(|w| w.starts_with('#'))
}
