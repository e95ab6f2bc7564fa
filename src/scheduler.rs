//! Restart-safe periodic publisher: one timer drives ticks, each tick posts
//! one asset to the next destination in round-robin order and persists the
//! rotation state before the attempt.
use crate::classify::classify;
use crate::config::{Config, SharedConfig};
use crate::content::ContentStore;
use crate::model::{PublishOutcome, Reason};
use crate::monitor::LowContentMonitor;
use crate::state::StateStore;
use crate::transport::{MediaSender, Notifier};
use chrono::{DateTime, Local, Timelike, Utc};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Grace delay for the first tick when there is no usable posting history.
const DEFAULT_FIRST_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("autoposting is already running")]
    AlreadyRunning,
    #[error("autoposting is not running")]
    NotRunning,
}

/// Point-in-time view of the scheduler for status reporting.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub running: bool,
    pub next_destination: Option<String>,
    pub last_post_time: Option<DateTime<Utc>>,
    pub destination_count: usize,
}

/// State touched only under the tick lock: rotation order, persisted
/// rotation state and the low-content warned set.
struct Core {
    rotation: Vec<String>,
    state: crate::state::RotationState,
    monitor: LowContentMonitor,
}

impl Core {
    /// Round-robin selection: reserve the current destination for this tick
    /// and advance the index. A stale index (list shrank) clamps to zero.
    fn advance_rotation(&mut self) -> Option<String> {
        if self.rotation.is_empty() {
            return None;
        }
        if self.state.current_index >= self.rotation.len() {
            self.state.current_index = 0;
        }
        let dest = self.rotation[self.state.current_index].clone();
        self.state.current_index = (self.state.current_index + 1) % self.rotation.len();
        Some(dest)
    }
}

struct Inner {
    config: SharedConfig,
    store: ContentStore,
    states: StateStore,
    sender: Arc<dyn MediaSender>,
    notifier: Arc<dyn Notifier>,
    core: Mutex<Core>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SharedConfig,
        store: ContentStore,
        states: StateStore,
        sender: Arc<dyn MediaSender>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let rotation: Vec<String> = config
            .load()
            .enabled_destinations()
            .map(|d| d.id.clone())
            .collect();
        let state = states.load(rotation.len());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                states,
                sender,
                notifier,
                core: Mutex::new(Core {
                    rotation,
                    state,
                    monitor: LowContentMonitor::new(),
                }),
                timer: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Begin the repeating timer. The first tick is scheduled so that a
    /// restart mid-cycle preserves the original cadence.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let cfg = self.inner.config.load();
        let interval = Duration::from_secs(cfg.schedule.post_interval_minutes * 60);
        let first_delay = {
            let mut core = self.inner.core.lock().await;
            core.state.active = true;
            if let Err(err) = self.inner.states.save(&core.state) {
                error!(?err, "failed to persist rotation state");
            }
            initial_delay(interval, core.state.last_post_time, Utc::now())
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let start_at = tokio::time::Instant::now() + first_delay;
            let mut ticker = tokio::time::interval_at(start_at, interval);
            // A tick that fires while the previous one is in flight is
            // dropped, not queued.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.run_tick().await;
            }
        });
        *self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);
        info!(
            interval_secs = interval.as_secs(),
            first_delay_secs = first_delay.as_secs(),
            "autoposting started"
        );
        Ok(())
    }

    /// Cancel the timer task (not just a flag: no late tick can fire after
    /// this returns). Idempotent; returns whether a timer was cancelled.
    pub async fn stop(&self) -> bool {
        let handle = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let was_running = handle.as_ref().is_some_and(|h| !h.is_finished());
        if let Some(handle) = handle {
            handle.abort();
        }
        let mut core = self.inner.core.lock().await;
        core.state.active = false;
        if let Err(err) = self.inner.states.save(&core.state) {
            error!(?err, "failed to persist rotation state");
        }
        if was_running {
            info!("autoposting stopped");
        }
        was_running
    }

    /// Strict variant for callers that must observe a running scheduler.
    pub async fn stop_strict(&self) -> Result<(), SchedulerError> {
        if self.stop().await {
            Ok(())
        } else {
            Err(SchedulerError::NotRunning)
        }
    }

    /// Execute one tick immediately, bypassing the posting-window gate.
    /// Serialized with timer ticks; returns None if one is already running.
    pub async fn tick(&self) -> Option<PublishOutcome> {
        self.inner.tick_guarded().await
    }

    /// Advance the rotation and return the reserved destination id.
    pub async fn next_destination_id(&self) -> Option<String> {
        let mut core = self.inner.core.lock().await;
        let dest = core.advance_rotation()?;
        if let Err(err) = self.inner.states.save(&core.state) {
            error!(?err, "failed to persist rotation state");
        }
        Some(dest)
    }

    /// Publish one asset to a specific destination without touching the
    /// rotation order. Used by the manual post command.
    pub async fn post_to(&self, dest_id: &str) -> PublishOutcome {
        let cfg = self.inner.config.load();
        let mut core = self.inner.core.lock().await;
        let outcome = self.inner.publish_one(&cfg, dest_id).await;
        if outcome.ok {
            core.state.last_post_time = Some(Utc::now());
            if let Err(err) = self.inner.states.save(&core.state) {
                error!(?err, "failed to persist rotation state");
            }
        }
        outcome
    }

    pub async fn status(&self) -> StatusSnapshot {
        let core = self.inner.core.lock().await;
        let next = core.rotation.get(core.state.current_index).cloned();
        StatusSnapshot {
            running: self.is_running(),
            next_destination: next,
            last_post_time: core.state.last_post_time,
            destination_count: core.rotation.len(),
        }
    }

    /// Rebuild the rotation from the current configuration snapshot:
    /// survivors keep their relative order, new destinations append at the
    /// end, a stale index clamps to zero. Returns (added, removed) ids.
    pub async fn reconfigure(&self) -> (Vec<String>, Vec<String>) {
        let cfg = self.inner.config.load();
        let new_ids: Vec<String> = cfg
            .enabled_destinations()
            .map(|d| d.id.clone())
            .collect();
        let mut core = self.inner.core.lock().await;
        let added: Vec<String> = new_ids
            .iter()
            .filter(|id| !core.rotation.contains(id))
            .cloned()
            .collect();
        let removed: Vec<String> = core
            .rotation
            .iter()
            .filter(|id| !new_ids.contains(id))
            .cloned()
            .collect();
        let mut rotation: Vec<String> = core
            .rotation
            .iter()
            .filter(|id| new_ids.contains(id))
            .cloned()
            .collect();
        rotation.extend(added.iter().cloned());
        if core.state.current_index >= rotation.len() {
            core.state.current_index = 0;
        }
        core.rotation = rotation;
        if let Err(err) = self.inner.states.save(&core.state) {
            error!(?err, "failed to persist rotation state");
        }
        info!(added = added.len(), removed = removed.len(), "rotation reconfigured");
        (added, removed)
    }
}

impl Inner {
    /// Timer entry point: apply the posting-window gate, then tick.
    #[instrument(skip_all)]
    async fn run_tick(&self) {
        let cfg = self.config.load();
        let hour = Local::now().hour();
        if !(cfg.schedule.first_post_hour..cfg.schedule.last_post_hour).contains(&hour) {
            debug!(hour, "outside posting window; skipping tick");
            return;
        }
        self.tick_guarded().await;
    }

    async fn tick_guarded(&self) -> Option<PublishOutcome> {
        let Ok(mut core) = self.core.try_lock() else {
            warn!("previous tick still in flight; dropping this one");
            return None;
        };
        let cfg = self.config.load();
        self.tick_inner(&cfg, &mut core).await
    }

    /// The atomic unit of work: select, publish, record, diagnose.
    async fn tick_inner(&self, cfg: &Config, core: &mut Core) -> Option<PublishOutcome> {
        let Some(dest_id) = core.advance_rotation() else {
            warn!("no enabled destinations");
            return None;
        };
        // Persist the advanced index before the attempt; a crash after this
        // point skips at most one destination instead of replaying it.
        if let Err(err) = self.states.save(&core.state) {
            error!(?err, "failed to persist rotation state; continuing tick");
        }
        info!(destination = dest_id, "posting tick");
        let outcome = self.publish_one(cfg, &dest_id).await;
        if outcome.ok {
            core.state.last_post_time = Some(Utc::now());
            if let Err(err) = self.states.save(&core.state) {
                error!(?err, "failed to persist rotation state");
            }
        } else {
            self.dispatch_diagnostics(cfg, &outcome).await;
        }
        self.check_low_content(cfg, core).await;
        Some(outcome)
    }

    async fn publish_one(&self, cfg: &Config, dest_id: &str) -> PublishOutcome {
        let Some(dest) = cfg.destination(dest_id) else {
            return PublishOutcome::failure(
                dest_id,
                Reason::NoContent,
                "destination missing from configuration",
            );
        };
        let formats = &cfg.settings.supported_formats;
        let assets = match self.store.list_assets(dest, formats) {
            Ok(assets) => assets,
            Err(err) => {
                return PublishOutcome::failure(
                    dest_id,
                    Reason::NoContent,
                    format!("failed to scan content tree: {err}"),
                )
            }
        };
        let Some(asset) = assets.choose(&mut rand::thread_rng()).cloned() else {
            return PublishOutcome::failure(
                dest_id,
                Reason::NoContent,
                "no files in supported formats under the destination folders",
            );
        };
        // Submissions may be removed externally between enumeration and send.
        if !asset.path.exists() {
            return PublishOutcome::failure(
                dest_id,
                Reason::FileMissing,
                format!("file vanished: {}", file_name(&asset.path)),
            );
        }
        let caption = asset.hashtag.clone().unwrap_or_default();
        if let Err(err) = self.sender.send(&dest.chat_id, &asset.path, &caption).await {
            let size = std::fs::metadata(&asset.path).map(|m| m.len()).unwrap_or(0);
            return PublishOutcome::failure(
                dest_id,
                Reason::SendFailed,
                format!(
                    "file: {} ({size} bytes), category: {}\ntransport error: {err}",
                    file_name(&asset.path),
                    asset.category
                ),
            );
        }
        if let Err(err) = std::fs::remove_file(&asset.path) {
            error!(?err, path = %asset.path.display(), "failed to delete published asset");
        } else {
            debug!(path = %asset.path.display(), "deleted published asset");
        }
        if let Err(err) = self.store.cleanup_empty() {
            error!(?err, "content cleanup failed");
        }
        PublishOutcome::success(dest_id, asset.path)
    }

    /// Classify the failure and fan a diagnostic message out to admins.
    async fn dispatch_diagnostics(&self, cfg: &Config, outcome: &PublishOutcome) {
        let diagnosis = classify(outcome);
        let dest_name = cfg
            .destination(&outcome.destination)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| outcome.destination.clone());
        let folders = self
            .store
            .folder_counts(&outcome.destination, &cfg.settings.supported_formats);
        let total: usize = folders.iter().map(|(_, n)| n).sum();

        let mut lines = vec![
            "Failed to publish".to_string(),
            format!("Channel: {dest_name} ({})", outcome.destination),
            format!("Reason: {}", diagnosis.reason_text),
        ];
        if let Some(hint) = diagnosis.hint {
            lines.push(format!("Hint: {hint}"));
        }
        if !outcome.detail.is_empty() {
            lines.push(format!("Detail: {}", outcome.detail));
        }
        lines.push(format!("Files under the channel folders: {total}"));
        if folders.is_empty() {
            lines.push("Channel folders are empty or missing".to_string());
        }
        for (folder, count) in folders.iter().take(15) {
            lines.push(format!("  {folder}: {count}"));
        }
        lines.push(format!("Time: {}", Local::now().format("%Y-%m-%d %H:%M:%S")));

        warn!(
            destination = outcome.destination,
            reason = outcome.reason.as_str(),
            detail = outcome.detail,
            "publish failed"
        );
        self.notifier.notify_admins(&lines.join("\n")).await;
    }

    async fn check_low_content(&self, cfg: &Config, core: &mut Core) {
        let threshold = cfg.settings.low_content_threshold;
        let counts: BTreeMap<String, usize> = cfg
            .enabled_destinations()
            .map(|d| {
                (
                    d.id.clone(),
                    self.store.counts(d, &cfg.settings.supported_formats).total,
                )
            })
            .collect();
        for (dest_id, count) in core.monitor.check(&counts, threshold) {
            let name = cfg
                .destination(&dest_id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| dest_id.clone());
            warn!(destination = dest_id, count, threshold, "low content");
            self.notifier
                .notify_admins(&format!(
                    "Low content!\nChannel: {name}\nRemaining: {count} files (threshold: {threshold})"
                ))
                .await;
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// First-tick delay preserving cadence across restarts:
/// `max(0, interval − elapsed_since(last_post))`, with a short grace delay
/// when there is no history or the interval already elapsed.
pub fn initial_delay(
    interval: Duration,
    last_post: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    if let Some(last) = last_post {
        if let Ok(elapsed) = now.signed_duration_since(last).to_std() {
            if let Some(remaining) = interval.checked_sub(elapsed) {
                if !remaining.is_zero() {
                    return remaining;
                }
            }
        }
    }
    DEFAULT_FIRST_DELAY
}
