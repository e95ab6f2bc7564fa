use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tg_postbot::config::{self, Config, SharedConfig};
use tg_postbot::content::ContentStore;
use tg_postbot::model::Reason;
use tg_postbot::scheduler::{Scheduler, SchedulerError};
use tg_postbot::state::StateStore;
use tg_postbot::transport::{MediaSender, Notifier};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct SendCall {
    chat_id: String,
    asset: PathBuf,
    caption: String,
}

#[derive(Clone, Default)]
struct RecordingSender {
    fail_with: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<SendCall>>>,
}

impl RecordingSender {
    async fn fail_with(&self, text: &str) {
        *self.fail_with.lock().await = Some(text.to_string());
    }

    async fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MediaSender for RecordingSender {
    async fn send(&self, chat_id: &str, asset: &Path, caption: &str) -> Result<()> {
        self.calls.lock().await.push(SendCall {
            chat_id: chat_id.to_string(),
            asset: asset.to_path_buf(),
            caption: caption.to_string(),
        });
        match self.fail_with.lock().await.as_ref() {
            Some(text) => Err(anyhow!(text.clone())),
            None => Ok(()),
        }
    }

    async fn probe(&self, _chat_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    admin_msgs: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    async fn admin_msgs(&self) -> Vec<String> {
        self.admin_msgs.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_admins(&self, text: &str) {
        self.admin_msgs.lock().await.push(text.to_string());
    }

    async fn reply(&self, _chat_id: i64, _text: &str) {}
}

struct Harness {
    _td: TempDir,
    store: ContentStore,
    scheduler: Scheduler,
    sender: RecordingSender,
    notifier: RecordingNotifier,
    config: SharedConfig,
    state_path: PathBuf,
}

fn example_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

fn harness(cfg: Config) -> Harness {
    let td = TempDir::new().unwrap();
    let store = ContentStore::new(td.path().join("content"));
    let state_path = td.path().join("state.json");
    let config = SharedConfig::new(cfg);
    let sender = RecordingSender::default();
    let notifier = RecordingNotifier::default();
    let scheduler = Scheduler::new(
        config.clone(),
        store.clone(),
        StateStore::new(&state_path),
        Arc::new(sender.clone()),
        Arc::new(notifier.clone()),
    );
    Harness {
        _td: td,
        store,
        scheduler,
        sender,
        notifier,
        config,
        state_path,
    }
}

fn seed(store: &ContentStore, dest: &str, category: &str, names: &[&str]) {
    for name in names {
        store.write(dest, category, b"payload", name).unwrap();
    }
}

// Destinations [nature, city], nature has one asset, city none: tick one
// posts and deletes, tick two reports no_content, rotation advances anyway.
#[tokio::test]
async fn end_to_end_rotation() {
    let h = harness(example_config());
    seed(&h.store, "nature", "Forest", &["a.jpg"]);

    let outcome = h.scheduler.tick().await.unwrap();
    assert!(outcome.ok);
    assert!(!outcome.asset.as_ref().unwrap().exists(), "asset deleted on success");

    let calls = h.sender.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].chat_id, "-1001111111111");
    assert_eq!(calls[0].caption, "#forest");

    let snap = h.scheduler.status().await;
    assert_eq!(snap.next_destination.as_deref(), Some("city"));
    assert!(snap.last_post_time.is_some());

    let outcome = h.scheduler.tick().await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.reason, Reason::NoContent);
    assert_eq!(outcome.destination, "city");

    // Index wrapped back to the first destination despite the failure.
    let snap = h.scheduler.status().await;
    assert_eq!(snap.next_destination.as_deref(), Some("nature"));

    let msgs = h.notifier.admin_msgs().await;
    assert!(msgs.iter().any(|m| m.contains("no matching files")));
}

#[tokio::test]
async fn round_robin_is_fair_over_many_ticks() {
    let h = harness(example_config());
    seed(&h.store, "nature", "Forest", &["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
    seed(&h.store, "city", "Night", &["x.jpg", "y.jpg", "z.jpg", "w.jpg"]);

    for _ in 0..6 {
        h.scheduler.tick().await.unwrap();
    }
    let chats: Vec<String> = h.sender.calls().await.into_iter().map(|c| c.chat_id).collect();
    assert_eq!(
        chats,
        [
            "-1001111111111",
            "-1002222222222",
            "-1001111111111",
            "-1002222222222",
            "-1001111111111",
            "-1002222222222",
        ]
    );
}

#[tokio::test]
async fn send_failure_keeps_asset_and_dispatches_diagnostics() {
    let h = harness(example_config());
    seed(&h.store, "nature", "Forest", &["a.jpg"]);
    h.sender.fail_with("Bad Request: chat not found").await;

    let outcome = h.scheduler.tick().await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.reason, Reason::SendFailed);
    // The transport's error text is carried verbatim in the detail.
    assert!(outcome.detail.contains("Bad Request: chat not found"));

    // The asset survives a failed send.
    let cfg = h.config.load();
    let dest = cfg.destination("nature").unwrap();
    let assets = h
        .store
        .list_assets(dest, &cfg.settings.supported_formats)
        .unwrap();
    assert_eq!(assets.len(), 1);

    let msgs = h.notifier.admin_msgs().await;
    let diag = msgs
        .iter()
        .find(|m| m.contains("Failed to publish"))
        .expect("diagnostic notification");
    assert!(diag.contains("transport rejected the delivery"));
    assert!(diag.contains("chat id is wrong"), "hint from the error table");
    assert!(diag.contains("Bad Request: chat not found"));

    // Rotation still advanced.
    let snap = h.scheduler.status().await;
    assert_eq!(snap.next_destination.as_deref(), Some("city"));
}

#[tokio::test]
async fn low_content_alert_fires_once_per_crossing() {
    let h = harness(example_config());
    // Both destinations are below the default threshold of 10.
    seed(&h.store, "nature", "Forest", &["a.jpg", "b.jpg", "c.jpg"]);

    for _ in 0..3 {
        let _ = h.scheduler.tick().await;
    }
    let low_alerts = h
        .notifier
        .admin_msgs()
        .await
        .into_iter()
        .filter(|m| m.contains("Low content!"))
        .count();
    // One alert per destination, no re-alerts on later ticks.
    assert_eq!(low_alerts, 2);
}

#[tokio::test]
async fn rotation_survives_restart() {
    let td = TempDir::new().unwrap();
    let store = ContentStore::new(td.path().join("content"));
    let state_path = td.path().join("state.json");
    seed(&store, "nature", "Forest", &["a.jpg", "b.jpg"]);

    let config = SharedConfig::new(example_config());
    let sender = RecordingSender::default();
    let scheduler = Scheduler::new(
        config.clone(),
        store.clone(),
        StateStore::new(&state_path),
        Arc::new(sender.clone()),
        Arc::new(RecordingNotifier::default()),
    );
    scheduler.tick().await.unwrap();
    assert_eq!(
        scheduler.status().await.next_destination.as_deref(),
        Some("city")
    );
    drop(scheduler);

    // A fresh scheduler over the same state file resumes from the
    // persisted index.
    let scheduler = Scheduler::new(
        config,
        store,
        StateStore::new(&state_path),
        Arc::new(sender),
        Arc::new(RecordingNotifier::default()),
    );
    assert_eq!(
        scheduler.status().await.next_destination.as_deref(),
        Some("city")
    );
}

#[tokio::test]
async fn start_stop_lifecycle() {
    let h = harness(example_config());

    h.scheduler.start().await.unwrap();
    assert!(h.scheduler.is_running());
    assert_eq!(
        h.scheduler.start().await,
        Err(SchedulerError::AlreadyRunning)
    );

    assert!(h.scheduler.stop().await);
    assert!(!h.scheduler.is_running());
    // Idempotent by default, strict on request.
    assert!(!h.scheduler.stop().await);
    assert_eq!(
        h.scheduler.stop_strict().await,
        Err(SchedulerError::NotRunning)
    );

    let raw = fs::read_to_string(&h.state_path).unwrap();
    assert!(raw.contains("\"active\": false"));
}

#[tokio::test]
async fn reconfigure_keeps_survivor_order_and_appends_new() {
    let h = harness(example_config());
    seed(&h.store, "nature", "Forest", &["a.jpg", "b.jpg"]);
    seed(&h.store, "city", "Night", &["x.jpg", "y.jpg"]);

    // New snapshot lists city first and adds a third destination; the
    // rotation must keep [nature, city] and append the newcomer.
    let mut updated = example_config();
    updated.destinations.reverse();
    updated.destinations.push(tg_postbot::config::Destination {
        id: "art".to_string(),
        name: "Art".to_string(),
        chat_id: "-1003333333333".to_string(),
        enabled: true,
        categories: vec![tg_postbot::config::Category {
            folder: "Paint".to_string(),
            hashtags: vec!["#paint".to_string()],
        }],
    });
    h.config.swap(updated);
    let (added, removed) = h.scheduler.reconfigure().await;
    assert_eq!(added, vec!["art".to_string()]);
    assert!(removed.is_empty());

    seed(&h.store, "art", "Paint", &["p.jpg"]);
    for _ in 0..3 {
        h.scheduler.tick().await.unwrap();
    }
    let chats: Vec<String> = h.sender.calls().await.into_iter().map(|c| c.chat_id).collect();
    assert_eq!(
        chats,
        ["-1001111111111", "-1002222222222", "-1003333333333"]
    );
}

#[tokio::test]
async fn disabling_a_destination_clamps_a_stale_index() {
    let h = harness(example_config());
    seed(&h.store, "nature", "Forest", &["a.jpg", "b.jpg"]);

    // Advance so the persisted index points at the second destination.
    h.scheduler.tick().await.unwrap();
    assert_eq!(
        h.scheduler.status().await.next_destination.as_deref(),
        Some("city")
    );

    let mut updated = example_config();
    updated.destinations.retain(|d| d.id == "nature");
    h.config.swap(updated);
    let (added, removed) = h.scheduler.reconfigure().await;
    assert!(added.is_empty());
    assert_eq!(removed, vec!["city".to_string()]);

    let snap = h.scheduler.status().await;
    assert_eq!(snap.destination_count, 1);
    assert_eq!(snap.next_destination.as_deref(), Some("nature"));
}

#[tokio::test]
async fn post_to_does_not_advance_rotation() {
    let h = harness(example_config());
    seed(&h.store, "city", "Night", &["x.jpg"]);

    let outcome = h.scheduler.post_to("city").await;
    assert!(outcome.ok);
    assert_eq!(
        h.scheduler.status().await.next_destination.as_deref(),
        Some("nature")
    );
}
