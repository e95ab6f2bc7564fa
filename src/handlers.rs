use crate::config::{self, Config, SharedConfig};
use crate::content::ContentStore;
use crate::model::Submission;
use crate::scheduler::Scheduler;
use crate::{aggregator::Aggregator, transport::MediaSender};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{MediaKind, MessageKind};
use tracing::{instrument, warn};

/// Two-tier roles. Admins control posting; users may look and upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    User,
    Admin,
}

/// Capability check applied uniformly at dispatch, before any command or
/// upload is handled.
pub fn role_of(cfg: &Config, user_id: i64) -> Option<Role> {
    if cfg.telegram.admin_ids.contains(&user_id) {
        Some(Role::Admin)
    } else if cfg.telegram.user_ids.contains(&user_id) {
        Some(Role::User)
    } else {
        None
    }
}

fn required_role(command: &str) -> Role {
    match command {
        "/posting_start" | "/posting_stop" | "/post_now" | "/reload" | "/test" => Role::Admin,
        _ => Role::User,
    }
}

/// Everything the update handler needs, cheap to clone into the repl closure.
#[derive(Clone)]
pub struct Services {
    pub config: SharedConfig,
    pub config_path: PathBuf,
    pub store: ContentStore,
    pub scheduler: Scheduler,
    pub aggregator: Aggregator,
    pub sender: Arc<dyn MediaSender>,
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, services: &Services, msg: &Message) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let uid = user.id.0 as i64;
    let cfg = services.config.load();
    let Some(role) = role_of(&cfg, uid) else {
        warn!(uid, username = user.username.as_deref().unwrap_or(""), "access denied");
        let _ = bot
            .send_message(msg.chat.id, "Access denied. Contact an administrator.")
            .await;
        return Ok(());
    };

    if let Some(text) = msg.text() {
        let trimmed = text.trim();
        if trimmed.starts_with('/') {
            let mut parts = trimmed.split_whitespace();
            let command = parts.next().unwrap_or_default();
            let arg = parts.next();
            if role < required_role(command) {
                warn!(uid, command, "access denied: administrator rights required");
                let _ = bot
                    .send_message(msg.chat.id, "Access denied. Administrator rights required.")
                    .await;
                return Ok(());
            }
            return dispatch_command(bot, services, msg, &cfg, role, command, arg).await;
        }
        let _ = bot
            .send_message(msg.chat.id, "Send media with a hashtag caption, or /help.")
            .await;
        return Ok(());
    }

    if let MessageKind::Common(common) = &msg.kind {
        return handle_media(bot, services, msg, &common.media_kind).await;
    }
    Ok(())
}

async fn dispatch_command(
    bot: &Bot,
    services: &Services,
    msg: &Message,
    cfg: &Config,
    role: Role,
    command: &str,
    arg: Option<&str>,
) -> Result<()> {
    match command {
        "/start" => {
            let role_name = match role {
                Role::Admin => "administrator",
                Role::User => "user",
            };
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!("Auto-posting bot.\nYour role: {role_name}\nUse /help for commands."),
                )
                .await;
        }
        "/help" => {
            let mut text = String::from(
                "Commands:\n\
                 /status - bot status\n\
                 /stats [channel] - content statistics\n\
                 /channels - channel list\n\
                 Send a photo/video/document with a hashtag caption to upload.\n\
                 Albums (media groups) are supported.",
            );
            if role == Role::Admin {
                text.push_str(
                    "\n\nAdmin commands:\n\
                     /posting_start - start autoposting\n\
                     /posting_stop - stop autoposting\n\
                     /post_now [channel] - post immediately\n\
                     /reload - reload configuration\n\
                     /test - channel connectivity test",
                );
            }
            let _ = bot.send_message(msg.chat.id, text).await;
        }
        "/status" => {
            let text = format_status(cfg, services).await;
            let _ = bot.send_message(msg.chat.id, text).await;
        }
        "/stats" => {
            let text = format_stats(cfg, &services.store, arg);
            let _ = bot.send_message(msg.chat.id, text).await;
        }
        "/channels" => {
            let mut lines = vec!["Channels:".to_string()];
            for dest in &cfg.destinations {
                let state = if dest.enabled { "on" } else { "off" };
                lines.push(format!(
                    "[{state}] {} - {} categories",
                    dest.name,
                    dest.categories.len()
                ));
            }
            let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
        }
        "/posting_start" => {
            let reply = match services.scheduler.start().await {
                Ok(()) => "Autoposting started!",
                Err(_) => "Autoposting is already running.",
            };
            let _ = bot.send_message(msg.chat.id, reply).await;
        }
        "/posting_stop" => {
            let reply = if services.scheduler.stop().await {
                "Autoposting stopped."
            } else {
                "Autoposting is not running."
            };
            let _ = bot.send_message(msg.chat.id, reply).await;
        }
        "/post_now" => {
            let dest_id = match arg {
                Some(id) => {
                    if cfg.destination(id).is_none() {
                        let _ = bot
                            .send_message(msg.chat.id, format!("Channel '{id}' not found."))
                            .await;
                        return Ok(());
                    }
                    id.to_string()
                }
                None => match services.scheduler.next_destination_id().await {
                    Some(id) => id,
                    None => {
                        let _ = bot
                            .send_message(msg.chat.id, "No available channels.")
                            .await;
                        return Ok(());
                    }
                },
            };
            let _ = bot
                .send_message(msg.chat.id, format!("Publishing to {dest_id}..."))
                .await;
            let outcome = services.scheduler.post_to(&dest_id).await;
            let reply = if outcome.ok {
                "Published!".to_string()
            } else {
                format!(
                    "Publish failed\nReason: {}\nDetail: {}",
                    outcome.reason.as_str(),
                    outcome.detail
                )
            };
            let _ = bot.send_message(msg.chat.id, reply).await;
        }
        "/reload" => match config::load(Some(&services.config_path)) {
            Ok(new_cfg) => {
                services.config.swap(new_cfg);
                let (added, removed) = services.scheduler.reconfigure().await;
                let reloaded = services.config.load();
                let mut lines = vec![
                    "Configuration reloaded".to_string(),
                    format!("Channels: {}", reloaded.enabled_destinations().count()),
                    format!("Admins: {}", reloaded.telegram.admin_ids.len()),
                ];
                if !added.is_empty() {
                    lines.push(format!("Added: {}", added.join(", ")));
                }
                if !removed.is_empty() {
                    lines.push(format!("Removed: {}", removed.join(", ")));
                }
                let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
            }
            Err(err) => {
                let _ = bot
                    .send_message(msg.chat.id, format!("Reload failed: {err}"))
                    .await;
            }
        },
        "/test" => {
            let mut lines = vec!["Connectivity test:".to_string()];
            for dest in cfg.enabled_destinations() {
                match services.sender.probe(&dest.chat_id).await {
                    Ok(()) => lines.push(format!("{}: OK", dest.name)),
                    Err(err) => {
                        let mut text = err.to_string();
                        text.truncate(60);
                        lines.push(format!("{}: {text}", dest.name));
                    }
                }
            }
            let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
        }
        _ => {
            let _ = bot.send_message(msg.chat.id, "Unknown command.").await;
        }
    }
    Ok(())
}

async fn format_status(cfg: &Config, services: &Services) -> String {
    let snap = services.scheduler.status().await;
    let totals = content_totals(cfg, &services.store);
    let mut lines = vec!["Bot status".to_string()];
    lines.push(
        if snap.running {
            "Autoposting: running"
        } else {
            "Autoposting: stopped"
        }
        .to_string(),
    );
    lines.push(format!("Interval: {} min", cfg.schedule.post_interval_minutes));
    if let Some(next) = &snap.next_destination {
        let name = cfg
            .destination(next)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| next.clone());
        lines.push(format!("Next channel: {name}"));
    }
    lines.push(format!("Channels: {}", snap.destination_count));
    if let Some(last) = snap.last_post_time {
        lines.push(format!("Last post: {}", last.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    lines.push(format!("Content: {} files", totals.values().sum::<usize>()));

    let threshold = cfg.settings.low_content_threshold;
    let low: Vec<(&String, &usize)> = totals.iter().filter(|(_, &n)| n < threshold).collect();
    if !low.is_empty() {
        lines.push("Low content:".to_string());
        for (dest_id, count) in low {
            let name = cfg
                .destination(dest_id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| dest_id.clone());
            lines.push(format!("  {name}: {count} files"));
        }
    }
    lines.join("\n")
}

/// Content statistics, optionally narrowed to one destination.
fn format_stats(cfg: &Config, store: &ContentStore, filter: Option<&str>) -> String {
    let interval = cfg.schedule.post_interval_minutes;
    let posts_per_day = if interval > 0 { (24 * 60) / interval } else { 0 };
    let enabled = cfg.enabled_destinations().count();

    if let Some(dest_id) = filter {
        let Some(dest) = cfg.destination(dest_id) else {
            let known: Vec<&str> = cfg.destinations.iter().map(|d| d.id.as_str()).collect();
            return format!(
                "Channel '{dest_id}' not found.\nAvailable: {}",
                known.join(", ")
            );
        };
        let counts = store.counts(dest, &cfg.settings.supported_formats);
        let per_channel_per_day = if enabled > 0 {
            posts_per_day as f64 / enabled as f64
        } else {
            0.0
        };
        let mut lines = vec![format!("Statistics: {}", dest.name)];
        lines.push(format!("Total files: {}", counts.total));
        if counts.total > 0 && per_channel_per_day > 0.0 {
            lines.push(format!(
                "Enough for: {:.1} days ({:.1} posts/day)",
                counts.total as f64 / per_channel_per_day,
                per_channel_per_day
            ));
        }
        lines.push("By category:".to_string());
        for (cat, count) in &counts.categories {
            lines.push(format!("  {cat}: {count}"));
        }
        // Configured categories with no files yet.
        for cat in &dest.categories {
            if !counts.categories.contains_key(&cat.folder) {
                lines.push(format!("  {}: 0 (empty)", cat.folder));
            }
        }
        return lines.join("\n");
    }

    let totals = content_totals(cfg, store);
    let total: usize = totals.values().sum();
    let mut lines = vec!["Content statistics".to_string()];
    lines.push(format!("Total files: {total}"));
    if total > 0 && posts_per_day > 0 {
        lines.push(format!(
            "Enough for: {:.1} days ({posts_per_day} posts/day, every {interval} min)",
            total as f64 / posts_per_day as f64
        ));
    }
    lines.push("By channel:".to_string());
    for dest in cfg.enabled_destinations() {
        let counts = store.counts(dest, &cfg.settings.supported_formats);
        lines.push(format!("{}: {}", dest.name, counts.total));
        for (cat, count) in &counts.categories {
            lines.push(format!("  {cat}: {count}"));
        }
    }
    lines.join("\n")
}

fn content_totals(cfg: &Config, store: &ContentStore) -> BTreeMap<String, usize> {
    cfg.enabled_destinations()
        .map(|d| {
            (
                d.id.clone(),
                store.counts(d, &cfg.settings.supported_formats).total,
            )
        })
        .collect()
}

async fn handle_media(
    bot: &Bot,
    services: &Services,
    msg: &Message,
    media: &MediaKind,
) -> Result<()> {
    let Some((file_id, ext_hint)) = extract_file_info(media) else {
        let _ = bot.send_message(msg.chat.id, "Unsupported message type.").await;
        return Ok(());
    };

    let tmp_dir = services.store.root().join(".incoming");
    let (bytes, ext, unique_id) = download_bytes(bot, &tmp_dir, &file_id, &ext_hint).await?;
    let submission = Submission {
        bytes,
        suggested_name: format!("tg_{}_{unique_id}{ext}", msg.id.0),
        caption: msg.caption().map(str::to_owned),
    };
    let chat_id = msg.chat.id.0;

    // Albums arrive as a burst sharing a media group id; the aggregator
    // debounces them and acknowledges the whole batch once.
    if let Some(group_id) = msg.media_group_id() {
        services.aggregator.ingest(group_id, chat_id, submission).await;
    } else {
        services.aggregator.ingest_single(chat_id, submission).await;
    }
    Ok(())
}

/// Returns `(file_id, extension hint)` for a media message.
fn extract_file_info(media: &MediaKind) -> Option<(String, String)> {
    match media {
        MediaKind::Photo(photo) => photo
            .photo
            .last()
            .map(|size| (size.file.id.clone(), ".jpg".to_string())),
        MediaKind::Video(video) => Some((video.video.file.id.clone(), ".mp4".to_string())),
        MediaKind::Animation(anim) => Some((anim.animation.file.id.clone(), ".gif".to_string())),
        MediaKind::Document(doc) => {
            let ext = doc
                .document
                .file_name
                .as_deref()
                .and_then(|name| Path::new(name).extension())
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .or_else(|| {
                    let mime = doc
                        .document
                        .mime_type
                        .as_ref()
                        .map(|m| m.to_string().to_lowercase())
                        .unwrap_or_default();
                    if mime.contains("video") || mime.contains("mp4") {
                        Some(".mp4".to_string())
                    } else if mime.contains("gif") {
                        Some(".gif".to_string())
                    } else if mime.contains("png") {
                        Some(".png".to_string())
                    } else if mime.contains("webp") {
                        Some(".webp".to_string())
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| ".jpg".to_string());
            Some((doc.document.file.id.clone(), ext))
        }
        _ => None,
    }
}

/// Download a Telegram file into memory via a scratch file under the
/// content root (the `.incoming` name never matches a period directory).
async fn download_bytes(
    bot: &Bot,
    tmp_dir: &Path,
    file_id: &str,
    ext_hint: &str,
) -> Result<(Vec<u8>, String, String)> {
    let file = bot.get_file(file_id).await?;
    // Prefer the extension Telegram reports for the stored file.
    let ext = Path::new(&file.path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_else(|| ext_hint.to_string());
    tokio::fs::create_dir_all(tmp_dir).await.ok();
    let tmp = tmp_dir.join(format!("{}{ext}", file.meta.unique_id));
    let mut dst = tokio::fs::File::create(&tmp).await?;
    bot.download_file(&file.path, &mut dst).await?;
    drop(dst);
    let bytes = tokio::fs::read(&tmp).await?;
    let _ = tokio::fs::remove_file(&tmp).await;
    Ok((bytes, ext, file.meta.unique_id.clone()))
}
