//! Consumed delivery capabilities, abstracted behind traits so the core can
//! be exercised with recording implementations in tests.
use crate::config::SharedConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::Path;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, Recipient};
use tracing::{debug, info};

/// Delivers one asset to an outbound channel. Transport errors are returned
/// with their original text so diagnostics can pattern-match on it.
#[async_trait]
pub trait MediaSender: Send + Sync {
    async fn send(&self, chat_id: &str, asset: &Path, caption: &str) -> Result<()>;

    /// Lightweight connectivity probe for one channel.
    async fn probe(&self, chat_id: &str) -> Result<()>;
}

/// Best-effort text fan-out; individual recipient failures are swallowed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_admins(&self, text: &str);
    async fn reply(&self, chat_id: i64, text: &str);
}

pub struct TelegramSender {
    bot: Bot,
}

impl TelegramSender {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn recipient(chat_id: &str) -> Result<Recipient> {
    if let Some(username) = chat_id.strip_prefix('@') {
        return Ok(Recipient::ChannelUsername(format!("@{username}")));
    }
    let id: i64 = chat_id
        .parse()
        .map_err(|_| anyhow!("invalid chat id: {chat_id}"))?;
    Ok(Recipient::Id(ChatId(id)))
}

#[async_trait]
impl MediaSender for TelegramSender {
    async fn send(&self, chat_id: &str, asset: &Path, caption: &str) -> Result<()> {
        let to = recipient(chat_id)?;
        let file = InputFile::file(asset.to_path_buf());
        let ext = asset
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        // Telegram distinguishes media kinds; pick by extension like the
        // uploads do.
        match ext.as_str() {
            "gif" => {
                let mut req = self.bot.send_animation(to, file);
                if !caption.is_empty() {
                    req = req.caption(caption.to_string());
                }
                req.await?;
            }
            "mp4" | "mov" | "avi" | "mkv" | "webm" => {
                let mut req = self.bot.send_video(to, file);
                if !caption.is_empty() {
                    req = req.caption(caption.to_string());
                }
                req.await?;
            }
            _ => {
                let mut req = self.bot.send_photo(to, file);
                if !caption.is_empty() {
                    req = req.caption(caption.to_string());
                }
                req.await?;
            }
        }
        info!(chat_id, asset = %asset.display(), "delivered asset");
        Ok(())
    }

    async fn probe(&self, chat_id: &str) -> Result<()> {
        let to = recipient(chat_id)?;
        self.bot.get_chat(to).await?;
        Ok(())
    }
}

pub struct TelegramNotifier {
    bot: Bot,
    config: SharedConfig,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, config: SharedConfig) -> Self {
        Self { bot, config }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_admins(&self, text: &str) {
        let admins = self.config.load().telegram.admin_ids.clone();
        for admin in admins {
            if let Err(err) = self.bot.send_message(ChatId(admin), text).await {
                debug!(?err, admin, "failed to notify admin");
            }
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.bot.send_message(ChatId(chat_id), text).await {
            debug!(?err, chat_id, "failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_parsing() {
        assert!(matches!(
            recipient("-1001234567890").unwrap(),
            Recipient::Id(ChatId(-1001234567890))
        ));
        assert!(matches!(
            recipient("@mychannel").unwrap(),
            Recipient::ChannelUsername(_)
        ));
        assert!(recipient("not-a-chat").is_err());
    }
}
