use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tg_postbot::aggregator::Aggregator;
use tg_postbot::config::{self, SharedConfig};
use tg_postbot::content::ContentStore;
use tg_postbot::handlers::{self, Services};
use tg_postbot::scheduler::Scheduler;
use tg_postbot::state::StateStore;
use tg_postbot::transport::{MediaSender, Notifier, TelegramNotifier, TelegramSender};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Print content statistics and exit
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = ContentStore::new(&cfg.app.content_dir);
    if args.status {
        let mut total = 0;
        for dest in cfg.enabled_destinations() {
            let counts = store.counts(dest, &cfg.settings.supported_formats);
            println!("{}: {} files", dest.id, counts.total);
            total += counts.total;
        }
        println!("total: {total} files");
        return Ok(());
    }

    let state_store = StateStore::new(&cfg.app.state_file);
    let quiet = Duration::from_secs(cfg.settings.album_quiet_seconds);
    let config = SharedConfig::new(cfg);

    let bot = Bot::new(config.load().telegram.bot_token.clone());
    let sender: Arc<dyn MediaSender> = Arc::new(TelegramSender::new(bot.clone()));
    let notifier: Arc<dyn Notifier> =
        Arc::new(TelegramNotifier::new(bot.clone(), config.clone()));

    let scheduler = Scheduler::new(
        config.clone(),
        store.clone(),
        state_store,
        sender.clone(),
        notifier.clone(),
    );
    let aggregator = Aggregator::new(store.clone(), config.clone(), notifier.clone(), quiet);

    notifier.notify_admins(&startup_greeting(&config, &store)).await;
    if let Err(err) = scheduler.start().await {
        error!(?err, "failed to start autoposting");
    }

    let services = Services {
        config,
        config_path: args.config,
        store,
        scheduler,
        aggregator,
        sender,
    };

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let services = services.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &services, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}

fn startup_greeting(config: &SharedConfig, store: &ContentStore) -> String {
    let cfg = config.load();
    let mut total = 0;
    let mut low = Vec::new();
    for dest in cfg.enabled_destinations() {
        let counts = store.counts(dest, &cfg.settings.supported_formats);
        if counts.total < cfg.settings.low_content_threshold {
            low.push(format!("  {}: {} files", dest.name, counts.total));
        }
        total += counts.total;
    }
    let mut lines = vec![
        "Auto-posting bot started".to_string(),
        format!("Content: {total} files"),
        format!("Channels: {}", cfg.enabled_destinations().count()),
        format!("Interval: {} min", cfg.schedule.post_interval_minutes),
    ];
    if !low.is_empty() {
        lines.push("Low content:".to_string());
        lines.extend(low);
    }
    lines.join("\n")
}
