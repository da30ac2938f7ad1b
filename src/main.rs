mod config;
mod cursor;
mod listener;
mod normalize;
mod platform;
mod relay;
mod router;
mod scheduler;
#[cfg(test)]
mod testing;
mod transfer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::cursor::RelayState;
use crate::listener::EventListener;
use crate::platform::discord::{self, DiscordHandler, DiscordSink};
use crate::platform::slack::SlackApi;
use crate::relay::{RelayLoop, RelayServices};
use crate::router::MirrorRouter;
use crate::scheduler::RecurringTask;
use crate::transfer::{Transfer, TransferAdapter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mirrorbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; nothing touches the network until this succeeds
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Mirrors: {}", config.mirrors.len());
    info!("  Poll interval: {:?}", config.relay.poll_interval());
    info!("  Request timeout: {:?}", config.relay.request_timeout());

    let timeout = config.relay.request_timeout();
    let router = Arc::new(MirrorRouter::new(config.mirrors.clone()));
    let transfer: Arc<dyn Transfer> =
        Arc::new(TransferAdapter::new(config.transfer.staging_dir(), timeout)?);
    let slack = Arc::new(SlackApi::new(config.slack.bot_token.clone(), timeout)?);

    // Discord -> Slack: gateway events
    let listener = Arc::new(EventListener::new(
        router.clone(),
        slack.clone(),
        transfer.clone(),
        timeout,
    ));
    let mut client = serenity::Client::builder(&config.discord.bot_token, discord::intents())
        .event_handler(DiscordHandler::new(listener))
        .await
        .context("Failed to build Discord client")?;

    // Slack -> Discord: one polling loop per mirror, each with its own cursor
    let services = RelayServices {
        history: slack.clone(),
        users: slack.clone(),
        sink: Arc::new(DiscordSink::new(client.http.clone())),
        transfer,
    };
    let cancel = CancellationToken::new();
    let mut loops = Vec::new();
    for mirror in router.mirrors() {
        let state = RelayState::initialize(slack.as_ref(), &mirror.slack_channel).await;
        let relay = RelayLoop::new(
            mirror.clone(),
            router.clone(),
            services.clone(),
            state,
            &config.relay,
        );
        let task = RecurringTask::new(
            format!("relay {} -> {}", mirror.slack_channel, mirror.discord_channel),
            config.relay.poll_interval(),
            cancel.clone(),
        );
        loops.push(task.spawn(relay));
    }

    let shard_manager = client.shard_manager.clone();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    info!("Bridge is starting...");
    let result = client.start().await;

    cancel.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            error!("Relay task ended abnormally: {}", e);
        }
    }

    result.context("Discord client stopped with an error")?;
    info!("Bridge stopped");
    Ok(())
}
