mod commands;
mod detect;
mod error;
mod fetch;
mod llm;
mod monitor;
mod notify;
mod prompts;
mod scheduler;
mod scoring;
mod state;
mod store;
mod targets;

use std::collections::HashSet;
use std::sync::Arc;

use poise::serenity_prelude as serenity;
use poise::{Framework, FrameworkOptions};
use tracing::{error, info, warn, Level};

use fetch::HttpFetcher;
use llm::LlmClient;
use monitor::{Collaborators, Monitor};
use notify::discord::DiscordSubscriber;
use notify::report::Narrator;
use notify::LogSubscriber;
use scoring::Analyzer;
use state::{AppState, MonitorConfig};
use store::MonitorStore;
use targets::TargetRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    // Load env
    let _ = dotenv::dotenv();
    let token = dotenv::var("DISCORD_TOKEN").map_err(|_| anyhow::anyhow!("DISCORD_TOKEN required"))?;
    let guild_id: Option<serenity::GuildId> = dotenv::var("DISCORD_GUILD_ID")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(serenity::GuildId::new);
    let config = MonitorConfig::from_env()?;

    // Init storage
    let registry = Arc::new(TargetRegistry::load(&config.config_path).await?);
    let store = Arc::new(MonitorStore::new(&config.store_dir()).await?);
    info!("Monitor store initialized at {:?}", config.store_dir());

    // Collaborators
    let fetcher = Arc::new(HttpFetcher::new(config.scheduler.fetch_timeout)?);
    let (analyzer, narrator): (Option<Arc<dyn Analyzer>>, Option<Arc<dyn Narrator>>) =
        if config.ai_enhance {
            let llm = Arc::new(LlmClient::from_env()?);
            info!(model = llm.model(), "LLM analysis enabled");
            let analyzer: Arc<dyn Analyzer> = llm.clone();
            let narrator: Arc<dyn Narrator> = llm;
            (Some(analyzer), Some(narrator))
        } else {
            info!("LLM analysis disabled, using rule-based scoring");
            (None, None)
        };

    let monitor = Arc::new(
        Monitor::new(
            registry,
            store,
            Collaborators {
                fetcher,
                analyzer,
                narrator,
            },
            config.monitor_options(),
        )
        .await?,
    );
    monitor.subscribe(Arc::new(LogSubscriber)).await;

    // Parse admin user IDs from env
    let admin_ids: HashSet<u64> = dotenv::var("ADMIN_USER_IDS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .collect();
    if !admin_ids.is_empty() {
        info!(count = admin_ids.len(), "Admin users configured");
    }

    let app_state = AppState {
        monitor: monitor.clone(),
        admin_ids,
    };

    let intents =
        serenity::GatewayIntents::GUILDS | serenity::GatewayIntents::GUILD_MESSAGES;

    let notify_channel = config.notify_channel_id;
    let autostart = config.autostart;
    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: vec![commands::watch()],
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot connected as: {} ({})", ready.user.name, ready.user.id);

                let commands = &framework.options().commands;
                info!("Registering {} top-level command(s):", commands.len());
                for cmd in commands {
                    info!("  /{} ({} subcommands)", cmd.name, cmd.subcommands.len());
                    for sub in &cmd.subcommands {
                        info!("    /{} {}", cmd.name, sub.name);
                    }
                }

                if let Some(gid) = guild_id {
                    info!("Registering to guild {} (instant)", gid);
                    poise::builtins::register_in_guild(
                        ctx,
                        &framework.options().commands,
                        gid,
                    )
                    .await?;
                } else {
                    info!("Registering globally (up to 1 hour delay)");
                    poise::builtins::register_globally(
                        ctx,
                        &framework.options().commands,
                    )
                    .await?;
                }

                match notify_channel {
                    Some(channel_id) => {
                        let subscriber = DiscordSubscriber::new(ctx.http.clone(), channel_id);
                        app_state.monitor.subscribe(Arc::new(subscriber)).await;
                    }
                    None => warn!("DISCORD_NOTIFY_CHANNEL_ID not set, findings are only logged"),
                }
                if autostart {
                    app_state.monitor.start_monitoring().await;
                }

                Ok(app_state)
            })
        })
        .build();

    info!("Starting Research Watch Discord bot...");

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    let shutdown_monitor = monitor.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        shutdown_monitor.stop_monitoring().await;
        shard_manager.shutdown_all().await;
    });

    if let Err(e) = client.start().await {
        error!("Client error: {}", e);
    }

    monitor.shutdown().await?;
    Ok(())
}
