use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use claude_bridge::bot::{Frontend, StdinBot, TelegramBot};
use claude_bridge::config::Config;
use claude_bridge::executor::ClaudeExecutor;
use claude_bridge::router::MessageRouter;
use claude_bridge::sandbox::{DockerManager, SandboxConfig, SandboxEngine};
use claude_bridge::store::{DbHandle, Store};
use claude_bridge::util::split_chunks;

/// Soft cap per outbound chunk, bytes.
const CHUNK_BYTES: usize = 2000;

/// Pause between chunks of a multi-part reply.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(500);

/// Interval of the session/rate-counter sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "claude-bridge")]
#[command(version, about = "Per-user sandboxed Claude Code bridge for chat frontends")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Use the line-oriented stdin frontend even when a Telegram token is
    /// configured
    #[arg(long)]
    stdin: bool,

    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration, with defaults for every field.
    let config = Arc::new(Config::load(&cli.config)?);
    init_tracing(&config, cli.verbose)?;

    info!("Starting Claude bridge...");
    if config.admin_wxid.is_empty() {
        warn!("admin_wxid is not set; admin commands will be unavailable");
    }

    // 2. Engine health.
    let sandbox_cfg = SandboxConfig::from_config(&config)?;
    let docker = Arc::new(DockerManager::new(sandbox_cfg).await?);

    if !docker.health_check().await? {
        anyhow::bail!(
            "Container engine is not available. Install and start Docker, then retry."
        );
    }

    // 3. Sandbox image.
    if !docker.image_exists().await {
        let build_dir = PathBuf::from("docker");
        if build_dir.exists() {
            info!("Sandbox image not found, building...");
            docker.build_image(&build_dir).await?;
        } else {
            anyhow::bail!(
                "Sandbox image \"{}\" not found and no docker/ build context is present",
                config.docker.image
            );
        }
    }

    // 4. Networks.
    docker.init_networks().await?;

    // 5. Metadata store.
    let store = Store::open(&Store::default_path()).context("Failed to open metadata store")?;
    let db = DbHandle::new(store);

    // Collect stopped containers left behind by previous runs.
    if let Err(e) = docker.cleanup().await {
        warn!("Startup container cleanup failed: {}", e);
    }

    let engine: Arc<dyn SandboxEngine> = docker.clone();
    let executor = Arc::new(ClaudeExecutor::new(
        engine,
        db.clone(),
        config.session.expire_minutes,
        config.claude.timeout,
    ));
    let router = Arc::new(MessageRouter::new(db.clone(), executor, config.clone()));

    // 6. Periodic sweep of expired sessions and stale rate counters.
    spawn_cleanup_task(db.clone(), config.session.expire_minutes as i64);

    // 7. Frontend and message pump.
    let bot: Arc<dyn Frontend> = if cli.stdin || config.telegram.bot_token.is_empty() {
        Arc::new(StdinBot::new())
    } else {
        Arc::new(TelegramBot::new(&config.telegram.bot_token))
    };
    bot.start().await?;

    info!("Bridge ready, waiting for messages");

    let pump = message_pump(bot, router);
    tokio::select! {
        _ = pump => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down...");
        }
    }

    // Containers carry restart=unless-stopped and deliberately stay up.
    info!("Bridge stopped");
    Ok(())
}

/// Receive inbound messages and handle each in its own task, so a slow
/// Claude run for one user never stalls the others. Per-user ordering is
/// preserved by the executor's in-flight guard.
async fn message_pump(bot: Arc<dyn Frontend>, router: Arc<MessageRouter>) {
    loop {
        match bot.recv().await {
            Ok(Some((contact, text))) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                let router = Arc::clone(&router);
                let bot = Arc::clone(&bot);
                tokio::spawn(async move {
                    let Some(reply) = router.handle_message(&contact, &text).await else {
                        return;
                    };
                    let chunks = split_chunks(&reply, CHUNK_BYTES);
                    let last = chunks.len().saturating_sub(1);
                    for (i, chunk) in chunks.iter().enumerate() {
                        if let Err(e) = bot.send(&contact.wxid, chunk).await {
                            error!("Failed to send reply to {}: {}", contact.wxid, e);
                        }
                        if i < last {
                            tokio::time::sleep(INTER_CHUNK_DELAY).await;
                        }
                    }
                });
            }
            Ok(None) => {
                info!("Frontend stream ended, shutting down");
                break;
            }
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        }
    }
}

fn spawn_cleanup_task(db: DbHandle, expire_minutes: i64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            interval.tick().await;
            match db
                .call(move |db| db.session_clean_expired(expire_minutes))
                .await
            {
                Ok(n) if n > 0 => info!("Cleaned {} expired sessions", n),
                Ok(_) => {}
                Err(e) => warn!("Session cleanup failed: {}", e),
            }
            match db.call(|db| db.rate_cleanup()).await {
                Ok(n) if n > 0 => info!("Cleaned {} stale rate counters", n),
                Ok(_) => {}
                Err(e) => warn!("Rate counter cleanup failed: {}", e),
            }
        }
    });
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let path = PathBuf::from(&config.logging.file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
    Ok(())
}
