use anyhow::{anyhow, Context};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use spreadbot::config::Settings;
use spreadbot::engine::SpreadEngine;
use spreadbot::ports::notifier::{
    spawn_dispatcher, EmailConfig, EmailNotifier, EventPublisher, LogNotifier, NotificationSink,
};
use spreadbot::ports::replay_gateway::ReplayGateway;
use spreadbot::ports::secrets::PassthroughSecretStore;
use spreadbot::store::{BotStore, JsonFileStore, MemoryStore, StoreState};
use spreadbot::worker::{self, WorkerOptions};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

fn init_logging() {
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(3600);
    let offset = FixedOffset::east_opt(offset_seconds).unwrap_or_else(|| Utc.fix());
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let git_hash = option_env!("SPREADBOT_GIT_HASH").unwrap_or("unknown");
    log::info!("spreadbot git: {}", git_hash);
    let settings = Settings::from_env_or_yaml().context("invalid settings")?;

    let initial = StoreState::new(settings.bot.clone(), settings.initial_balance);
    let store: Arc<dyn BotStore> = match &settings.state_file {
        Some(path) => Arc::new(
            JsonFileStore::open(path, initial)
                .with_context(|| format!("failed to open state file {}", path))?,
        ),
        None => {
            log::warn!("STATE_FILE not set, state is kept in memory only");
            Arc::new(MemoryStore::with_state(initial))
        }
    };

    let replay_path = settings
        .replay_file
        .clone()
        .ok_or_else(|| anyhow!("REPLAY_FILE is required: no live venue connector is configured"))?;
    let replay = Arc::new(
        ReplayGateway::open(&replay_path)
            .map_err(|e| anyhow!("failed to load replay file {}: {}", replay_path, e))?
            .with_reject_probability(settings.replay_reject_probability),
    );
    log::info!("[REPLAY] loaded {} entries from {}", replay.len(), replay_path);

    let sink: Arc<dyn NotificationSink> = match EmailConfig::from_env() {
        Some(email) => Arc::new(EmailNotifier::new(&email, &PassthroughSecretStore)?),
        None => Arc::new(LogNotifier),
    };
    let (events, rx) = EventPublisher::channel();
    let dispatcher = spawn_dispatcher(rx, sink);

    let interval = if settings.replay_step_millis > 0 {
        Duration::from_millis(settings.replay_step_millis)
    } else {
        Duration::from_secs(settings.interval_secs.max(1))
    };
    let status_file = settings.status_file.as_ref().map(PathBuf::from);
    let settings = Arc::new(settings);
    let engine = Arc::new(SpreadEngine::new(settings, store, replay.clone(), events));

    let cursor = replay.clone();
    let options = WorkerOptions {
        interval,
        status_file,
        after_cycle: Some(Box::new(move || {
            let more = cursor.tick();
            if !more {
                log::info!("[REPLAY] end of data");
            }
            more
        })),
    };
    log::info!("Starting spread loop...");
    let handle = worker::spawn(engine.clone(), options);

    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested, waiting for the current cycle");
            trigger.fire();
        }
    });

    let heartbeat = handle.join().await;
    match engine.status().await {
        Ok(status) => log::info!(
            "final equity={} balance={} open={} trades={} cycles={}",
            status.equity,
            status.balance,
            status.open_count,
            status.total_trades,
            heartbeat.cycles_count
        ),
        Err(e) => log::warn!("failed to read final status: {}", e),
    }

    drop(engine);
    if tokio::time::timeout(Duration::from_secs(10), dispatcher)
        .await
        .is_err()
    {
        log::warn!("[NOTIFY] pending notifications dropped at shutdown");
    }
    Ok(())
}
