// src/server/main.rs
// Entry point for the ruggine_notify presence and notification server
use ruggine_notify::server::config::ServerConfig;
use ruggine_notify::server::database::Database;
use ruggine_notify::server::push::LoggingTransport;
use ruggine_notify::server::redis_relay::RedisRelay;
use ruggine_notify::server::router::NotificationRouter;
use ruggine_notify::server::websocket;
use ruggine_notify::utils::performance;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use log::{info, error, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .format_timestamp_secs()
        .init();

    config.validate()?;

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("[DB] Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("[DB] Database migration failed: {}", e);
        e
    })?;

    let shutdown = CancellationToken::new();
    let (router, scheduler, due) =
        NotificationRouter::with_sqlite(config.clone(), database.clone(), Arc::new(LoggingTransport));

    // background work
    router.clone().spawn_event_fanout(shutdown.child_token());
    router.clone().run_scheduled_deliveries(due, shutdown.child_token());
    router.presence().clone().spawn_maintenance(
        config.presence_sweep_interval,
        config.presence_sync_interval,
        shutdown.child_token(),
    );
    router.limiter().clone().spawn_cleanup(config.rate_cleanup_interval, shutdown.child_token());

    match scheduler.restore().await {
        Ok(restored) => info!("[SCHED] {} scheduled notifications pending", restored),
        Err(e) => warn!("[SCHED] Could not restore scheduled notifications: {}", e),
    }

    if let Some(redis_url) = &config.redis_url {
        match RedisRelay::connect(redis_url).await {
            Ok(relay) => {
                let relay = Arc::new(relay);
                relay.clone().spawn_publisher(router.events(), shutdown.child_token());
                relay.spawn_subscriber(router.clone(), shutdown.child_token());
            }
            Err(e) => warn!("[REDIS] Relay disabled, could not connect to {}: {}", redis_url, e),
        }
    } else {
        info!("[REDIS] REDIS_URL not set, running as a single instance");
    }

    let stats_router = router.clone();
    let stats_path = config.stats_log_path.clone();
    let stats_every = config.stats_interval;
    let stats_cancel = shutdown.child_token();
    tokio::spawn(async move {
        info!("[STATS] Logging every {:?} to: {}", stats_every, stats_path);
        performance::start_stats_logger(stats_router, stats_path, stats_every, stats_cancel).await;
    });

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            ctrl_c_shutdown.cancel();
        }
    });

    websocket::serve(&config.listen_addr(), router.clone(), shutdown.clone()).await?;

    // final presence write-back before exit
    let saved = router.presence().sync_to_store().await;
    info!("[PRESENCE] Flushed {} presence records", saved);
    Ok(())
}
