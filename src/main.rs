use actix_web::{web, App, HttpServer};
use std::io;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;

use clash_sync::clock::SystemClock;
use clash_sync::config::Config;
use clash_sync::http::{configure, AppState};
use clash_sync::middleware::cors_middleware;
use clash_sync::models::FeeSchedule;
use clash_sync::service::{
    EventBridge, JsonRpcLedger, LeaderboardService, Ledger, LedgerEventFeed, Poller, Reconciler, RequestQueue,
    ResultCache, Retrier, RetryPolicy, TtlPolicy,
};
use clash_sync::store::create_store;
use clash_sync::telemetry::{default_filter, init_telemetry};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize telemetry
    init_telemetry(&default_filter(&config.server.rust_log));

    // Durable cache tier
    let store = create_store(&config.redis).await?;

    // Engine
    let clock = Arc::new(SystemClock);
    let ledger: Arc<dyn Ledger> = Arc::new(JsonRpcLedger::new(&config.ledger)?);
    let cache = Arc::new(ResultCache::new(
        store.clone(),
        clock.clone(),
        TtlPolicy::from(&config.cache),
    ));
    let queue = Arc::new(RequestQueue::new(&config.queue));
    let retrier = Retrier::new(RetryPolicy::from_config(&config.retry));
    let reconciler = Arc::new(Reconciler::new(
        ledger.clone(),
        cache,
        queue,
        retrier.clone(),
        FeeSchedule::default(),
        clock,
        config.reconciler.match_duration(),
    ));
    reconciler.restore_completed().await;
    let leaderboard = Arc::new(LeaderboardService::new(reconciler.clone()));

    // Background triggers: interval polling plus the ledger event feed
    let poll_interval = config.reconciler.poll_interval();
    let poller = Poller::new(reconciler.clone()).spawn(poll_interval);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let bridge = tokio::spawn(EventBridge::new(reconciler.clone()).run(event_rx));
    let feed = LedgerEventFeed::new(ledger, retrier, config.reconciler.events_from_block)
        .spawn(event_tx, poll_interval);

    tracing::info!(
        "Starting clash-sync on {}:{}",
        config.server.host,
        config.server.port
    );

    let state = web::Data::new(AppState {
        reconciler,
        leaderboard,
        store,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(cors_middleware())
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .bind((config.server.host.clone(), config.server.port))?
    .run();

    // Graceful shutdown
    let server_handle = server.handle();
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received, stopping server...");
        server_handle.stop(true).await;
    });

    let served: io::Result<()> = server.await;
    poller.abort();
    feed.abort();
    bridge.abort();
    served?;
    Ok(())
}
