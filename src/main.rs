use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use palisade::admin_api::{self, routes::AppState};
use palisade::config::settings::Settings;
use palisade::firewall::analyzer::Analyzer;
use palisade::firewall::collector::Collector;
use palisade::firewall::fingerprint::FingerprintGenerator;
use palisade::firewall::limiter::Limiter;
use palisade::firewall::pipeline::FirewallPipeline;
use palisade::firewall::scorer::Scorer;
use palisade::server::build_router;
use palisade::storage::memory::MemoryStore;
use palisade::storage::redis::RedisStore;
use palisade::storage::sqlite::AccessLogStore;
use palisade::storage::StateStore;

/// Parse the `--config` CLI flag. Defaults to `config/palisade.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from("config/palisade.toml");

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            if let Some(path) = args.get(i + 1) {
                config_path = path.clone();
            }
            i += 2;
        } else {
            i += 1;
        }
    }

    config_path
}

/// Initialise the `tracing` subscriber with both stdout and file output.
fn init_tracing(log_file: &str, level: &str) {
    if let Some(parent) = std::path::Path::new(log_file).parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .expect("Failed to open log file");

    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},palisade=debug", level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

/// Hourly maintenance: prune durable access-log rows past retention.
async fn prune_loop(access_log: Arc<AccessLogStore>, retention_days: u32) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
        match access_log.prune_older_than(cutoff) {
            Ok(0) => {}
            Ok(removed) => info!(removed = removed, "Pruned aged access-log rows"),
            Err(e) => warn!(error = %e, "Access-log prune failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let config_path = parse_config_path();
    let settings = if std::path::Path::new(&config_path).exists() {
        Settings::load(&config_path)?
    } else {
        Settings::default()
    };

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    init_tracing(&settings.logging.file, &settings.logging.level);

    info!("Starting palisade inline HTTP firewall");
    info!("Config loaded from {}", config_path);

    // ---------------------------------------------------------------
    // 3. Storage
    // ---------------------------------------------------------------
    let rate_window = Duration::from_secs(settings.limiter.rate_limit_window_secs);
    let store: Arc<dyn StateStore> = if settings.redis.enabled {
        Arc::new(
            RedisStore::connect(
                &settings.redis.url,
                Duration::from_millis(settings.redis.op_timeout_ms),
                rate_window,
            )
            .await
            .context("state store unreachable at startup")?,
        )
    } else {
        warn!("Redis disabled; using the in-process state store (single controller only)");
        let memory = Arc::new(MemoryStore::new(rate_window));
        let sweep = memory.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                sweep.cleanup();
            }
        });
        memory
    };

    let access_log = Arc::new(
        AccessLogStore::new(&settings.storage.sqlite_path)
            .context("failed to open the durable access log")?,
    );

    info!("Storage layer initialised");

    // ---------------------------------------------------------------
    // 4. Firewall components
    // ---------------------------------------------------------------
    let collector = Collector::new(&settings.collector, &settings.proxy)
        .context("invalid collector/proxy configuration")?;
    let fingerprinter = FingerprintGenerator::new(&settings.fingerprint.salt);
    let scorer = Arc::new(Scorer::new(settings.scoring.clone(), store.clone()));
    let analyzer = Analyzer::new(settings.analyzer.clone());
    let limiter = Arc::new(Limiter::new(settings.limiter.clone(), store.clone()));

    let pipeline = Arc::new(FirewallPipeline::new(
        collector,
        fingerprinter,
        scorer.clone(),
        analyzer,
        limiter.clone(),
        store.clone(),
        access_log.clone(),
    ));

    info!("Firewall pipeline initialised");

    // ---------------------------------------------------------------
    // 5. HTTP surface
    // ---------------------------------------------------------------
    let admin_state = AppState {
        limiter: limiter.clone(),
        scorer: scorer.clone(),
        store: store.clone(),
        access_log: access_log.clone(),
        start_time: Instant::now(),
    };
    let admin = admin_api::admin_router(admin_state, settings.admin_api.api_key.clone());

    let app = build_router(pipeline, admin);

    // ---------------------------------------------------------------
    // 6. Background maintenance
    // ---------------------------------------------------------------
    let prune_handle = tokio::spawn(prune_loop(
        access_log.clone(),
        settings.storage.retention_days,
    ));

    // ---------------------------------------------------------------
    // 7. Serve
    // ---------------------------------------------------------------
    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind))?;
    info!("Listening on {}", settings.server.bind);

    let server_handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<std::net::SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down palisade...");

    server_handle.abort();
    prune_handle.abort();

    info!("palisade shut down gracefully");
    Ok(())
}
