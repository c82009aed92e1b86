use std::sync::Arc;

use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use enginepool::transport::serve;
use enginepool::{OsSupervisor, PoolService, Settings};

/// `RUST_LOG` wins; otherwise `ENGINEPOOL_LOG` sets this crate's level.
fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("ENGINEPOOL_LOG")
        .ok()
        .and_then(|raw| raw.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);
    EnvFilter::new(format!("enginepool={level},tower_http=warn"))
}

/// Logs go to stderr, as JSON when `LOG_FORMAT=json`.
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let (text_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    let _ = tracing_subscriber::registry()
        .with(log_filter())
        .with(text_layer)
        .with(json_layer)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("enginepool {}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env()?;
    let pool = &settings.pool;
    info!(
        capacity = pool.capacity,
        start_port = pool.start_port,
        idle_threshold_secs = pool.idle_threshold.as_secs(),
        settle_delay_ms = u64::try_from(pool.settle_delay.as_millis()).unwrap_or(u64::MAX),
        worker = %pool.worker_path.display(),
        "Loaded pool configuration"
    );

    let supervisor = Arc::new(OsSupervisor::new(pool.launcher.clone()));
    let service = Arc::new(PoolService::new(pool, supervisor)?);

    serve(settings.server, service).await
}
