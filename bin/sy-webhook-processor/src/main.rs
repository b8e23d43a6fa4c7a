//! Switchyard Webhook Processor
//!
//! Polls the webhook retry queue and delivers pending notifications to
//! tenant endpoints, with exponential backoff and dead-lettering on
//! exhausted retry budgets.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SY_STORE_TYPE` | `postgres` | Store backend: `memory`, `postgres` |
//! | `SY_DATABASE_URL` | - | Postgres connection URL (required for `postgres`) |
//! | `SY_POLL_INTERVAL_MS` | `1000` | Scheduler poll interval in milliseconds |
//! | `SY_BATCH_SIZE` | `100` | Max queue items claimed per pass |
//! | `SY_WORKER_CONCURRENCY` | `16` | Max concurrent delivery workers |
//! | `SY_DELIVERY_TIMEOUT_MS` | `30000` | Default per-attempt delivery timeout |
//! | `SY_STUCK_CLAIM_SECS` | `300` | Age before a Delivering claim is recovered |
//! | `SY_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sy_common::TracingAuditSink;
use sy_store::{
    InMemoryRetryQueueStore, InMemoryTenantConfigStore, InMemoryWebhookLogStore,
    PostgresRetryQueueStore, PostgresTenantConfigStore, PostgresWebhookLogStore, RetryQueueStore,
    TenantConfigStore, WebhookLogStore,
};
use sy_webhook::{HttpTransport, RetryScheduler, RetrySchedulerConfig};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

struct Stores {
    configs: Arc<dyn TenantConfigStore>,
    queue: Arc<dyn RetryQueueStore>,
    logs: Arc<dyn WebhookLogStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Switchyard Webhook Processor");

    // Configuration
    let store_type = env_or("SY_STORE_TYPE", "postgres");
    let poll_interval_ms: u64 = env_or_parse("SY_POLL_INTERVAL_MS", 1000);
    let batch_size: u32 = env_or_parse("SY_BATCH_SIZE", 100);
    let worker_concurrency: usize = env_or_parse("SY_WORKER_CONCURRENCY", 16);
    let delivery_timeout_ms: u64 = env_or_parse("SY_DELIVERY_TIMEOUT_MS", 30_000);
    let stuck_claim_secs: u64 = env_or_parse("SY_STUCK_CLAIM_SECS", 300);
    let metrics_port: u16 = env_or_parse("SY_METRICS_PORT", 9090);

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let stores = create_stores(&store_type).await?;
    info!("Stores initialized ({})", store_type);

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(10))?);
    let scheduler = RetryScheduler::new(
        stores.queue,
        stores.logs,
        stores.configs,
        transport,
        Arc::new(TracingAuditSink),
        RetrySchedulerConfig {
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            worker_concurrency,
            default_timeout: Duration::from_millis(delivery_timeout_ms),
            stuck_claim_timeout: Duration::from_secs(stuck_claim_secs),
        },
    );

    // Start scheduler
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = scheduler.clone().run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Webhook scheduler shutting down");
                }
            }
        })
    };

    // Start metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("Switchyard Webhook Processor started");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = scheduler_handle.await;
        // Let in-flight deliveries run to completion before exiting.
        let _ = scheduler.drain().await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("Switchyard Webhook Processor shutdown complete");
    Ok(())
}

async fn create_stores(store_type: &str) -> Result<Stores> {
    match store_type {
        "memory" => {
            info!("Using in-memory stores (state is lost on restart)");
            Ok(Stores {
                configs: Arc::new(InMemoryTenantConfigStore::new()),
                queue: Arc::new(InMemoryRetryQueueStore::new()),
                logs: Arc::new(InMemoryWebhookLogStore::new()),
            })
        }
        "postgres" => {
            let url = env_required("SY_DATABASE_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            sy_store::postgres::init_schema(&pool).await?;
            info!("Using PostgreSQL stores");
            Ok(Stores {
                configs: Arc::new(PostgresTenantConfigStore::new(pool.clone())),
                queue: Arc::new(PostgresRetryQueueStore::new(pool.clone())),
                logs: Arc::new(PostgresWebhookLogStore::new(pool)),
            })
        }
        other => Err(anyhow::anyhow!(
            "Unknown store type: {}. Use memory or postgres",
            other
        )),
    }
}

async fn metrics_handler() -> String {
    "# HELP sy_webhook_processor_up Webhook processor is up\n# TYPE sy_webhook_processor_up gauge\nsy_webhook_processor_up 1\n".to_string()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
