use anyhow::Result;
use stats_sidecar::config::{Config, StoreTarget};
use stats_sidecar::mqtt::{self, ListenerStats};
use stats_sidecar::storage::{build_pool, MemoryStatsStore, PgStatsStore, StatsStore};
use stats_sidecar::topology::{Dispatcher, StatsTopology, TopologySettings};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stats_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "stats-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn build_store(config: &Config) -> Result<Arc<dyn StatsStore>> {
    match &config.store {
        StoreTarget::Postgres {
            database_url,
            pool_size,
        } => {
            let pool = build_pool(database_url, *pool_size).await?;
            Ok(Arc::new(PgStatsStore::new(pool)))
        }
        StoreTarget::DryRun => {
            tracing::warn!("dry run: statistics are kept in memory and not persisted");
            Ok(Arc::new(MemoryStatsStore::new()))
        }
    }
}

fn log_counters(dispatcher: &Dispatcher, listener: &ListenerStats) {
    tracing::info!(
        publishes = listener.publishes.load(Ordering::Relaxed),
        measurements = listener.measurements.load(Ordering::Relaxed),
        malformed = listener.malformed.load(Ordering::Relaxed),
        undecodable = listener.undecodable.load(Ordering::Relaxed),
        "input counters"
    );
    for (record_type, counters) in dispatcher.counters() {
        tracing::info!(
            %record_type,
            queue_depth = counters.queue_depth,
            accepted = counters.accepted,
            malformed_dropped = counters.malformed_dropped,
            late_dropped = counters.late_dropped,
            windows_closed = counters.windows_closed,
            snapshot_rows = counters.snapshot_rows,
            rows_written = counters.rows_written,
            write_failures = counters.write_failures,
            "pipeline counters"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let store = build_store(&config).await?;
    let mut topology = StatsTopology::start(TopologySettings::from_config(&config), store).await?;
    tracing::info!(
        schemas = topology.registry().len(),
        windows = ?topology.windows(),
        time_zone = %config.time_zone,
        "stats topology started"
    );

    let Some(dispatcher) = topology.dispatcher() else {
        anyhow::bail!("stats topology started without a dispatcher");
    };
    let listener_stats = Arc::new(ListenerStats::default());

    let mut listener_handle = {
        let config = config.clone();
        let dispatcher = dispatcher.clone();
        let listener_stats = listener_stats.clone();
        tokio::spawn(async move { mqtt::run_listener(config, dispatcher, listener_stats).await })
    };

    let counters_handle = {
        let dispatcher = dispatcher.clone();
        let listener_stats = listener_stats.clone();
        let interval = config.stats_log_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_counters(&dispatcher, &listener_stats);
            }
        })
    };
    drop(dispatcher);

    let mut exit_error = None;
    tokio::select! {
        res = &mut listener_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("listener exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "listener failed"),
                Err(err) => tracing::error!(error = %err, "listener task failed"),
            }
        }
        halt = topology.halted() => {
            if let Some(halt) = halt {
                exit_error = Some(anyhow::anyhow!(
                    "{} pipeline shard {} halted: {}",
                    halt.record_type,
                    halt.shard,
                    halt.error
                ));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Dispatcher clones must be gone before the workers see their channels close.
    listener_handle.abort();
    let _ = listener_handle.await;
    counters_handle.abort();
    let _ = counters_handle.await;

    let shutdown = topology.shutdown();
    match tokio::time::timeout(Duration::from_secs(120), shutdown).await {
        Ok(counters) => {
            for (record_type, counters) in counters {
                tracing::info!(%record_type, ?counters, "pipeline drained");
            }
        }
        Err(_) => tracing::error!("timed out waiting for stats workers to drain"),
    }

    match exit_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
