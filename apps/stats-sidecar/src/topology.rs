
use crate::config::Config;
use crate::error::StatsError;
use crate::measurement::RawMeasurement;
use crate::pipeline::{
    spawn_worker, PipelineCommand, PipelineCounters, PipelineHalt, PipelineHandle,
    PipelineStats, WorkerOptions,
};
use crate::stats::{
    BucketStrategy, ClosedWindow, DayOfWeekBuckets, DayOfWeekRecords, HourOfDayBuckets,
    HourOfDayRecords, HourOfWeekBuckets, HourOfWeekRecords, RecordFactory, RecordType,
    WindowSpec, WindowedAggregator,
};
use crate::storage::{KeySchema, SchemaRegistry, SchemaRegistryBuilder, StatsStore, StatsWriter};
use anyhow::{Context, Result};
use chrono_tz::Tz;
use futures::future;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Everything the topology needs, validated up front by [`Config`].
#[derive(Clone, Debug)]
pub struct TopologySettings {
    pub time_zone: Tz,
    pub day_of_week: WindowSpec,
    pub hour_of_day: WindowSpec,
    pub hour_of_week: WindowSpec,
    pub grace: Duration,
    pub workers_per_pipeline: usize,
    pub queue_capacity: usize,
    pub worker: WorkerOptions,
}

impl TopologySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_zone: config.time_zone,
            day_of_week: config.windows.for_record_type(RecordType::DayOfWeek),
            hour_of_day: config.windows.for_record_type(RecordType::HourOfDay),
            hour_of_week: config.windows.for_record_type(RecordType::HourOfWeek),
            grace: config.window_grace(),
            workers_per_pipeline: config.workers_per_pipeline,
            queue_capacity: config.queue_capacity,
            worker: WorkerOptions {
                emit_interval: config.emit_interval(),
                retry_attempts: config.store_retry_attempts,
                retry_backoff: config.store_retry_backoff(),
            },
        }
    }

    pub fn grace_ms(&self) -> i64 {
        i64::try_from(self.grace.as_millis()).unwrap_or(i64::MAX)
    }
}

/// One granularity: sharded workers sharing a strategy, window spec and factory.
struct Stage {
    record_type: RecordType,
    window: WindowSpec,
    shards: Vec<PipelineHandle>,
    stats: Arc<PipelineStats>,
}

fn shard_index(sensor_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    sensor_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

impl Stage {
    fn shard_for(&self, sensor_id: &str) -> &PipelineHandle {
        &self.shards[shard_index(sensor_id, self.shards.len())]
    }
}

/// Fans the shared input stream out to every stage.
#[derive(Clone)]
pub struct Dispatcher {
    stages: Arc<Vec<Stage>>,
}

impl Dispatcher {
    /// Resolves once every stage has queued the measurement. Awaiting this is what
    /// back-pressures the input listener.
    pub async fn dispatch(&self, measurement: RawMeasurement) -> Result<()> {
        for stage in self.stages.iter() {
            stage
                .shard_for(&measurement.sensor_id)
                .enqueue(measurement.clone())
                .await
                .with_context(|| format!("{} pipeline is no longer running", stage.record_type))?;
        }
        Ok(())
    }

    /// Writes interim rows for every open window of every stage.
    pub async fn flush(&self) -> Result<()> {
        let flushes = self
            .stages
            .iter()
            .flat_map(|stage| stage.shards.iter())
            .map(|shard| shard.flush());
        future::try_join_all(flushes).await?;
        Ok(())
    }

    pub fn counters(&self) -> Vec<(RecordType, PipelineCounters)> {
        self.stages
            .iter()
            .map(|stage| (stage.record_type, stage.stats.counters()))
            .collect()
    }
}

pub struct StatsTopology {
    dispatcher: Option<Dispatcher>,
    registry: Arc<SchemaRegistry>,
    workers: Vec<JoinHandle<()>>,
    halt_rx: mpsc::UnboundedReceiver<PipelineHalt>,
}

struct StageBuilder<'a> {
    settings: &'a TopologySettings,
    writer: &'a StatsWriter,
    halt_tx: &'a mpsc::UnboundedSender<PipelineHalt>,
    workers: Vec<JoinHandle<()>>,
}

impl StageBuilder<'_> {
    fn spawn<S, F>(
        &mut self,
        strategy: S,
        factory: F,
        window: WindowSpec,
        restored: Vec<ClosedWindow>,
    ) -> Stage
    where
        S: BucketStrategy,
        F: RecordFactory + Clone,
    {
        let record_type = factory.record_type();
        let stats = Arc::new(PipelineStats::new());
        let grace_ms = self.settings.grace_ms();
        let shard_count = self.settings.workers_per_pipeline.max(1);
        let mut aggregators: Vec<WindowedAggregator<S>> = (0..shard_count)
            .map(|_| WindowedAggregator::new(strategy.clone(), window, grace_ms))
            .collect();

        // Seed each window on the shard its sensor hashes to, like live measurements.
        let offered = restored.len();
        let mut seeded = 0usize;
        for closed in restored {
            let shard = shard_index(strategy.extract_sensor_id(&closed.key), shard_count);
            if aggregators[shard].restore(closed) {
                seeded += 1;
            }
        }
        if offered > 0 {
            tracing::info!(
                %record_type,
                seeded,
                skipped = offered - seeded,
                "restored open windows from the store"
            );
        }

        let mut shards = Vec::with_capacity(shard_count);
        for (shard, aggregator) in aggregators.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel::<PipelineCommand>(self.settings.queue_capacity.max(1));
            self.workers.push(spawn_worker(
                shard,
                aggregator,
                factory.clone(),
                self.writer.clone(),
                rx,
                stats.clone(),
                self.settings.worker,
                self.halt_tx.clone(),
            ));
            shards.push(PipelineHandle::new(tx, stats.clone()));
        }
        tracing::info!(
            %record_type,
            size_ms = window.size_ms(),
            advance_ms = window.advance_ms(),
            tumbling = window.is_tumbling(),
            shards = shards.len(),
            "started stats pipeline"
        );
        Stage {
            record_type,
            window,
            shards,
            stats,
        }
    }
}

/// Loads the rows a previous run may have left open and turns them back into window
/// state. A window is open for at most its size plus the grace period past the newest
/// stored window end.
async fn restore_windows(
    store: &dyn StatsStore,
    registry: &SchemaRegistry,
    record_type: RecordType,
    window: WindowSpec,
    grace_ms: i64,
) -> Result<Vec<ClosedWindow>> {
    let schema = registry.resolve(record_type)?;
    let horizon_ms = window.size_ms().saturating_add(grace_ms);
    let rows = store
        .load_open(schema, horizon_ms)
        .await
        .with_context(|| format!("failed to load open {record_type} windows"))?;
    rows.iter()
        .map(|row| {
            let record = row.to_record()?;
            ClosedWindow::from_record(&record)
        })
        .collect::<Result<Vec<_>, StatsError>>()
        .with_context(|| format!("failed to restore {record_type} windows"))
}

/// Registers the declared key schema of every output type. Runs before any worker
/// exists, so every write finds its schema.
pub fn register_key_schemas() -> Result<SchemaRegistry, StatsError> {
    let mut builder = SchemaRegistryBuilder::new();
    for record_type in RecordType::ALL {
        builder.register(KeySchema::declared(record_type))?;
    }
    Ok(builder.build())
}

impl StatsTopology {
    pub async fn start(settings: TopologySettings, store: Arc<dyn StatsStore>) -> Result<Self> {
        let registry = Arc::new(register_key_schemas()?);
        store
            .prepare(&registry)
            .await
            .context("failed to prepare stats store")?;

        let grace_ms = settings.grace_ms();
        let restored_day_of_week = restore_windows(
            store.as_ref(),
            &registry,
            RecordType::DayOfWeek,
            settings.day_of_week,
            grace_ms,
        )
        .await?;
        let restored_hour_of_day = restore_windows(
            store.as_ref(),
            &registry,
            RecordType::HourOfDay,
            settings.hour_of_day,
            grace_ms,
        )
        .await?;
        let restored_hour_of_week = restore_windows(
            store.as_ref(),
            &registry,
            RecordType::HourOfWeek,
            settings.hour_of_week,
            grace_ms,
        )
        .await?;

        let writer = StatsWriter::new(registry.clone(), store);
        let (halt_tx, halt_rx) = mpsc::unbounded_channel();
        let mut builder = StageBuilder {
            settings: &settings,
            writer: &writer,
            halt_tx: &halt_tx,
            workers: Vec::new(),
        };
        let zone = settings.time_zone;
        let stages = vec![
            builder.spawn(
                DayOfWeekBuckets::new(zone),
                DayOfWeekRecords,
                settings.day_of_week,
                restored_day_of_week,
            ),
            builder.spawn(
                HourOfDayBuckets::new(zone),
                HourOfDayRecords,
                settings.hour_of_day,
                restored_hour_of_day,
            ),
            builder.spawn(
                HourOfWeekBuckets::new(zone),
                HourOfWeekRecords,
                settings.hour_of_week,
                restored_hour_of_week,
            ),
        ];
        let workers = builder.workers;

        Ok(Self {
            dispatcher: Some(Dispatcher {
                stages: Arc::new(stages),
            }),
            registry,
            workers,
            halt_rx,
        })
    }

    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn windows(&self) -> Vec<(RecordType, WindowSpec)> {
        self.dispatcher
            .as_ref()
            .map(|d| d.stages.iter().map(|s| (s.record_type, s.window)).collect())
            .unwrap_or_default()
    }

    /// Resolves when any worker halts on a non-recoverable error.
    pub async fn halted(&mut self) -> Option<PipelineHalt> {
        self.halt_rx.recv().await
    }

    /// Closes the input side and waits for every worker to write out its open windows.
    /// Dispatcher clones held elsewhere must be dropped first.
    pub async fn shutdown(mut self) -> Vec<(RecordType, PipelineCounters)> {
        let counters_source = self.dispatcher.take();
        let stats: Vec<(RecordType, Arc<PipelineStats>)> = counters_source
            .as_ref()
            .map(|d| {
                d.stages
                    .iter()
                    .map(|s| (s.record_type, s.stats.clone()))
                    .collect()
            })
            .unwrap_or_default();
        drop(counters_source);

        for result in future::join_all(self.workers.drain(..)).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "stats worker task failed");
            }
        }
        stats
            .into_iter()
            .map(|(record_type, stats)| (record_type, stats.counters()))
            .collect()
    }
}
