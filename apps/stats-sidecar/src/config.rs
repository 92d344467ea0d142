use crate::error::StatsError;
use crate::stats::{RecordType, WindowSpec};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TIME_ZONE: &str = "Europe/Paris";

/// The setup file is only read when `STATS_SETUP_CONFIG_PATH` names one.
fn setup_config_path(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup("STATS_SETUP_CONFIG_PATH")
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Values from the setup file. Environment variables win over these.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    stats_input_topics: Option<Vec<String>>,
    #[serde(default)]
    stats_time_zone: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "stats-sidecar setup config not found; using env defaults"
        );
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "stats-sidecar failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "stats-sidecar failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Window definition per output granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSettings {
    pub day_of_week: WindowSpec,
    pub hour_of_day: WindowSpec,
    pub hour_of_week: WindowSpec,
}

impl WindowSettings {
    pub fn for_record_type(&self, record_type: RecordType) -> WindowSpec {
        match record_type {
            RecordType::DayOfWeek => self.day_of_week,
            RecordType::HourOfDay => self.hour_of_day,
            RecordType::HourOfWeek => self.hour_of_week,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StoreTarget {
    Postgres { database_url: String, pool_size: u32 },
    /// Keep results in memory only; nothing is persisted.
    DryRun,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub application_name: String,
    pub application_version: String,
    pub store: StoreTarget,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keepalive_secs: u64,
    pub input_topics: Vec<String>,
    pub time_zone: Tz,
    pub windows: WindowSettings,
    pub window_grace_secs: u64,
    pub workers_per_pipeline: usize,
    pub queue_capacity: usize,
    pub emit_interval_ms: u64,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    pub stats_log_interval_secs: u64,
    pub otlp_endpoint: Option<String>,
}

/// Collects every problem instead of stopping at the first one.
struct Problems(Vec<String>);

impl Problems {
    fn parse<T: FromStr>(
        &mut self,
        lookup: &dyn Fn(&str) -> Option<String>,
        key: &str,
        default: T,
    ) -> T
    where
        T::Err: std::fmt::Display,
    {
        match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(err) => {
                    self.0.push(format!("{key}={raw:?} is invalid: {err}"));
                    default
                }
            },
        }
    }

    fn window(
        &mut self,
        lookup: &dyn Fn(&str) -> Option<String>,
        prefix: &str,
        size_days: u64,
        advance_days: u64,
    ) -> Option<WindowSpec> {
        let size = self.parse(lookup, &format!("{prefix}_WINDOW_DAYS"), size_days);
        let advance = self.parse(lookup, &format!("{prefix}_ADVANCE_DAYS"), advance_days);
        match WindowSpec::days(size, advance) {
            Ok(spec) => Some(spec),
            Err(err) => {
                self.0.push(format!("{prefix} window: {err}"));
                None
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Keeps the literal placeholder out of ids when the binary runs without packaging.
fn unless_placeholder(value: Option<String>, placeholder: &str) -> Option<String> {
    value.filter(|v| v != placeholder)
}

impl Config {
    pub fn from_env() -> Result<Self, StatsError> {
        dotenv().ok();
        let lookup = |key: &str| std::env::var(key).ok();
        let overrides = setup_config_path(&lookup)
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();
        Self::from_lookup(&lookup, overrides)
    }

    fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: SetupConfigOverrides,
    ) -> Result<Self, StatsError> {
        let mut problems = Problems(Vec::new());

        let application_name = unless_placeholder(
            non_empty(lookup("STATS_APPLICATION_NAME")),
            "@application.name@",
        )
        .unwrap_or_else(|| "stats-sidecar".to_string());
        let application_version = unless_placeholder(
            non_empty(lookup("STATS_APPLICATION_VERSION")),
            "@application.version@",
        )
        .unwrap_or_else(|| "dev".to_string());

        let dry_run = non_empty(lookup("STATS_DRY_RUN"))
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let database_url = non_empty(lookup("STATS_DATABASE_URL"))
            .or_else(|| non_empty(lookup("DATABASE_URL")))
            .or_else(|| non_empty(overrides.database_url.clone()))
            .map(normalize_database_url);
        let pool_size = problems.parse(lookup, "STATS_DB_POOL_SIZE", 10u32);
        let store = match (database_url, dry_run) {
            (_, true) => Some(StoreTarget::DryRun),
            (Some(database_url), false) => Some(StoreTarget::Postgres {
                database_url,
                pool_size,
            }),
            (None, false) => {
                problems.0.push(
                    "STATS_DATABASE_URL or DATABASE_URL is required (or database_url in the setup config)"
                        .to_string(),
                );
                None
            }
        };

        let mqtt_host = non_empty(lookup("STATS_MQTT_HOST"))
            .or_else(|| non_empty(overrides.mqtt_host.clone()))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let default_port = overrides.mqtt_port.filter(|v| *v != 0).unwrap_or(1883);
        let mqtt_port = problems.parse(lookup, "STATS_MQTT_PORT", default_port);
        let mqtt_username = non_empty(lookup("STATS_MQTT_USERNAME"))
            .or_else(|| non_empty(overrides.mqtt_username.clone()));
        let mqtt_password = non_empty(lookup("STATS_MQTT_PASSWORD"))
            .or_else(|| non_empty(overrides.mqtt_password.clone()));
        let mqtt_keepalive_secs = problems.parse(lookup, "STATS_MQTT_KEEPALIVE_SECS", 30u64);

        let input_topics: Vec<String> = match non_empty(lookup("STATS_INPUT_TOPICS")) {
            Some(raw) => raw.split(',').filter_map(|t| non_empty(Some(t.to_string()))).collect(),
            None => overrides
                .stats_input_topics
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|t| non_empty(Some(t)))
                .collect(),
        };
        if input_topics.is_empty() {
            problems
                .0
                .push("STATS_INPUT_TOPICS is required (comma separated MQTT topics)".to_string());
        }

        let zone_name = non_empty(lookup("STATS_TIME_ZONE"))
            .or_else(|| non_empty(overrides.stats_time_zone.clone()))
            .unwrap_or_else(|| DEFAULT_TIME_ZONE.to_string());
        let time_zone = match zone_name.parse::<Tz>() {
            Ok(zone) => Some(zone),
            Err(err) => {
                problems.0.push(format!("STATS_TIME_ZONE={zone_name:?} is invalid: {err}"));
                None
            }
        };

        let day_of_week = problems.window(lookup, "STATS_DAY_OF_WEEK", 365, 30);
        let hour_of_day = problems.window(lookup, "STATS_HOUR_OF_DAY", 30, 1);
        let hour_of_week = problems.window(lookup, "STATS_HOUR_OF_WEEK", 365, 30);

        let window_grace_secs = problems.parse(lookup, "STATS_WINDOW_GRACE_SECS", 0u64);
        let workers_per_pipeline = problems.parse(lookup, "STATS_WORKERS_PER_PIPELINE", 1usize);
        if workers_per_pipeline == 0 {
            problems
                .0
                .push("STATS_WORKERS_PER_PIPELINE must be greater than 0".to_string());
        }
        let queue_capacity = problems.parse(lookup, "STATS_QUEUE_CAPACITY", 1024usize);
        if queue_capacity == 0 {
            problems
                .0
                .push("STATS_QUEUE_CAPACITY must be greater than 0".to_string());
        }
        let emit_interval_ms = problems.parse(lookup, "STATS_EMIT_INTERVAL_MS", 30_000u64);
        let store_retry_attempts = problems.parse(lookup, "STATS_STORE_RETRY_ATTEMPTS", 3u32);
        let store_retry_backoff_ms =
            problems.parse(lookup, "STATS_STORE_RETRY_BACKOFF_MS", 500u64);
        let stats_log_interval_secs =
            problems.parse(lookup, "STATS_LOG_INTERVAL_SECS", 60u64);
        let otlp_endpoint = non_empty(lookup("OTEL_EXPORTER_OTLP_ENDPOINT"));

        match (store, time_zone, day_of_week, hour_of_day, hour_of_week) {
            (Some(store), Some(time_zone), Some(day_of_week), Some(hour_of_day), Some(hour_of_week))
                if problems.0.is_empty() =>
            {
                Ok(Self {
                    application_name,
                    application_version,
                    store,
                    mqtt_host,
                    mqtt_port,
                    mqtt_username,
                    mqtt_password,
                    mqtt_keepalive_secs,
                    input_topics,
                    time_zone,
                    windows: WindowSettings {
                        day_of_week,
                        hour_of_day,
                        hour_of_week,
                    },
                    window_grace_secs,
                    workers_per_pipeline,
                    queue_capacity,
                    emit_interval_ms,
                    store_retry_attempts,
                    store_retry_backoff_ms,
                    stats_log_interval_secs,
                    otlp_endpoint,
                })
            }
            _ => Err(StatsError::Config(problems.0)),
        }
    }

    pub fn client_id(&self) -> String {
        format!("{}-{}", self.application_name, self.application_version)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs.max(5))
    }

    pub fn window_grace(&self) -> Duration {
        Duration::from_secs(self.window_grace_secs)
    }

    pub fn emit_interval(&self) -> Option<Duration> {
        (self.emit_interval_ms > 0).then(|| Duration::from_millis(self.emit_interval_ms))
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_secs(self.stats_log_interval_secs.max(1))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
