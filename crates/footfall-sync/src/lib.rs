//! Sync run orchestration: run-state continuation, token reuse and idempotent upsert.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use footfall_adapters::{AdapterError, ApiCredentials, Authenticator, RestTrafficApi, TrafficSource};
use footfall_core::{
    format_day, yesterday_local, AccessToken, DateRange, NewRunState, RunState, TrafficRecord,
};
use footfall_storage::{HttpClientConfig, HttpFetcher, RunStateLog};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "footfall-sync";

/// Fixed DDL for the sink table. Applied if absent, never altered.
pub const TRAFFIC_TABLE_DDL: &str = include_str!("../../../migrations/0001_traffic_counts.sql");

const UPSERT_TRAFFIC_SQL: &str = r#"
INSERT INTO traffic_counts (site_code, location, is_internal, period_ending, ins, outs)
SELECT * FROM UNNEST($1::text[], $2::text[], $3::int2[], $4::timestamp[], $5::int8[], $6::int8[])
ON CONFLICT (site_code, location, period_ending)
DO UPDATE SET ins = EXCLUDED.ins, outs = EXCLUDED.outs
"#;

const UPSERT_CHUNK_ROWS: usize = 5_000;

pub const REQUIRED_VARS: [&str; 6] = [
    "FOOTFALL_DB_USER",
    "FOOTFALL_DB_PASSWORD",
    "FOOTFALL_DB_URL",
    "FOOTFALL_API_USERNAME",
    "FOOTFALL_API_PASSWORD",
    "FOOTFALL_API_BASE_URL",
];

const DEFAULT_STATE_PATH: &str = "./state/runs.jsonl";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub db_user: String,
    pub db_password: String,
    pub db_url: String,
    pub api_username: String,
    pub api_password: String,
    pub api_base_url: String,
    pub state_path: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reauth_delay: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_url", &self.db_url)
            .field("api_username", &self.api_username)
            .field("api_password", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("state_path", &self.state_path)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("reauth_delay", &self.reauth_delay)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate configuration from `lookup`.
    ///
    /// Every missing required variable is reported in one error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing = REQUIRED_VARS
            .iter()
            .filter(|key| get(key).is_none())
            .map(|key| key.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::Missing(vec![key.to_string()]));

        let config = Self {
            db_user: required("FOOTFALL_DB_USER")?,
            db_password: required("FOOTFALL_DB_PASSWORD")?,
            db_url: required("FOOTFALL_DB_URL")?,
            api_username: required("FOOTFALL_API_USERNAME")?,
            api_password: required("FOOTFALL_API_PASSWORD")?,
            api_base_url: required("FOOTFALL_API_BASE_URL")?,
            state_path: get("FOOTFALL_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
            http_timeout_secs: parse_or(get("FOOTFALL_HTTP_TIMEOUT_SECS"), "FOOTFALL_HTTP_TIMEOUT_SECS", 20)?,
            user_agent: get("FOOTFALL_USER_AGENT").unwrap_or_else(|| "footfall-sync/0.1".to_string()),
            reauth_delay: reauth_delay_from(get("FOOTFALL_REAUTH_DELAY_MS"))?,
            scheduler_enabled: match get("FOOTFALL_SCHEDULER_ENABLED") {
                None => false,
                Some(raw) => parse_flag(&raw).ok_or_else(|| ConfigError::Invalid {
                    var: "FOOTFALL_SCHEDULER_ENABLED".into(),
                    reason: format!("expected true/false, got {raw:?}"),
                })?,
            },
            sync_cron: get("FOOTFALL_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        };

        config.pg_connect_options()?;
        Ok(config)
    }

    pub fn api_credentials(&self) -> ApiCredentials {
        ApiCredentials {
            username: self.api_username.clone(),
            password: self.api_password.clone(),
        }
    }

    /// Connection options from the credential-free URL plus the configured user.
    pub fn pg_connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        let options = PgConnectOptions::from_str(&self.db_url).map_err(|err| ConfigError::Invalid {
            var: "FOOTFALL_DB_URL".into(),
            reason: err.to_string(),
        })?;
        Ok(options.username(&self.db_user).password(&self.db_password))
    }
}

/// Run-state location without requiring the rest of the configuration.
pub fn state_path_from_env() -> PathBuf {
    std::env::var("FOOTFALL_STATE_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH))
}

/// The upstream rate limit rejects a re-authentication sooner than this.
const MIN_REAUTH_DELAY_MS: u64 = 1_000;

fn reauth_delay_from(raw: Option<String>) -> Result<Duration, ConfigError> {
    let ms = parse_or(raw, "FOOTFALL_REAUTH_DELAY_MS", MIN_REAUTH_DELAY_MS)?;
    if ms < MIN_REAUTH_DELAY_MS {
        return Err(ConfigError::Invalid {
            var: "FOOTFALL_REAUTH_DELAY_MS".into(),
            reason: format!("must be at least {MIN_REAUTH_DELAY_MS} ms, got {ms}"),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn parse_or<T>(raw: Option<String>, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            reason: err.to_string(),
        }),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    Auth(#[source] AdapterError),
    #[error("traffic fetch failed: {0}")]
    Fetch(#[source] AdapterError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("run-state store error: {0:#}")]
    RunState(anyhow::Error),
    #[error("setup failed: {0:#}")]
    Setup(anyhow::Error),
}

/// Orchestrator states. `Failed` is reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Idle,
    Authenticating,
    Fetching,
    Reauthenticating,
    FetchingRetry,
    Upserting,
    Committed,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::Fetching => "fetching",
            Self::Reauthenticating => "reauthenticating",
            Self::FetchingRetry => "fetching_retry",
            Self::Upserting => "upserting",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a run: the phase that was active and the cause.
#[derive(Debug, Error)]
#[error("sync run failed during {phase}: {error}")]
pub struct RunFailure {
    pub phase: RunPhase,
    #[source]
    pub error: SyncError,
}

impl RunFailure {
    pub fn new(phase: RunPhase, error: SyncError) -> Self {
        Self { phase, error }
    }
}

impl From<ConfigError> for RunFailure {
    fn from(err: ConfigError) -> Self {
        Self::new(RunPhase::Idle, SyncError::Config(err))
    }
}

/// Explicit date overrides from the operator; each one always wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateOverrides {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Everything a run's decisions depend on, captured once at start.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub previous: Option<RunState>,
    pub now: DateTime<Utc>,
    pub yesterday: NaiveDate,
    pub overrides: DateOverrides,
}

impl RunContext {
    pub fn effective_range(&self) -> DateRange {
        effective_range(self.previous.as_ref(), self.yesterday, self.overrides)
    }
}

/// `from` continues from the previous run's `to`; both default to yesterday.
pub fn effective_range(
    previous: Option<&RunState>,
    yesterday: NaiveDate,
    overrides: DateOverrides,
) -> DateRange {
    let from = overrides
        .from
        .or_else(|| previous.map(|p| p.to_date))
        .unwrap_or(yesterday);
    let to = overrides.to.unwrap_or(yesterday);
    DateRange::new(from, to)
}

/// Previous run's token, if it is still usable at `now`.
pub fn reusable_token(previous: Option<&RunState>, now: DateTime<Utc>) -> Option<AccessToken> {
    previous.map(RunState::token).filter(|token| token.usable_at(now))
}

/// Decides between reusing the checkpointed credential and authenticating.
pub struct TokenManager<'a> {
    auth: &'a dyn Authenticator,
}

impl<'a> TokenManager<'a> {
    pub fn new(auth: &'a dyn Authenticator) -> Self {
        Self { auth }
    }

    pub async fn get_valid_token(
        &self,
        previous: Option<&RunState>,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, SyncError> {
        if let Some(token) = reusable_token(previous, now) {
            info!(expires_at = %token.expires_at, "reusing checkpointed access token");
            return Ok(token);
        }
        self.refresh().await
    }

    /// Unconditional re-authentication.
    pub async fn refresh(&self) -> Result<AccessToken, SyncError> {
        let token = self.auth.authenticate().await.map_err(SyncError::Auth)?;
        info!(expires_at = %token.expires_at, "obtained fresh access token");
        Ok(token)
    }
}

/// Destination for a coalesced batch. One call must commit or roll back as a unit.
#[async_trait]
pub trait TrafficSink: Send + Sync {
    async fn write_batch(&self, records: &[TrafficRecord]) -> Result<u64, sqlx::Error>;
}

/// Collapse records sharing a key; the later record wins, first-seen order is kept.
pub fn coalesce_batch(records: &[TrafficRecord]) -> Vec<TrafficRecord> {
    let mut out: Vec<TrafficRecord> = Vec::with_capacity(records.len());
    let mut index = HashMap::with_capacity(records.len());
    for record in records {
        match index.get(&record.key()) {
            Some(&slot) => out[slot] = record.clone(),
            None => {
                index.insert(record.key(), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

pub struct UpsertEngine<'a> {
    sink: &'a dyn TrafficSink,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(sink: &'a dyn TrafficSink) -> Self {
        Self { sink }
    }

    /// Insert new keys, overwrite `ins`/`outs` on existing ones. Empty input never touches the sink.
    pub async fn upsert(&self, records: &[TrafficRecord]) -> Result<u64, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let batch = coalesce_batch(records);
        let affected = self.sink.write_batch(&batch).await?;
        info!(records = records.len(), unique = batch.len(), affected, "traffic batch upserted");
        Ok(affected)
    }
}

/// Postgres sink using a lazily-connected single-connection pool.
#[derive(Debug, Clone)]
pub struct PgTrafficSink {
    pool: PgPool,
}

impl PgTrafficSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// No connection is made until the first statement runs.
    pub fn connect_lazy(config: &SyncConfig) -> Result<Self, ConfigError> {
        let options = config.pg_connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(TRAFFIC_TABLE_DDL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TrafficSink for PgTrafficSink {
    async fn write_batch(&self, records: &[TrafficRecord]) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(TRAFFIC_TABLE_DDL).execute(&mut *tx).await?;

        let mut affected = 0u64;
        for chunk in records.chunks(UPSERT_CHUNK_ROWS) {
            let site_codes = chunk.iter().map(|r| r.site_code.clone()).collect::<Vec<_>>();
            let locations = chunk.iter().map(|r| r.location.clone()).collect::<Vec<_>>();
            let internal = chunk.iter().map(|r| r.is_internal).collect::<Vec<i16>>();
            let period_ending = chunk.iter().map(|r| r.period_ending).collect::<Vec<NaiveDateTime>>();
            let ins = chunk.iter().map(|r| r.ins).collect::<Vec<i64>>();
            let outs = chunk.iter().map(|r| r.outs).collect::<Vec<i64>>();

            let result = sqlx::query(UPSERT_TRAFFIC_SQL)
                .bind(&site_codes)
                .bind(&locations)
                .bind(&internal)
                .bind(&period_ending)
                .bind(&ins)
                .bind(&outs)
                .execute(&mut *tx)
                .await?;
            affected += result.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }
}

/// In-memory state of the run in progress; committed once, on success.
#[derive(Debug, Clone)]
struct PendingRun {
    token: AccessToken,
    range: DateRange,
    reauthenticated: bool,
}

impl PendingRun {
    fn into_new_state(self, record_count: u64) -> NewRunState {
        NewRunState {
            access_token: self.token.value,
            access_token_expires_at: self.token.expires_at,
            from_date: self.range.from,
            to_date: self.range.to,
            record_count,
        }
    }
}

struct PhaseTrace {
    current: RunPhase,
    history: Vec<RunPhase>,
}

impl PhaseTrace {
    fn start() -> Self {
        Self {
            current: RunPhase::Idle,
            history: vec![RunPhase::Idle],
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        info!(from = %self.current, to = %phase, "run phase transition");
        self.current = phase;
        self.history.push(phase);
    }

    fn fail(&self, error: SyncError) -> RunFailure {
        RunFailure::new(self.current, error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub fetched_records: u64,
    pub rows_affected: u64,
    pub token_reused: bool,
    pub reauthenticated: bool,
    pub checkpoint_created_at: DateTime<Utc>,
    pub phases: Vec<RunPhase>,
}

pub struct SyncPipeline {
    store: RunStateLog,
    auth: Arc<dyn Authenticator>,
    source: Arc<dyn TrafficSource>,
    sink: Arc<dyn TrafficSink>,
    reauth_delay: Duration,
}

impl SyncPipeline {
    pub fn new(
        store: RunStateLog,
        auth: Arc<dyn Authenticator>,
        source: Arc<dyn TrafficSource>,
        sink: Arc<dyn TrafficSink>,
    ) -> Self {
        Self {
            store,
            auth,
            source,
            sink,
            reauth_delay: Duration::from_secs(1),
        }
    }

    /// Pause before re-authenticating after a 401; the upstream rate limit needs about a second.
    pub fn with_reauth_delay(mut self, delay: Duration) -> Self {
        self.reauth_delay = delay;
        self
    }

    pub async fn run_once(&self, overrides: DateOverrides) -> Result<SyncRunSummary, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async move {
            let result = self.execute(run_id, overrides).await;
            match &result {
                Ok(summary) => info!(
                    from = %format_day(summary.from_date),
                    to = %format_day(summary.to_date),
                    fetched = summary.fetched_records,
                    affected = summary.rows_affected,
                    "sync run committed"
                ),
                Err(failure) => error!(
                    phase = %failure.phase,
                    to = %RunPhase::Failed,
                    error = %failure.error,
                    "sync run failed; run-state left untouched"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: Uuid, overrides: DateOverrides) -> Result<SyncRunSummary, RunFailure> {
        let started_at = Utc::now();
        let mut trace = PhaseTrace::start();

        let previous = self
            .store
            .most_recent_run()
            .await
            .map_err(|err| trace.fail(SyncError::RunState(err)))?;
        let ctx = RunContext {
            previous,
            now: started_at,
            yesterday: yesterday_local(),
            overrides,
        };
        let range = ctx.effective_range();
        info!(%range, continued = ctx.previous.is_some() && overrides.from.is_none(), "effective date range");

        trace.enter(RunPhase::Authenticating);
        let tokens = TokenManager::new(self.auth.as_ref());
        let token_reused = reusable_token(ctx.previous.as_ref(), ctx.now).is_some();
        let token = tokens
            .get_valid_token(ctx.previous.as_ref(), ctx.now)
            .await
            .map_err(|err| trace.fail(err))?;
        let mut pending = PendingRun {
            token,
            range,
            reauthenticated: false,
        };

        trace.enter(RunPhase::Fetching);
        let first_attempt = self.source.fetch(&pending.token, range).await;
        let records = match first_attempt {
            Ok(records) => records,
            Err(err) if err.is_unauthorized() => {
                warn!(error = %err, delay_ms = self.reauth_delay.as_millis() as u64, "access token rejected; re-authenticating once");
                trace.enter(RunPhase::Reauthenticating);
                tokio::time::sleep(self.reauth_delay).await;
                pending.token = tokens.refresh().await.map_err(|err| trace.fail(err))?;
                pending.reauthenticated = true;

                trace.enter(RunPhase::FetchingRetry);
                self.source
                    .fetch(&pending.token, range)
                    .await
                    .map_err(|err| trace.fail(SyncError::Fetch(err)))?
            }
            Err(err) => return Err(trace.fail(SyncError::Fetch(err))),
        };
        let fetched_records = records.len() as u64;

        trace.enter(RunPhase::Upserting);
        let rows_affected = UpsertEngine::new(self.sink.as_ref())
            .upsert(&records)
            .await
            .map_err(|err| trace.fail(err))?;

        let reauthenticated = pending.reauthenticated;
        let checkpoint = self
            .store
            .append_run(pending.into_new_state(fetched_records))
            .await
            .map_err(|err| trace.fail(SyncError::RunState(err)))?;
        trace.enter(RunPhase::Committed);

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            from_date: range.from,
            to_date: range.to,
            fetched_records,
            rows_affected,
            token_reused: token_reused && !reauthenticated,
            reauthenticated,
            checkpoint_created_at: checkpoint.created_at,
            phases: trace.history,
        })
    }
}

/// One full run against the configured API, database and run-state log.
///
/// The store handle and the database pool live for this call only and are
/// released on every exit path.
pub async fn run_sync_once(
    config: &SyncConfig,
    overrides: DateOverrides,
) -> Result<SyncRunSummary, RunFailure> {
    let store = RunStateLog::open(&config.state_path)
        .await
        .map_err(|err| RunFailure::new(RunPhase::Idle, SyncError::RunState(err)))?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })
    .map_err(|err| RunFailure::new(RunPhase::Idle, SyncError::Setup(err)))?;
    let api = Arc::new(RestTrafficApi::new(
        http,
        config.api_base_url.clone(),
        config.api_credentials(),
    ));
    let sink = Arc::new(PgTrafficSink::connect_lazy(config)?);

    let pipeline = SyncPipeline::new(store, api.clone(), api, sink.clone())
        .with_reauth_delay(config.reauth_delay);
    let result = pipeline.run_once(overrides).await;
    sink.close().await;
    result
}

/// Apply the sink DDL without running a sync.
pub async fn migrate(config: &SyncConfig) -> Result<(), SyncError> {
    let sink = PgTrafficSink::connect_lazy(config)?;
    let result = sink.ensure_schema().await;
    sink.close().await;
    result.map_err(SyncError::from)
}

/// Scheduler for embedding hosts; `None` unless `FOOTFALL_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(config: Arc<SyncConfig>) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(config).await.map(Some)
}

/// Cron-driven runs on `config.sync_cron`.
///
/// A tick that fires while the previous run is still going is skipped.
pub async fn build_scheduler(config: Arc<SyncConfig>) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let in_flight = Arc::new(tokio::sync::Mutex::new(()));
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let config = Arc::clone(&config);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                warn!("previous scheduled sync still running; skipping tick");
                return;
            };
            match run_sync_once(&config, DateOverrides::default()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    fetched = summary.fetched_records,
                    "scheduled sync complete"
                ),
                Err(failure) => error!(error = %failure, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Markdown listing of checkpoints, newest first. Tokens are never printed.
pub fn history_markdown(runs: &[RunState]) -> String {
    let mut lines = vec!["# Footfall Sync History".to_string(), String::new()];
    if runs.is_empty() {
        lines.push("_no completed runs recorded_".to_string());
        lines.push(String::new());
        return lines.join("\n");
    }
    for run in runs {
        lines.push(format!("## Run at {}", run.created_at.to_rfc3339()));
        lines.push(format!(
            "- range: {} .. {}",
            format_day(run.from_date),
            format_day(run.to_date)
        ));
        lines.push(format!("- records: {}", run.record_count));
        lines.push(format!("- token expires: {}", run.access_token_expires_at.to_rfc3339()));
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Read-only: a missing log is reported as empty history and is not created.
pub async fn report_history(state_path: PathBuf, runs: usize) -> anyhow::Result<String> {
    let store = RunStateLog::existing(state_path);
    let recent = store.recent_runs(runs.max(1)).await?;
    Ok(history_markdown(&recent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, d).unwrap()
    }

    fn record(location: &str, hour: u32, ins: i64, outs: i64) -> TrafficRecord {
        TrafficRecord {
            site_code: "GLA01".into(),
            location: location.into(),
            is_internal: 0,
            period_ending: day(5).and_hms_opt(hour, 0, 0).unwrap(),
            ins,
            outs,
        }
    }

    fn prior_state(to: NaiveDate, expires_at: DateTime<Utc>) -> RunState {
        RunState::stamp(
            NewRunState {
                access_token: "previous-token".into(),
                access_token_expires_at: expires_at,
                from_date: to.pred_opt().unwrap(),
                to_date: to,
                record_count: 7,
            },
            Utc.with_ymd_and_hms(2020, 1, 5, 6, 0, 0).single().unwrap(),
        )
    }

    #[derive(Default)]
    struct FakeAuth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for FakeAuth {
        async fn authenticate(&self) -> Result<AccessToken, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::new(
                format!("fresh-token-{n}"),
                Utc::now() + chrono::Duration::hours(24),
            ))
        }
    }

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<TrafficRecord>, AdapterError>>>,
        seen: Mutex<Vec<(String, DateRange)>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<TrafficRecord>, AdapterError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, DateRange)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TrafficSource for ScriptedSource {
        async fn fetch(
            &self,
            token: &AccessToken,
            range: DateRange,
        ) -> Result<Vec<TrafficRecord>, AdapterError> {
            self.seen.lock().unwrap().push((token.value.clone(), range));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AdapterError::Malformed("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct CountingSink {
        batches: Mutex<Vec<Vec<TrafficRecord>>>,
        fail: bool,
    }

    #[async_trait]
    impl TrafficSink for CountingSink {
        async fn write_batch(&self, records: &[TrafficRecord]) -> Result<u64, sqlx::Error> {
            if self.fail {
                return Err(sqlx::Error::Protocol("connection reset".into()));
            }
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(records.len() as u64)
        }
    }

    fn unauthorized() -> AdapterError {
        AdapterError::Unauthorized("https://api.test/api/traffic".into())
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: RunStateLog,
        auth: Arc<FakeAuth>,
        source: Arc<ScriptedSource>,
        sink: Arc<CountingSink>,
    }

    impl Harness {
        async fn new(responses: Vec<Result<Vec<TrafficRecord>, AdapterError>>, sink: CountingSink) -> Self {
            let dir = tempdir().unwrap();
            let store = RunStateLog::open(dir.path().join("runs.jsonl")).await.unwrap();
            Self {
                _dir: dir,
                store,
                auth: Arc::new(FakeAuth::default()),
                source: Arc::new(ScriptedSource::new(responses)),
                sink: Arc::new(sink),
            }
        }

        fn pipeline(&self) -> SyncPipeline {
            SyncPipeline::new(
                self.store.clone(),
                self.auth.clone(),
                self.source.clone(),
                self.sink.clone(),
            )
            .with_reauth_delay(Duration::ZERO)
        }

        async fn seed(&self, to: NaiveDate, expires_in: chrono::Duration) {
            let state = prior_state(to, Utc::now() + expires_in);
            self.store
                .append_run(NewRunState {
                    access_token: state.access_token,
                    access_token_expires_at: state.access_token_expires_at,
                    from_date: state.from_date,
                    to_date: state.to_date,
                    record_count: state.record_count,
                })
                .await
                .unwrap();
        }

        async fn history(&self) -> Vec<RunState> {
            self.store.recent_runs(100).await.unwrap()
        }
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn full_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("FOOTFALL_DB_USER", "footfall"),
            ("FOOTFALL_DB_PASSWORD", "pw"),
            ("FOOTFALL_DB_URL", "postgres://localhost:5432/footfall"),
            ("FOOTFALL_API_USERNAME", "svc"),
            ("FOOTFALL_API_PASSWORD", "secret"),
            ("FOOTFALL_API_BASE_URL", "https://api.test"),
        ]
    }

    #[test]
    fn config_reports_every_missing_variable() {
        let err = SyncConfig::from_lookup(lookup_from(&[("FOOTFALL_DB_USER", "u"), ("FOOTFALL_API_PASSWORD", " ")]))
            .unwrap_err();
        match err {
            ConfigError::Missing(vars) => {
                assert_eq!(vars.len(), 5);
                assert!(vars.contains(&"FOOTFALL_API_PASSWORD".to_string()));
                assert!(!vars.contains(&"FOOTFALL_DB_USER".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = SyncConfig::from_lookup(lookup_from(&full_env())).unwrap();
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.reauth_delay, Duration::from_secs(1));
        assert_eq!(config.state_path, PathBuf::from("./state/runs.jsonl"));
        assert!(!config.scheduler_enabled);
        assert!(!format!("{config:?}").contains("secret"));

        let mut env = full_env();
        env.push(("FOOTFALL_REAUTH_DELAY_MS", "1500"));
        env.push(("FOOTFALL_SCHEDULER_ENABLED", "true"));
        let config = SyncConfig::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.reauth_delay, Duration::from_millis(1500));
        assert!(config.scheduler_enabled);
    }

    #[test]
    fn config_rejects_unparsable_values() {
        let mut env = full_env();
        env.push(("FOOTFALL_HTTP_TIMEOUT_SECS", "soon"));
        assert!(matches!(
            SyncConfig::from_lookup(lookup_from(&env)),
            Err(ConfigError::Invalid { ref var, .. }) if var == "FOOTFALL_HTTP_TIMEOUT_SECS"
        ));

        let mut env = full_env();
        env.retain(|(k, _)| *k != "FOOTFALL_DB_URL");
        env.push(("FOOTFALL_DB_URL", "::not-a-url::"));
        assert!(matches!(
            SyncConfig::from_lookup(lookup_from(&env)),
            Err(ConfigError::Invalid { ref var, .. }) if var == "FOOTFALL_DB_URL"
        ));
    }

    #[test]
    fn config_rejects_reauth_delay_under_one_second() {
        for raw in ["0", "999"] {
            let mut env = full_env();
            env.push(("FOOTFALL_REAUTH_DELAY_MS", raw));
            match SyncConfig::from_lookup(lookup_from(&env)) {
                Err(ConfigError::Invalid { var, reason }) => {
                    assert_eq!(var, "FOOTFALL_REAUTH_DELAY_MS");
                    assert!(reason.contains("at least 1000 ms"), "{reason}");
                }
                other => panic!("expected invalid delay for {raw}, got {other:?}"),
            }
        }

        let mut env = full_env();
        env.push(("FOOTFALL_REAUTH_DELAY_MS", "1000"));
        let config = SyncConfig::from_lookup(lookup_from(&env)).unwrap();
        assert_eq!(config.reauth_delay, Duration::from_secs(1));
    }

    #[test]
    fn date_range_continues_from_previous_to_date() {
        let previous = prior_state(day(5), Utc::now());
        let range = effective_range(Some(&previous), day(9), DateOverrides::default());
        assert_eq!(range, DateRange::new(day(5), day(9)));
    }

    #[test]
    fn date_range_defaults_and_overrides() {
        assert_eq!(
            effective_range(None, day(9), DateOverrides::default()),
            DateRange::new(day(9), day(9))
        );

        let previous = prior_state(day(5), Utc::now());
        let overrides = DateOverrides {
            from: Some(day(1)),
            to: Some(day(3)),
        };
        assert_eq!(
            effective_range(Some(&previous), day(9), overrides),
            DateRange::new(day(1), day(3))
        );

        // Out-of-order overrides pass through untouched.
        let reversed = DateOverrides {
            from: Some(day(8)),
            to: Some(day(2)),
        };
        assert_eq!(
            effective_range(None, day(9), reversed),
            DateRange::new(day(8), day(2))
        );
    }

    #[tokio::test]
    async fn token_reused_when_expiry_is_ten_minutes_away() {
        let auth = FakeAuth::default();
        let now = Utc::now();
        let previous = prior_state(day(5), now + chrono::Duration::minutes(10));
        let token = TokenManager::new(&auth)
            .get_valid_token(Some(&previous), now)
            .await
            .unwrap();
        assert_eq!(token.value, "previous-token");
        assert_eq!(token.expires_at, previous.access_token_expires_at);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_refreshed_when_expiry_is_two_minutes_away() {
        let auth = FakeAuth::default();
        let now = Utc::now();
        let previous = prior_state(day(5), now + chrono::Duration::minutes(2));
        let token = TokenManager::new(&auth)
            .get_valid_token(Some(&previous), now)
            .await
            .unwrap();
        assert_eq!(token.value, "fresh-token-1");
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);

        let token = TokenManager::new(&auth).get_valid_token(None, now).await.unwrap();
        assert_eq!(token.value, "fresh-token-2");
    }

    #[test]
    fn coalesce_keeps_last_write_per_key() {
        let batch = vec![
            record("Main Entrance", 9, 1, 1),
            record("Main Entrance", 10, 5, 5),
            record("Main Entrance", 9, 2, 3),
        ];
        let out = coalesce_batch(&batch);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].ins, out[0].outs), (2, 3));
        assert_eq!(out[0].period_ending, day(5).and_hms_opt(9, 0, 0).unwrap());
        assert_eq!((out[1].ins, out[1].outs), (5, 5));
    }

    #[tokio::test]
    async fn empty_batch_never_touches_the_sink() {
        let sink = CountingSink::default();
        let affected = UpsertEngine::new(&sink).upsert(&[]).await.unwrap();
        assert_eq!(affected, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_run_commits_checkpoint_with_token_used() {
        let records = vec![record("Main Entrance", 9, 4, 2), record("Side Door", 9, 1, 0)];
        let h = Harness::new(vec![Ok(records)], CountingSink::default()).await;
        h.seed(day(5), chrono::Duration::hours(2)).await;

        let overrides = DateOverrides {
            from: None,
            to: Some(day(6)),
        };
        let summary = h.pipeline().run_once(overrides).await.unwrap();

        assert_eq!(summary.from_date, day(5));
        assert_eq!(summary.to_date, day(6));
        assert_eq!(summary.fetched_records, 2);
        assert!(summary.token_reused);
        assert!(!summary.reauthenticated);
        assert_eq!(
            summary.phases,
            vec![
                RunPhase::Idle,
                RunPhase::Authenticating,
                RunPhase::Fetching,
                RunPhase::Upserting,
                RunPhase::Committed
            ]
        );
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.source.calls(), vec![("previous-token".to_string(), DateRange::new(day(5), day(6)))]);
        assert_eq!(h.sink.batches.lock().unwrap().len(), 1);

        let latest = h.store.most_recent_run().await.unwrap().unwrap();
        assert_eq!(latest.access_token, "previous-token");
        assert_eq!(latest.from_date, day(5));
        assert_eq!(latest.to_date, day(6));
        assert_eq!(latest.record_count, 2);
        assert_eq!(latest.created_at, summary.checkpoint_created_at);
    }

    #[tokio::test]
    async fn single_401_reauthenticates_and_retries_once() {
        let h = Harness::new(
            vec![Err(unauthorized()), Ok(vec![record("Main Entrance", 9, 4, 2)])],
            CountingSink::default(),
        )
        .await;
        h.seed(day(5), chrono::Duration::hours(2)).await;

        let summary = h
            .pipeline()
            .run_once(DateOverrides {
                from: None,
                to: Some(day(6)),
            })
            .await
            .unwrap();

        assert!(summary.reauthenticated);
        assert!(!summary.token_reused);
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);
        let calls = h.source.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "previous-token");
        assert_eq!(calls[1].0, "fresh-token-1");
        assert_eq!(calls[0].1, calls[1].1);

        let latest = h.store.most_recent_run().await.unwrap().unwrap();
        assert_eq!(latest.access_token, "fresh-token-1");
        assert_eq!(latest.record_count, 1);
    }

    #[tokio::test]
    async fn second_401_fails_without_checkpoint() {
        let h = Harness::new(vec![Err(unauthorized()), Err(unauthorized())], CountingSink::default()).await;
        h.seed(day(5), chrono::Duration::hours(2)).await;

        let failure = h.pipeline().run_once(DateOverrides::default()).await.unwrap_err();

        assert_eq!(failure.phase, RunPhase::FetchingRetry);
        assert!(matches!(failure.error, SyncError::Fetch(ref e) if e.is_unauthorized()));
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.calls().len(), 2);
        assert!(h.sink.batches.lock().unwrap().is_empty());

        let history = h.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].access_token, "previous-token");
    }

    #[tokio::test]
    async fn non_auth_fetch_error_is_not_retried() {
        let h = Harness::new(
            vec![Err(AdapterError::Malformed("truncated body".into()))],
            CountingSink::default(),
        )
        .await;

        let failure = h.pipeline().run_once(DateOverrides::default()).await.unwrap_err();

        assert_eq!(failure.phase, RunPhase::Fetching);
        assert!(matches!(failure.error, SyncError::Fetch(_)));
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.source.calls().len(), 1);
        assert!(h.history().await.is_empty());
    }

    #[tokio::test]
    async fn database_failure_leaves_previous_checkpoint_current() {
        let sink = CountingSink {
            fail: true,
            ..CountingSink::default()
        };
        let h = Harness::new(vec![Ok(vec![record("Main Entrance", 9, 1, 1)])], sink).await;
        h.seed(day(5), chrono::Duration::hours(2)).await;

        let failure = h.pipeline().run_once(DateOverrides::default()).await.unwrap_err();

        assert_eq!(failure.phase, RunPhase::Upserting);
        assert!(matches!(failure.error, SyncError::Database(_)));
        let latest = h.store.most_recent_run().await.unwrap().unwrap();
        assert_eq!(latest.to_date, day(5));
        assert_eq!(h.history().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_fetch_still_commits_zero_count_checkpoint() {
        let h = Harness::new(vec![Ok(Vec::new())], CountingSink::default()).await;

        let summary = h
            .pipeline()
            .run_once(DateOverrides {
                from: Some(day(3)),
                to: Some(day(4)),
            })
            .await
            .unwrap();

        assert_eq!(summary.fetched_records, 0);
        assert_eq!(summary.rows_affected, 0);
        assert!(h.sink.batches.lock().unwrap().is_empty());
        let latest = h.store.most_recent_run().await.unwrap().unwrap();
        assert_eq!(latest.record_count, 0);
        assert_eq!(latest.access_token, "fresh-token-1");
        assert_eq!((latest.from_date, latest.to_date), (day(3), day(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn reauthentication_waits_for_rate_limiter() {
        let h = Harness::new(vec![Err(unauthorized()), Ok(Vec::new())], CountingSink::default()).await;
        let pipeline = h.pipeline().with_reauth_delay(Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let summary = pipeline.run_once(DateOverrides::default()).await.unwrap();

        assert!(summary.reauthenticated);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn history_markdown_omits_tokens() {
        let runs = vec![prior_state(day(5), Utc::now())];
        let text = history_markdown(&runs);
        assert!(text.contains("2020-01-04 .. 2020-01-05"));
        assert!(text.contains("- records: 7"));
        assert!(!text.contains("previous-token"));
        assert!(history_markdown(&[]).contains("no completed runs"));
    }

    #[tokio::test]
    async fn report_history_reads_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = RunStateLog::open(&path).await.unwrap();
        for to in [4, 5, 6] {
            let state = prior_state(day(to), Utc::now());
            store
                .append_run(NewRunState {
                    access_token: state.access_token,
                    access_token_expires_at: state.access_token_expires_at,
                    from_date: state.from_date,
                    to_date: state.to_date,
                    record_count: u64::from(to),
                })
                .await
                .unwrap();
        }

        let text = report_history(path, 2).await.unwrap();
        assert!(text.contains("- records: 6"));
        assert!(text.contains("- records: 5"));
        assert!(!text.contains("- records: 4"));
    }

    #[tokio::test]
    async fn report_history_does_not_create_a_missing_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("runs.jsonl");

        let text = report_history(path.clone(), 5).await.unwrap();
        assert!(text.contains("no completed runs"));
        assert!(!path.exists());
        assert!(!dir.path().join("state").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_flag_only_gates_the_embedded_builder() {
        let config = Arc::new(SyncConfig::from_lookup(lookup_from(&full_env())).unwrap());
        assert!(!config.scheduler_enabled);

        assert!(maybe_build_scheduler(Arc::clone(&config)).await.unwrap().is_none());
        build_scheduler(config).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_rejects_a_bad_cron_expression() {
        let mut config = SyncConfig::from_lookup(lookup_from(&full_env())).unwrap();
        config.sync_cron = "every morning".into();
        let Err(err) = build_scheduler(Arc::new(config)).await else {
            panic!("expected build_scheduler to fail");
        };
        assert!(format!("{err:#}").contains("every morning"));
    }
}
