//! Ingestion pipeline orchestration: configuration, the fetch → normalize → store
//! run, and the scheduler that drives it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use gcf_adapters::{
    normalize, FetchContext, FetchOutcome, ProviderClient, SamGovClient, UsaSpendingClient,
    DEFAULT_PAGE_LIMIT, SAM_GOV_DEFAULT_URL, USASPENDING_DEFAULT_URL,
};
use gcf_core::{DateWindow, FetchFilters, Provider, RecordKind, RetentionMode};
use gcf_storage::{HttpClientConfig, HttpFetcher, RecordStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcf-sync";

const DEFAULT_SEED_PASSWORD: &str = "admin123";

#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Interval(Duration),
    Cron(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct GcfConfig {
    pub sam_api_key: Secret,
    pub db_file: PathBuf,
    pub port: u16,
    pub sam_url: String,
    pub usaspending_url: String,
    pub retention: RetentionMode,
    pub page_limit: usize,
    pub lookback_days: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub schedule: Schedule,
    pub run_on_start: bool,
    pub filters: FetchFilters,
    pub seed_username: String,
    pub seed_password: Secret,
}

impl GcfConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let sam_api_key = get("SAM_API_KEY").ok_or(ConfigError::Missing("SAM_API_KEY"))?;

        let schedule = match get("GCF_SYNC_CRON") {
            Some(expr) => Schedule::Cron(expr),
            None => {
                let hours: u64 =
                    parse_or("GCF_SYNC_INTERVAL_HOURS", get("GCF_SYNC_INTERVAL_HOURS"), 24)?;
                if hours == 0 {
                    return Err(ConfigError::Invalid {
                        key: "GCF_SYNC_INTERVAL_HOURS",
                        value: "0".into(),
                        reason: "interval must be at least one hour".into(),
                    });
                }
                Schedule::Interval(Duration::from_secs(hours * 3600))
            }
        };

        Ok(Self {
            sam_api_key: Secret::new(sam_api_key),
            db_file: get("DB_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./contract_data.db")),
            port: parse_or("PORT", get("PORT"), 5000)?,
            sam_url: get("SAM_URL").unwrap_or_else(|| SAM_GOV_DEFAULT_URL.to_string()),
            usaspending_url: get("USA_API_URL")
                .unwrap_or_else(|| USASPENDING_DEFAULT_URL.to_string()),
            retention: parse_or(
                "GCF_RETENTION",
                get("GCF_RETENTION"),
                RetentionMode::AppendOnly,
            )?,
            page_limit: parse_or("GCF_PAGE_LIMIT", get("GCF_PAGE_LIMIT"), DEFAULT_PAGE_LIMIT)?,
            lookback_days: parse_or("GCF_LOOKBACK_DAYS", get("GCF_LOOKBACK_DAYS"), 30)?,
            http_timeout_secs: parse_or(
                "GCF_HTTP_TIMEOUT_SECS",
                get("GCF_HTTP_TIMEOUT_SECS"),
                30,
            )?,
            user_agent: get("GCF_USER_AGENT").unwrap_or_else(|| "gcf-bot/0.1".to_string()),
            schedule,
            run_on_start: parse_or(
                "GCF_RUN_ON_START",
                get("GCF_RUN_ON_START").map(|v| v.to_ascii_lowercase()),
                true,
            )?,
            filters: FetchFilters {
                keyword: get("GCF_KEYWORD"),
                classification_code: get("GCF_NAICS"),
            },
            seed_username: get("GCF_SEED_USERNAME").unwrap_or_else(|| "admin".to_string()),
            seed_password: Secret::new(
                get("GCF_SEED_PASSWORD").unwrap_or_else(|| DEFAULT_SEED_PASSWORD.to_string()),
            ),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: raw,
        }),
    }
}

pub async fn open_store(config: &GcfConfig) -> Result<RecordStore> {
    let store = RecordStore::open(&config.db_file)
        .await
        .with_context(|| format!("opening database {}", config.db_file.display()))?;
    let seeded = store
        .ensure_seed_user(&config.seed_username, config.seed_password.expose())
        .await
        .context("seeding users table")?;
    if seeded && config.seed_password.expose() == DEFAULT_SEED_PASSWORD {
        warn!(
            username = %config.seed_username,
            "seeded the default credential; set GCF_SEED_PASSWORD"
        );
    }
    Ok(store)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithProviderErrors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRunReport {
    pub provider: Provider,
    pub kind: RecordKind,
    pub fetched: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub cleared: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: DateWindow,
    pub retention: RetentionMode,
    pub status: RunStatus,
    pub providers: Vec<ProviderRunReport>,
}

impl SyncRunSummary {
    pub fn inserted(&self) -> usize {
        self.providers.iter().map(|p| p.inserted).sum()
    }

    pub fn report_for(&self, provider: Provider) -> Option<&ProviderRunReport> {
        self.providers.iter().find(|p| p.provider == provider)
    }
}

pub struct SyncPipeline {
    store: RecordStore,
    http: HttpFetcher,
    providers: Vec<Box<dyn ProviderClient>>,
    retention: RetentionMode,
    lookback_days: u64,
    filters: FetchFilters,
}

impl SyncPipeline {
    pub fn new(config: &GcfConfig, store: RecordStore) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let providers: Vec<Box<dyn ProviderClient>> = vec![
            Box::new(SamGovClient::new(
                config.sam_url.clone(),
                config.sam_api_key.expose(),
                config.page_limit,
            )),
            Box::new(UsaSpendingClient::new(config.usaspending_url.clone(), config.page_limit)),
        ];
        Ok(Self::with_providers(store, http, providers, config.retention)
            .with_lookback_days(config.lookback_days)
            .with_filters(config.filters.clone()))
    }

    pub fn with_providers(
        store: RecordStore,
        http: HttpFetcher,
        providers: Vec<Box<dyn ProviderClient>>,
        retention: RetentionMode,
    ) -> Self {
        Self {
            store,
            http,
            providers,
            retention,
            lookback_days: 30,
            filters: FetchFilters::default(),
        }
    }

    pub fn with_lookback_days(mut self, days: u64) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_filters(mut self, filters: FetchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let today = Utc::now().date_naive();
        self.run_for_window(DateWindow::trailing(today, self.lookback_days)).await
    }

    pub async fn run_for_window(&self, window: DateWindow) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            start = %window.start,
            end = %window.end,
            retention = self.retention.as_str(),
            "sync run started"
        );

        let ctx = FetchContext {
            run_id,
            window,
            filters: self.filters.clone(),
        };
        let outcomes = join_all(self.providers.iter().map(|p| p.fetch(&self.http, &ctx))).await;

        let mut reports = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let report = self
                .store_outcome(outcome)
                .await
                .with_context(|| format!("storing records for run {run_id}"))?;
            reports.push(report);
        }

        let status = if reports.iter().any(|r| r.error.is_some()) {
            RunStatus::CompletedWithProviderErrors
        } else {
            RunStatus::Completed
        };
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window,
            retention: self.retention,
            status,
            providers: reports,
        };
        info!(%run_id, ?status, inserted = summary.inserted(), "sync run finished");
        Ok(summary)
    }

    async fn store_outcome(&self, outcome: FetchOutcome) -> Result<ProviderRunReport> {
        let provider = outcome.provider;
        let kind = provider.record_kind();
        let mut report = ProviderRunReport {
            provider,
            kind,
            fetched: outcome.records.len(),
            normalized: 0,
            rejected: 0,
            inserted: 0,
            duplicates: 0,
            cleared: 0,
            error: outcome.error.as_ref().map(ToString::to_string),
        };

        // A failed fetch leaves stored data untouched, even in full-refresh mode.
        if !outcome.is_success() {
            return Ok(report);
        }

        let mut records = Vec::with_capacity(outcome.records.len());
        for raw in &outcome.records {
            match normalize(kind, raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    report.rejected += 1;
                    warn!(%provider, error = %err, "skipping provider record");
                }
            }
        }
        report.normalized = records.len();

        let clear_first = self.retention == RetentionMode::FullRefresh;
        if records.is_empty() && !clear_first {
            return Ok(report);
        }

        let batch = self.store.insert_batch(kind, &records, clear_first).await?;
        report.inserted = batch.inserted;
        report.duplicates = batch.duplicates;
        report.cleared = batch.cleared;
        info!(
            %provider,
            inserted = batch.inserted,
            duplicates = batch.duplicates,
            cleared = batch.cleared,
            rejected = report.rejected,
            "provider batch stored"
        );
        Ok(report)
    }
}

#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self) -> Result<SyncRunSummary>;
}

#[async_trait]
impl PipelineRunner for SyncPipeline {
    async fn run(&self) -> Result<SyncRunSummary> {
        self.run_once().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(SyncRunSummary),
    Failed(String),
    Skipped,
}

struct TickGate {
    runner: Arc<dyn PipelineRunner>,
    state: watch::Sender<SchedulerState>,
}

/// Puts the gate back to Idle on every exit path, including panics in the runner.
struct RunningGuard<'a> {
    state: &'a watch::Sender<SchedulerState>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(SchedulerState::Idle);
    }
}

impl TickGate {
    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        let began = self.state.send_if_modified(|state| {
            if *state == SchedulerState::Idle {
                *state = SchedulerState::Running;
                true
            } else {
                false
            }
        });
        began.then_some(RunningGuard { state: &self.state })
    }

    async fn tick(&self, trigger: &'static str) -> TickOutcome {
        let Some(_running) = self.try_begin() else {
            warn!(trigger, "pipeline already running; tick skipped");
            return TickOutcome::Skipped;
        };

        match self.runner.run().await {
            Ok(summary) => TickOutcome::Completed(summary),
            Err(err) => {
                let message = format!("{err:#}");
                error!(trigger, error = %message, "sync run failed; waiting for next tick");
                TickOutcome::Failed(message)
            }
        }
    }

    async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SchedulerState::Idle).await;
    }
}

/// Owns the tick job and the optional startup run. At most one pipeline
/// execution is active at a time; overlapping ticks are skipped, not queued.
pub struct Scheduler {
    gate: Arc<TickGate>,
    schedule: Schedule,
    jobs: Option<JobScheduler>,
    startup_run: Option<JoinHandle<TickOutcome>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn PipelineRunner>, schedule: Schedule) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            gate: Arc::new(TickGate { runner, state }),
            schedule,
            jobs: None,
            startup_run: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.gate.state.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.jobs.is_some()
    }

    pub async fn trigger(&self) -> TickOutcome {
        self.gate.tick("manual").await
    }

    pub async fn start(&mut self, run_immediately: bool) -> Result<()> {
        if self.jobs.is_some() {
            bail!("scheduler already started");
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let gate = self.gate.clone();
        let job = match &self.schedule {
            Schedule::Interval(every) => Job::new_repeated_async(*every, move |_uuid, _l| {
                let gate = gate.clone();
                Box::pin(async move {
                    gate.tick("interval").await;
                })
            })
            .with_context(|| format!("creating interval job every {every:?}"))?,
            Schedule::Cron(expr) => Job::new_async(expr.as_str(), move |_uuid, _l| {
                let gate = gate.clone();
                Box::pin(async move {
                    gate.tick("cron").await;
                })
            })
            .with_context(|| format!("creating scheduler job for cron {expr}"))?,
        };
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        self.jobs = Some(sched);
        info!(schedule = ?self.schedule, run_immediately, "scheduler started");

        if run_immediately {
            let gate = self.gate.clone();
            self.startup_run = Some(tokio::spawn(async move { gate.tick("startup").await }));
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<Option<TickOutcome>> {
        if let Some(mut sched) = self.jobs.take() {
            sched.shutdown().await.context("shutting down scheduler")?;
        }
        let startup = match self.startup_run.take() {
            Some(handle) => Some(handle.await.context("joining startup run")?),
            None => None,
        };
        self.gate.wait_idle().await;
        info!("scheduler stopped");
        Ok(startup)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = GcfConfig::from_env()?;
    let store = open_store(&config).await?;
    let pipeline = SyncPipeline::new(&config, store)?;
    pipeline.run_once().await
}
