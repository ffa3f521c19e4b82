//! Job orchestration: ledger, status polling, result cache and scheduling.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use rivalry_runner::{HttpJobRunner, JobRunner, JobTrigger, MemoryJobRunner, RunnerClientConfig};
use rivalry_storage::{
    connect_pool, AnalysisStore, Datastore, MemoryStore, PgStore, PoolConfig, SourceDataStore,
};
use sqlx::PgPool;
use tracing::{info, warn};

mod cache;
mod config;
mod generation;
mod ledger;
mod poller;
mod scheduler;
mod status;

pub use cache::{CacheOutcome, CachePolicy, ResultCache};
pub use config::{load_known_brands, BrandEntry, BrandRegistry, JobsConfig, PollOptions};
pub use generation::{AnalysisGenerator, AnalysisRecorder, GenerationError};
pub use ledger::EventLedger;
pub use poller::{BackoffSchedule, NoopObserver, PollObserver, PollOutcome, StatusPoller};
pub use scheduler::maybe_build_scrape_scheduler;
pub use status::{JobStatusService, JobView};

pub const CRATE_NAME: &str = "rivalry-jobs";

/// Every orchestration service, wired against one datastore and one runner.
#[derive(Clone)]
pub struct Services {
    pub ledger: EventLedger,
    pub trigger: JobTrigger,
    pub cache: ResultCache,
    pub status: JobStatusService,
    pub poller: StatusPoller,
    pub poll_options: PollOptions,
    analyses: Arc<dyn AnalysisStore>,
    sources: Arc<dyn SourceDataStore>,
    source_lookback: Duration,
    pool: Option<PgPool>,
}

impl Services {
    pub fn new<S: Datastore + 'static>(
        config: &JobsConfig,
        store: Arc<S>,
        runner: Arc<dyn JobRunner>,
        known_brands: Vec<String>,
    ) -> Self {
        let ledger = EventLedger::new(store.clone());
        let trigger = JobTrigger::new(runner.clone(), config.triggered_by.clone());
        let policy = CachePolicy::from_days(
            config.analysis_freshness_days,
            config.source_lookback_days,
            known_brands,
        );
        let cache = ResultCache::new(store.clone(), store.clone(), trigger.clone(), ledger.clone(), policy);
        let status = JobStatusService::new(runner.clone(), ledger.clone(), config.runner_mode);

        Self {
            ledger,
            trigger,
            cache,
            status,
            poller: StatusPoller::new(runner),
            poll_options: config.poll.clone(),
            analyses: store.clone(),
            sources: store,
            source_lookback: Duration::days(config.source_lookback_days),
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Recorder that persists analyses produced by `generator` into this datastore.
    pub fn recorder(&self, generator: Arc<dyn AnalysisGenerator>) -> AnalysisRecorder {
        AnalysisRecorder::new(
            generator,
            self.analyses.clone(),
            self.sources.clone(),
            self.source_lookback,
        )
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

pub fn build_runner(config: &JobsConfig) -> Result<Arc<dyn JobRunner>> {
    let Some(base_url) = &config.runner_base_url else {
        warn!("RUNNER_BASE_URL not set; jobs go to the in-process memory runner");
        return Ok(Arc::new(MemoryJobRunner::new()));
    };
    let mut client = RunnerClientConfig::new(base_url.clone());
    client.api_key = config.runner_api_key.clone();
    client.timeout = StdDuration::from_secs(config.runner_http_timeout_secs.max(1));
    client.user_agent = Some(format!("rivalry/{}", env!("CARGO_PKG_VERSION")));
    let runner = HttpJobRunner::new(client).context("building runner client")?;
    info!(%base_url, mode = ?config.runner_mode, "using http job runner");
    Ok(Arc::new(runner))
}

/// Connects the datastore and runner named by `config`.
///
/// Without `DATABASE_URL` everything lives in memory for the life of the process.
pub async fn build_services(config: &JobsConfig) -> Result<Services> {
    let runner = build_runner(config)?;
    let known_brands = load_known_brands(&config.brands_file)?;
    if known_brands.is_empty() {
        info!(path = %config.brands_file.display(), "no brand registry; full comparisons cover every brand with data");
    }

    match &config.database_url {
        Some(url) => {
            let pool = connect_pool(&PoolConfig::new(url.clone())).await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            Ok(Services::new(config, store, runner, known_brands).with_pool(pool))
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            Ok(Services::new(config, Arc::new(MemoryStore::new()), runner, known_brands))
        }
    }
}
