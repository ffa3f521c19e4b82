use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rivalry_core::{ComparisonKind, JobName, JobStatus, Progress};
use rivalry_jobs::{build_services, maybe_build_scrape_scheduler, CacheOutcome, JobsConfig, PollObserver, PollOutcome, Services};
use rivalry_runner::JobPayload;
use rivalry_storage::{connect_pool, PgStore, PoolConfig};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rivalry-cli")]
#[command(about = "Rivalry job orchestration command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP surface (and the scrape scheduler when enabled).
    Serve,
    /// Apply database migrations.
    Migrate,
    TriggerScrape,
    /// Return a cached analysis or trigger a new one.
    Compare {
        kind: ComparisonKind,
        brands: Vec<String>,
        /// Poll a triggered job until it finishes.
        #[arg(long)]
        wait: bool,
    },
    /// Poll a job until it reaches a terminal state. Ctrl-C stops polling.
    Poll {
        job_id: String,
        #[arg(long)]
        kind: Option<JobName>,
    },
    Events {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run only the scrape scheduler until Ctrl-C.
    Schedule,
}

struct PrintObserver;

impl PollObserver for PrintObserver {
    fn on_progress(&mut self, status: JobStatus, progress: &Progress) {
        let step = progress.current_step_name.as_deref().unwrap_or("-");
        println!(
            "{:<9} {:>3}% ({}/{}) {step}",
            status.as_str(),
            progress.percentage, progress.completed_steps, progress.total_steps
        );
    }

    fn on_complete(&mut self, result: Option<&JsonValue>) {
        match result {
            Some(result) => println!("completed: {result}"),
            None => println!("completed"),
        }
    }

    fn on_error(&mut self, reason: &str) {
        eprintln!("failed: {reason}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = JobsConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let services = build_services(&config).await?;
            let scheduler =
                maybe_build_scrape_scheduler(&config, services.trigger.clone(), services.ledger.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.scrape_cron, "scrape scheduler started");
            }
            let served = rivalry_web::serve(services.clone(), config.web_port).await;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            services.close().await;
            served?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .clone()
                .context("DATABASE_URL must be set to run migrations")?;
            let pool = connect_pool(&PoolConfig::new(url)).await?;
            PgStore::new(pool.clone()).migrate().await.context("running migrations")?;
            pool.close().await;
            println!("migrations applied");
        }
        Commands::TriggerScrape => {
            let services = build_services(&config).await?;
            let job = services.trigger.trigger(JobPayload::Scrape).await?;
            println!("{}", job.job_id);
            services.ledger.record_best_effort(&job).await;
            services.close().await;
        }
        Commands::Compare { kind, brands, wait } => {
            let services = build_services(&config).await?;
            let outcome = services.cache.get_or_trigger_recorded(kind, &brands).await?;
            match outcome {
                CacheOutcome::Hit(analysis) => {
                    println!("{}", serde_json::to_string_pretty(&analysis)?);
                }
                CacheOutcome::Miss { job_id, job_name } => {
                    println!("triggered {job_name} job {job_id}");
                    if wait {
                        poll_until_done(&services, &job_id, Some(job_name)).await?;
                    }
                }
            }
            services.close().await;
        }
        Commands::Poll { job_id, kind } => {
            let services = build_services(&config).await?;
            let kind = match kind {
                Some(kind) => Some(kind),
                None => services.ledger.find(&job_id).await?.map(|r| r.job_name),
            };
            poll_until_done(&services, &job_id, kind).await?;
            services.close().await;
        }
        Commands::Events { limit } => {
            let services = build_services(&config).await?;
            for record in services.ledger.list(limit).await? {
                println!(
                    "{}  {:<15} {}  {}",
                    record.created_at.to_rfc3339(),
                    record.job_name.as_str(),
                    record.job_id,
                    serde_json::Value::Object(record.metadata)
                );
            }
            services.close().await;
        }
        Commands::Schedule => {
            let services = build_services(&config).await?;
            let config = JobsConfig {
                scheduler_enabled: true,
                ..config
            };
            let Some(mut sched) =
                maybe_build_scrape_scheduler(&config, services.trigger.clone(), services.ledger.clone()).await?
            else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scrape_cron, "scrape scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            services.close().await;
        }
    }

    Ok(())
}

async fn poll_until_done(services: &Services, job_id: &str, kind: Option<JobName>) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut observer = PrintObserver;
    let outcome = services
        .poller
        .poll(job_id, kind, &services.poll_options, &mut observer, &cancel)
        .await?;
    if outcome == PollOutcome::Cancelled {
        println!("stopped polling {job_id}; the job keeps running");
    }
    Ok(())
}
