//! Bounded polling of a single job until it reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use rivalry_core::{JobName, JobStatus, OrchestrationError, Progress};
use rivalry_runner::{translate, JobRunner, RunnerError};
use serde_json::Value as JsonValue;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PollOptions, MIN_POLL_INTERVAL};

/// Interval sequence `initial, initial*m, initial*m^2, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl BackoffSchedule {
    pub fn new(options: &PollOptions) -> Self {
        Self {
            next: options
                .initial_interval
                .min(options.max_interval)
                .max(MIN_POLL_INTERVAL),
            max: options.max_interval.max(MIN_POLL_INTERVAL),
            multiplier: options.backoff_multiplier.max(1.0),
        }
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        let scaled = (current.as_millis() as f64 * self.multiplier).round();
        let capped = scaled
            .min(self.max.as_millis() as f64)
            .max(MIN_POLL_INTERVAL.as_millis() as f64);
        self.next = Duration::from_millis(capped as u64);
        Some(current)
    }
}

/// Callbacks fired while polling. Every method defaults to doing nothing.
pub trait PollObserver: Send {
    fn on_progress(&mut self, _status: JobStatus, _progress: &Progress) {}

    fn on_complete(&mut self, _result: Option<&JsonValue>) {}

    fn on_error(&mut self, _reason: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl PollObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed {
        output: Option<JsonValue>,
        progress: Progress,
    },
    /// The caller cancelled; no callback fired.
    Cancelled,
}

impl PollOutcome {
    pub fn status(&self) -> Option<JobStatus> {
        match self {
            PollOutcome::Completed { .. } => Some(JobStatus::Completed),
            PollOutcome::Cancelled => None,
        }
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    runner: Arc<dyn JobRunner>,
}

impl StatusPoller {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner }
    }

    /// Polls `job_id` until it completes, fails, the deadline passes or `cancel` fires.
    ///
    /// Observations are strictly sequential. Cancellation is checked before every
    /// fetch and every sleep and also aborts an in-flight fetch.
    pub async fn poll(
        &self,
        job_id: &str,
        job_name: Option<JobName>,
        options: &PollOptions,
        observer: &mut dyn PollObserver,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, OrchestrationError> {
        let started = Instant::now();
        let deadline = started + options.max_duration;
        let mut intervals = BackoffSchedule::new(options);
        let timed_out = || OrchestrationError::JobPollingTimeout {
            job_id: job_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        loop {
            if cancel.is_cancelled() {
                info!(job_id, "polling cancelled");
                return Ok(PollOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(timed_out());
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(job_id, "polling cancelled during fetch");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = sleep_until(deadline) => return Err(timed_out()),
                fetched = self.runner.fetch_run(job_id) => fetched,
            };

            match fetched {
                Ok(run) => {
                    let translation = translate(&run, job_name);
                    debug!(
                        job_id,
                        status = %translation.status,
                        percentage = translation.progress.percentage,
                        "poll observation"
                    );
                    observer.on_progress(translation.status, &translation.progress);
                    match translation.status {
                        JobStatus::Completed => {
                            observer.on_complete(run.output.as_ref());
                            return Ok(PollOutcome::Completed {
                                output: run.output,
                                progress: translation.progress,
                            });
                        }
                        JobStatus::Failed => {
                            let reason = run.failure_reason();
                            observer.on_error(&reason);
                            return Err(OrchestrationError::JobFailed {
                                job_id: job_id.to_string(),
                                reason,
                            });
                        }
                        JobStatus::Queued | JobStatus::Running => {}
                    }
                }
                Err(RunnerError::NotFound { .. }) => {
                    return Err(OrchestrationError::JobNotFound {
                        job_id: job_id.to_string(),
                    });
                }
                Err(err) if err.is_transient() => {
                    debug!(job_id, error = %err, "transient status fetch failure; still waiting");
                }
                Err(err) => {
                    warn!(job_id, error = %err, "status fetch failed; treating job state as unknown");
                }
            }

            let interval = intervals.next().unwrap_or(options.max_interval);
            let wait = interval.min(deadline.saturating_duration_since(Instant::now()));
            if cancel.is_cancelled() {
                info!(job_id, "polling cancelled");
                return Ok(PollOutcome::Cancelled);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(job_id, "polling cancelled during backoff");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = sleep(wait) => {}
            }
        }
    }
}
