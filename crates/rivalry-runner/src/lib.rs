//! External job-runner contracts, HTTP client and in-process runner.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod translate;
mod trigger;

pub use translate::{translate, Translation};
pub use trigger::{JobPayload, JobTrigger, TriggeredJob};

pub const CRATE_NAME: &str = "rivalry-runner";

/// One step of a run as the runner reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStep {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

/// Run representation returned by `GET /jobs/{runId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawRun {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<JsonValue>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

impl RawRun {
    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Default::default()
        }
    }

    /// Human-readable failure reason from the `error` field, whatever shape it has.
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(JsonValue::String(message)) if !message.trim().is_empty() => message.clone(),
            Some(JsonValue::Object(map)) => map
                .get("message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| JsonValue::Object(map.clone()).to_string()),
            Some(other) if !other.is_null() => other.to_string(),
            _ => format!("job ended with status {}", self.status),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SubmitRequest<'a> {
    name: &'a str,
    data: &'a JsonValue,
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("run `{run_id}` not found")]
    NotFound { run_id: String },
    #[error("job runner unreachable: {0}")]
    Unreachable(String),
    #[error("job runner rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("job runner returned an unreadable response: {0}")]
    Malformed(String),
}

impl RunnerError {
    /// Whether a poller should keep waiting after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            RunnerError::Unreachable(_) => true,
            RunnerError::Rejected { status, .. } => {
                classify_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
                    == StatusDisposition::Transient
            }
            RunnerError::NotFound { .. } | RunnerError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDisposition {
    NotFound,
    Transient,
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusDisposition {
    if status == StatusCode::NOT_FOUND {
        StatusDisposition::NotFound
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StatusDisposition::Transient
    } else {
        StatusDisposition::Rejected
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> RunnerError {
    if err.is_decode() {
        RunnerError::Malformed(err.to_string())
    } else {
        RunnerError::Unreachable(err.to_string())
    }
}

/// How status lookups behave when the runner cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Local development: an unreachable runner reads as "still running".
    Local,
    /// Deployed: an unreachable runner is a hard error.
    Networked,
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "offline" | "dev" => Ok(ExecutionMode::Local),
            "networked" | "cloud" | "production" => Ok(ExecutionMode::Networked),
            other => anyhow::bail!("unknown runner mode `{other}` (expected local|networked)"),
        }
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submits `{name, data}`; returns every id the runner assigned.
    async fn submit(&self, name: &str, data: &JsonValue) -> Result<Vec<String>, RunnerError>;

    async fn fetch_run(&self, run_id: &str) -> Result<RawRun, RunnerError>;
}

#[derive(Debug, Clone)]
pub struct RunnerClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl RunnerClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Talks to the runner over HTTP. Nothing is retried here; callers own retry policy.
#[derive(Debug, Clone)]
pub struct HttpJobRunner {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpJobRunner {
    pub fn new(config: RunnerClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building runner http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_event(&self, url: &str, name: &str, data: &JsonValue) -> Result<Vec<String>, RunnerError> {
        let resp = self
            .authorized(self.client.post(url))
            .json(&SubmitRequest { name, data })
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RunnerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: SubmitResponse = resp.json().await.map_err(|err| classify_reqwest_error(&err))?;
        debug!(ids = parsed.ids.len(), "runner accepted submission");
        Ok(parsed.ids)
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn submit(&self, name: &str, data: &JsonValue) -> Result<Vec<String>, RunnerError> {
        let url = format!("{}/events", self.base_url);
        let span = info_span!("runner_submit", name, url = %url);
        self.post_event(&url, name, data).instrument(span).await
    }

    async fn fetch_run(&self, run_id: &str) -> Result<RawRun, RunnerError> {
        let url = format!("{}/jobs/{}", self.base_url, run_id);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = resp.status();
        if status.is_success() {
            return resp.json::<RawRun>().await.map_err(|err| classify_reqwest_error(&err));
        }
        match classify_status(status) {
            StatusDisposition::NotFound => Err(RunnerError::NotFound {
                run_id: run_id.to_string(),
            }),
            StatusDisposition::Transient | StatusDisposition::Rejected => Err(RunnerError::Rejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Submission captured by [`MemoryJobRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSubmission {
    pub name: String,
    pub data: JsonValue,
    pub ids: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryRunnerState {
    submissions: Vec<RecordedSubmission>,
    scripts: HashMap<String, VecDeque<Result<RawRun, RunnerError>>>,
    reject_submissions: Option<String>,
}

/// In-process runner: records submissions and replays scripted run observations.
///
/// Each `fetch_run` pops the next scripted observation; the last one repeats.
/// Submitted jobs without a script report `QUEUED`; unknown ids are not found.
#[derive(Debug, Clone)]
pub struct MemoryJobRunner {
    state: Arc<Mutex<MemoryRunnerState>>,
    ids_per_submission: usize,
}

impl Default for MemoryJobRunner {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            ids_per_submission: 1,
        }
    }
}

impl MemoryJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mimics runners that fan one submission out into several runs.
    pub fn with_ids_per_submission(mut self, count: usize) -> Self {
        self.ids_per_submission = count;
        self
    }

    pub async fn script(&self, run_id: &str, observations: Vec<Result<RawRun, RunnerError>>) {
        self.state
            .lock()
            .await
            .scripts
            .insert(run_id.to_string(), observations.into_iter().collect());
    }

    pub async fn reject_submissions(&self, reason: Option<String>) {
        self.state.lock().await.reject_submissions = reason;
    }

    pub async fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.lock().await.submissions.clone()
    }
}

#[async_trait]
impl JobRunner for MemoryJobRunner {
    async fn submit(&self, name: &str, data: &JsonValue) -> Result<Vec<String>, RunnerError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.reject_submissions {
            return Err(RunnerError::Unreachable(reason.clone()));
        }
        let ids = (0..self.ids_per_submission)
            .map(|_| format!("run_{}", Uuid::new_v4().simple()))
            .collect::<Vec<_>>();
        for id in &ids {
            state
                .scripts
                .entry(id.clone())
                .or_insert_with(|| VecDeque::from([Ok(RawRun::with_status("QUEUED"))]));
        }
        state.submissions.push(RecordedSubmission {
            name: name.to_string(),
            data: data.clone(),
            ids: ids.clone(),
        });
        Ok(ids)
    }

    async fn fetch_run(&self, run_id: &str) -> Result<RawRun, RunnerError> {
        let mut state = self.state.lock().await;
        let Some(script) = state.scripts.get_mut(run_id) else {
            return Err(RunnerError::NotFound {
                run_id: run_id.to_string(),
            });
        };
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| {
            Err(RunnerError::NotFound {
                run_id: run_id.to_string(),
            })
        })
    }
}
