use thiserror::Error;

/// Failure taxonomy surfaced to callers. `code()` is the stable wire identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestrationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{}", no_data_message(brands))]
    NoDataFound { brands: Vec<String> },
    #[error("no source data found for brand `{brand}`")]
    IncompleteData { brand: String },
    #[error("job submission failed: {0}")]
    JobSubmission(String),
    #[error("job `{job_id}` not found")]
    JobNotFound { job_id: String },
    #[error("job `{job_id}` failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("polling job `{job_id}` timed out after {elapsed_ms}ms; the job may still be running")]
    JobPollingTimeout { job_id: String, elapsed_ms: u64 },
    #[error("generation quota exhausted: {0}")]
    RateLimitExceeded(String),
    #[error("{0}")]
    Internal(String),
}

impl OrchestrationError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::InvalidRequest(_) => "INVALID_REQUEST",
            OrchestrationError::NoDataFound { .. } => "NO_DATA_FOUND",
            OrchestrationError::IncompleteData { .. } => "INCOMPLETE_DATA",
            OrchestrationError::JobSubmission(_) => "JOB_SUBMISSION_FAILED",
            OrchestrationError::JobNotFound { .. } => "JOB_NOT_FOUND",
            OrchestrationError::JobFailed { .. } => "JOB_FAILED",
            OrchestrationError::JobPollingTimeout { .. } => "JOB_POLLING_TIMEOUT",
            OrchestrationError::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            OrchestrationError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status the web layer answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            OrchestrationError::InvalidRequest(_) => 400,
            OrchestrationError::NoDataFound { .. }
            | OrchestrationError::IncompleteData { .. }
            | OrchestrationError::JobNotFound { .. } => 404,
            OrchestrationError::JobFailed { .. } => 502,
            OrchestrationError::RateLimitExceeded(_) => 503,
            OrchestrationError::JobPollingTimeout { .. } => 504,
            OrchestrationError::JobSubmission(_) | OrchestrationError::Internal(_) => 500,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        OrchestrationError::Internal(err.to_string())
    }
}

fn no_data_message(brands: &[String]) -> String {
    if brands.is_empty() {
        "no source data found for any brand".to_string()
    } else {
        format!("no source data found for {}", brands.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_follow_taxonomy() {
        let incomplete = OrchestrationError::IncompleteData { brand: "UnknownCo".into() };
        assert_eq!(incomplete.code(), "INCOMPLETE_DATA");
        assert_eq!(incomplete.http_status(), 404);
        assert!(incomplete.to_string().contains("UnknownCo"));

        assert_eq!(OrchestrationError::InvalidRequest("x".into()).http_status(), 400);
        assert_eq!(OrchestrationError::RateLimitExceeded("x".into()).http_status(), 503);
        assert_eq!(OrchestrationError::JobSubmission("x".into()).http_status(), 500);
    }
}
