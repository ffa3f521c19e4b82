use rivalry_core::{JobName, JobStatus, Progress};

use crate::RawRun;

/// Step count used when neither the runner nor the job kind says otherwise.
const FALLBACK_TOTAL_STEPS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub status: JobStatus,
    pub progress: Progress,
}

/// Maps a runner's view of a run onto the canonical status and a progress summary.
///
/// `job_name` supplies the default step total when the runner reports no steps.
/// A completed run without steps reports every step done.
pub fn translate(run: &RawRun, job_name: Option<JobName>) -> Translation {
    let status = JobStatus::from_external(&run.status);

    let progress = if run.steps.is_empty() {
        let total = job_name.map_or(FALLBACK_TOTAL_STEPS, JobName::default_total_steps);
        let completed = if status == JobStatus::Completed { total } else { 0 };
        Progress::from_counts(completed, total, None)
    } else {
        let completed = run
            .steps
            .iter()
            .filter(|step| JobStatus::from_external(&step.status) == JobStatus::Completed)
            .count() as u32;
        let current = run
            .steps
            .iter()
            .find(|step| step.status.trim().eq_ignore_ascii_case("RUNNING"))
            .map(|step| step.name.clone());
        Progress::from_counts(completed, run.steps.len() as u32, current)
    };

    Translation { status, progress }
}
