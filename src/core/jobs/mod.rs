mod registry;
pub mod types;

pub use registry::JobRegistry;
pub use types::{
    DEFAULT_MAX_STEPS, Job, JobId, JobOutcome, JobParams, JobPatch, JobResult, JobStatus,
    MAX_MAX_STEPS, MIN_MAX_STEPS, Step, clamp_max_steps,
};

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    if from == to {
        return !from.is_terminal();
    }
    match from {
        JobStatus::Pending => matches!(to, JobStatus::Running | JobStatus::Failed),
        JobStatus::Running => matches!(
            to,
            JobStatus::Completed
                | JobStatus::MaxTurnsReached
                | JobStatus::Blocked
                | JobStatus::Failed
        ),
        JobStatus::Completed
        | JobStatus::MaxTurnsReached
        | JobStatus::Blocked
        | JobStatus::Failed => false,
    }
}

#[cfg(test)]
mod tests;
