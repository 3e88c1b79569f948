pub mod slurm;

#[cfg(test)]
pub mod fake;

use crate::{job::JobId, process::ProcessError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler command failed to run: {0}")]
    Process(#[from] ProcessError),
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("Failed to parse a job id from scheduler output `{0}`")]
    InvalidJobId(String),
}

/// Operations of the cluster scheduler a job lifecycle depends on
pub trait Scheduler: Send + Sync {
    /// submit a batch script, `held` jobs do not start before they are released
    fn submit(&self, script: &str, held: bool) -> Result<JobId, SchedulerError>;

    fn release(&self, job: JobId) -> Result<(), SchedulerError>;

    fn cancel(&self, job: JobId) -> Result<(), SchedulerError>;

    /// put a running job back into the queue, keeping its identity
    fn requeue(&self, job: JobId) -> Result<(), SchedulerError>;
}
