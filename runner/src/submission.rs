
use crate::{
    batch::BatchScriptBuilder,
    checkpoint::{CheckpointError, CheckpointStore},
    job::{JobHandle, JobId, JobPayload, JobRequest, Lineage},
    lifecycle::{self, Event, LifecycleLog},
    scheduler::{Scheduler, SchedulerError},
};
use globset::GlobMatcher;
use std::{fs, io, path::PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Failed to prepare directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("Failed to read the lifecycle log of job {original}: {source}")]
    Lifecycle { original: JobId, source: io::Error },
    #[error("Job {original} has no lifecycle records in {path}, its restart count is unknown")]
    UnknownLineage { original: JobId, path: PathBuf },
    #[error("Scheduler rejected the batch script: {0}")]
    SubmissionRejected(#[source] SchedulerError),
    #[error("Failed to write the payload of job {job_id}, the job was cancelled: {source}")]
    PayloadWriteFailed {
        job_id: JobId,
        source: CheckpointError,
    },
    #[error("Failed to release job {job_id}, the job was cancelled: {source}")]
    ReleaseFailed {
        job_id: JobId,
        source: SchedulerError,
    },
    #[error("Job {job_id} is left held, cancelling failed ({source}) after: {cause}")]
    HoldLeaked {
        job_id: JobId,
        source: SchedulerError,
        cause: Box<SubmissionError>,
    },
}

/// A job accepted in held state
///
/// Has to be consumed by `release` or `cancel`, a guard dropped while still armed cancels the
/// job so it never stays held on the cluster.
struct HeldJob<'a, S: Scheduler + ?Sized> {
    scheduler: &'a S,
    job_id: JobId,
    armed: bool,
}

impl<'a, S: Scheduler + ?Sized> HeldJob<'a, S> {
    fn new(scheduler: &'a S, job_id: JobId) -> Self {
        Self {
            scheduler,
            job_id,
            armed: true,
        }
    }

    fn release(mut self) -> Result<(), SubmissionError> {
        match self.scheduler.release(self.job_id) {
            Ok(()) => {
                self.armed = false;

                Ok(())
            }
            Err(source) => {
                let job_id = self.job_id;

                Err(self.cancel(SubmissionError::ReleaseFailed { job_id, source }))
            }
        }
    }

    /// cancel the job because of `cause`, returns the error to report
    fn cancel(mut self, cause: SubmissionError) -> SubmissionError {
        self.armed = false;

        match self.scheduler.cancel(self.job_id) {
            Ok(()) => {
                warn!(job = %self.job_id, "Cancelled held job: {cause}");

                cause
            }
            Err(source) => {
                error!(job = %self.job_id, error = ?source, "Failed to cancel held job: {source}");

                SubmissionError::HoldLeaked {
                    job_id: self.job_id,
                    source,
                    cause: Box::new(cause),
                }
            }
        }
    }
}

impl<S: Scheduler + ?Sized> Drop for HeldJob<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match self.scheduler.cancel(self.job_id) {
            Ok(()) => warn!(job = %self.job_id, "Cancelled abandoned held job"),
            Err(error) => {
                error!(job = %self.job_id, error = ?error, "Held job is left on the cluster: {error}")
            }
        }
    }
}

/// Submits job requests so that no job can start before its payload exists
pub struct Submitter<'a, S: Scheduler + ?Sized> {
    scheduler: &'a S,
    builder: &'a BatchScriptBuilder,
    images: GlobMatcher,
}

impl<'a, S: Scheduler + ?Sized> Submitter<'a, S> {
    pub fn new(scheduler: &'a S, builder: &'a BatchScriptBuilder, images: GlobMatcher) -> Self {
        Self {
            scheduler,
            builder,
            images,
        }
    }

    pub fn builder(&self) -> &BatchScriptBuilder {
        self.builder
    }

    /// identity the request is rendered with, resumed jobs continue their restart count
    ///
    /// A resume needs the lifecycle log of the original job, without it the restart count
    /// could go backwards.
    pub fn lineage(&self, request: &JobRequest) -> Result<Lineage, SubmissionError> {
        let Some(original) = request.resume_id() else {
            return Ok(Lineage::fresh());
        };

        let log = LifecycleLog::new(&request.logdir, original);
        let last = log
            .last_restart_count()
            .map_err(|source| SubmissionError::Lifecycle { original, source })?
            .ok_or_else(|| SubmissionError::UnknownLineage {
                original,
                path: log.path().to_path_buf(),
            })?;

        Ok(Lineage::resumed(original, last + 1))
    }

    /// submit held, write the payload, record SCHEDULED, release
    ///
    /// A returned handle always belongs to a released job, on every error after the scheduler
    /// accepted the script the job was cancelled or `HoldLeaked` is returned.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub fn submit(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        let lineage = self.lineage(request)?;

        for path in [&request.workdir, &request.logdir, &request.checkpointdir] {
            fs::create_dir_all(path).map_err(|source| SubmissionError::Directory {
                path: path.clone(),
                source,
            })?;
        }

        let script = self.builder.render(request, &lineage);

        let job_id = self
            .scheduler
            .submit(&script, true)
            .map_err(SubmissionError::SubmissionRejected)?;
        let schedule_time = lifecycle::now();
        let held = HeldJob::new(self.scheduler, job_id);

        let original = lineage.original_job_id.unwrap_or(job_id);
        let store = CheckpointStore::with_matcher(&request.checkpointdir, self.images.clone());
        let prepared = match &request.payload {
            JobPayload::Fresh(payload) => store.write_payload(original, payload).map(|_| ()),
            JobPayload::Resume(_) if store.exists(original) => Ok(()),
            JobPayload::Resume(_) => Err(CheckpointError::MissingDirectory(
                store.directory(original),
            )),
        };

        if let Err(source) = prepared {
            return Err(held.cancel(SubmissionError::PayloadWriteFailed { job_id, source }));
        }

        let handle = JobHandle {
            name: request.name.clone(),
            job_id,
            original_job_id: original,
            restart_count: lineage.restart_count,
            schedule_time,
        };

        // recorded while still held, the job cannot log anything before this line
        let log = LifecycleLog::new(&request.logdir, original);
        if let Err(error) = log.append(
            Event::Scheduled,
            &handle.name,
            handle.job_id,
            handle.restart_count,
            &handle.schedule_time,
        ) {
            warn!(error = ?error, path = ?log.path(), "Failed to write the SCHEDULED record: {error}");
        }

        held.release()?;

        info!(job = %job_id, original = %original, restart = handle.restart_count, "Scheduled job");

        Ok(handle)
    }
}
