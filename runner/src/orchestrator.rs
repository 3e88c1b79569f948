use crate::{
    batch::BatchScriptBuilder,
    job::{JobHandle, JobRequest},
    scheduler::Scheduler,
    submission::{SubmissionError, Submitter},
};
use globset::GlobMatcher;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, instrument};

/// Result of scheduling one request
#[derive(Debug)]
pub struct Outcome {
    pub name: String,
    pub result: Result<JobHandle, SubmissionError>,
}

impl Outcome {
    pub fn is_scheduled(&self) -> bool {
        self.result.is_ok()
    }
}

/// Schedules a batch of requests, one failure never stops the others
pub struct Orchestrator<'a, S: Scheduler + ?Sized> {
    submitter: Submitter<'a, S>,
    threads: usize,
}

impl<'a, S: Scheduler + ?Sized> Orchestrator<'a, S> {
    pub fn new(scheduler: &'a S, builder: &'a BatchScriptBuilder, images: GlobMatcher) -> Self {
        Self {
            submitter: Submitter::new(scheduler, builder, images),
            threads: 1,
        }
    }

    /// submit up to `threads` requests at once
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// render every script without contacting the scheduler
    pub fn dry_run(&self, requests: &[JobRequest]) -> Vec<(String, String)> {
        requests
            .iter()
            .filter_map(|request| match self.submitter.lineage(request) {
                Ok(lineage) => Some((
                    request.name.clone(),
                    self.submitter.builder().render(request, &lineage),
                )),
                Err(e) => {
                    error!(name = %request.name, "Failed to determine lineage: {e}");
                    None
                }
            })
            .collect()
    }

    fn schedule_one(&self, request: &JobRequest, processed: &AtomicU64, total: u64) -> Outcome {
        let result = self.submitter.submit(request);

        match &result {
            Ok(handle) => println!("Job ID: {}", handle.job_id),
            Err(e) => error!(name = %request.name, error = ?e, "Failed to schedule: {e}"),
        }

        info!(
            "Done with {}/{}",
            processed.fetch_add(1, Ordering::SeqCst) + 1,
            total
        );

        Outcome {
            name: request.name.clone(),
            result,
        }
    }

    /// outcomes are returned in the order of `requests`
    #[instrument(skip_all, fields(jobs = requests.len()))]
    pub fn schedule(&self, requests: &[JobRequest]) -> Vec<Outcome> {
        let total = requests.len() as u64;
        let processed = AtomicU64::new(0);

        if self.threads == 1 {
            return requests
                .iter()
                .map(|request| self.schedule_one(request, &processed, total))
                .collect();
        }

        debug!("Starting thread pool with {} threads", self.threads);

        match ThreadPoolBuilder::new().num_threads(self.threads).build() {
            Ok(pool) => pool.install(|| {
                requests
                    .par_iter()
                    .map(|request| self.schedule_one(request, &processed, total))
                    .collect()
            }),
            Err(e) => {
                error!("Failed to start thread pool, submitting sequentially: {e}");

                requests
                    .iter()
                    .map(|request| self.schedule_one(request, &processed, total))
                    .collect()
            }
        }
    }
}
