
use crate::{
    checkpoint::{CheckpointError, CheckpointStore},
    job::RunIdentity,
    lifecycle::{self, Event, LifecycleLog},
    process::ProcessError,
    scheduler::{Scheduler, SchedulerError},
    tools::CheckpointTool,
};
use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// restart attempts while the checkpoint tool reports itself busy
pub const MAX_ATTEMPTS: u32 = 5;
/// pause between two busy restart attempts
pub const BACKOFF_SECS: u64 = 120;
/// exit code of runs that fail before the payload program ran
pub const FAILURE_EXIT_CODE: i32 = 1;

pub const DEFAULT_BUSY_EXIT_CODE: i32 = 1;
pub const DEFAULT_REQUEUE_EXIT_CODE: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Continuing,
    Done,
    Requeuing,
    Failed,
}

impl Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "STARTING",
            Self::Continuing => "CONTINUING",
            Self::Done => "DONE",
            Self::Requeuing => "REQUEUING",
            Self::Failed => "FAILED",
        })
    }
}

/// Exit codes with a reserved meaning, these depend on the scheduler and checkpoint tool in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes {
    /// the checkpoint tool could not restart yet, a resource is temporarily busy
    pub busy: i32,
    /// the program was checkpointed on the preemption signal and wants to be requeued
    pub requeue: i32,
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self {
            busy: DEFAULT_BUSY_EXIT_CODE,
            requeue: DEFAULT_REQUEUE_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff: Duration::from_secs(BACKOFF_SECS),
        }
    }
}

#[derive(Error, Debug)]
pub enum RunFailure {
    #[error("Checkpoint directory {0} missing or without a checkpoint to continue from")]
    MissingCheckpointDirectory(PathBuf),
    #[error("Checkpoint tool still busy after {attempts} attempts")]
    RestartBusy { attempts: u32, code: i32 },
    #[error("Job exited with unhandled code {0}")]
    UnhandledExitCode(i32),
    #[error("Checkpoint tool failed to run: {0}")]
    Tool(#[from] ProcessError),
    #[error("Checkpoint store failed: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Failed to requeue the job: {0}")]
    Requeue(#[from] SchedulerError),
}

impl RunFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RestartBusy { code, .. } => *code,
            Self::UnhandledExitCode(code) => *code,
            _ => FAILURE_EXIT_CODE,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Done,
    /// identity the next physical run continues with
    Requeued(RunIdentity),
    Failed(RunFailure),
}

/// Trace of a single physical run
#[derive(Debug)]
pub struct RunReport {
    pub transitions: Vec<RunState>,
    /// number of launch or restart invocations of the checkpoint tool
    pub attempts: u32,
    pub outcome: RunOutcome,
}

impl RunReport {
    /// exit code reported back to the scheduler
    pub fn exit_code(&self, codes: &ExitCodes) -> i32 {
        match &self.outcome {
            RunOutcome::Done => 0,
            RunOutcome::Requeued(_) => codes.requeue,
            RunOutcome::Failed(failure) => failure.exit_code(),
        }
    }

    pub fn state(&self) -> RunState {
        match self.outcome {
            RunOutcome::Done => RunState::Done,
            RunOutcome::Requeued(_) => RunState::Requeuing,
            RunOutcome::Failed(_) => RunState::Failed,
        }
    }
}

/// State machine executed inside the batch job
///
/// Every invocation starts from scratch: the checkpoint directory decides whether the program
/// starts fresh or continues, the exit code of the program decides whether the logical job is
/// done, failed or goes back into the queue.
pub struct RestartLoop<'a, T: CheckpointTool + ?Sized, S: Scheduler + ?Sized> {
    store: &'a CheckpointStore,
    tool: &'a T,
    scheduler: &'a S,
    binary: PathBuf,
    logdir: PathBuf,
    policy: RestartPolicy,
    codes: ExitCodes,
    sleep: Box<dyn Fn(Duration) + 'a>,
}

struct Run<'r> {
    identity: &'r RunIdentity,
    log: LifecycleLog,
    transitions: Vec<RunState>,
    attempts: u32,
}

impl Run<'_> {
    fn record(&mut self, event: Event) {
        let identity = self.identity;

        if let Err(error) = self.log.append(
            event,
            &identity.name,
            identity.job_id,
            identity.restart_count,
            &lifecycle::now(),
        ) {
            error!(error = ?error, path = ?self.log.path(), "Failed to write lifecycle record: {error}");
        }
    }

    fn enter(&mut self, state: RunState, event: Event) {
        self.transitions.push(state);
        self.record(event);
    }

    fn finish(mut self, outcome: RunOutcome) -> RunReport {
        match &outcome {
            RunOutcome::Done => self.enter(RunState::Done, Event::Done),
            RunOutcome::Requeued(_) => {}
            RunOutcome::Failed(failure) => {
                error!(failure = ?failure, "Run failed: {failure}");
                self.enter(RunState::Failed, Event::Failed(failure.exit_code()));
            }
        }

        RunReport {
            transitions: self.transitions,
            attempts: self.attempts,
            outcome,
        }
    }
}

impl<'a, T: CheckpointTool + ?Sized, S: Scheduler + ?Sized> RestartLoop<'a, T, S> {
    pub fn new(
        store: &'a CheckpointStore,
        tool: &'a T,
        scheduler: &'a S,
        binary: impl Into<PathBuf>,
        logdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            tool,
            scheduler,
            binary: binary.into(),
            logdir: logdir.into(),
            policy: RestartPolicy::default(),
            codes: ExitCodes::default(),
            sleep: Box::new(thread::sleep),
        }
    }

    pub fn policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn codes(mut self, codes: ExitCodes) -> Self {
        self.codes = codes;
        self
    }

    #[cfg(test)]
    pub fn sleeper(mut self, sleep: impl Fn(Duration) + 'a) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    #[instrument(skip(self, identity), fields(job = %identity.job_id, original = %identity.original_job_id, restart = identity.restart_count))]
    pub fn run(&self, identity: &RunIdentity) -> RunReport {
        let mut run = Run {
            identity,
            log: LifecycleLog::new(&self.logdir, identity.original_job_id),
            transitions: Vec::new(),
            attempts: 0,
        };

        let outcome = match self.execute(&mut run) {
            Ok(code) => self.interpret(&mut run, code),
            Err(failure) => RunOutcome::Failed(failure),
        };

        run.finish(outcome)
    }

    /// bring the program to an end, returns its exit code
    fn execute(&self, run: &mut Run) -> Result<i32, RunFailure> {
        let original = run.identity.original_job_id;
        let directory = self.store.directory(original);

        if !self.store.exists(original) {
            error!(path = ?directory, "Checkpoint directory missing");

            return Err(RunFailure::MissingCheckpointDirectory(directory));
        }

        if self.store.has_image(original) {
            run.enter(RunState::Continuing, Event::Continuing);
            let image = self.store.backup_image(original)?;

            return self.restart(run, &image);
        }

        // requeued and resumed runs only exist because a checkpoint was written
        if !run.identity.is_first_run() {
            error!(path = ?directory, "No checkpoint image to continue from");

            return Err(RunFailure::MissingCheckpointDirectory(directory));
        }

        run.enter(RunState::Starting, Event::Starting);
        run.attempts += 1;

        Ok(self
            .tool
            .launch(&self.binary, &self.store.settings_path(original))?)
    }

    fn restart(&self, run: &mut Run, image: &Path) -> Result<i32, RunFailure> {
        loop {
            run.attempts += 1;
            let code = self.tool.restart(image)?;

            if code != self.codes.busy {
                return Ok(code);
            }

            if run.attempts >= self.policy.max_attempts {
                return Err(RunFailure::RestartBusy {
                    attempts: run.attempts,
                    code,
                });
            }

            run.record(Event::Busy {
                attempt: run.attempts,
                max: self.policy.max_attempts,
            });
            info!(
                "Checkpoint tool busy ({}/{}), waiting for {:?}",
                run.attempts, self.policy.max_attempts, self.policy.backoff
            );
            (self.sleep)(self.policy.backoff);
        }
    }

    fn interpret(&self, run: &mut Run, code: i32) -> RunOutcome {
        let identity = run.identity;

        if code == 0 {
            if let Err(error) = self.store.delete(identity.original_job_id) {
                warn!(error = ?error, "Failed to remove checkpoint directory after success: {error}");
            }

            RunOutcome::Done
        } else if code == self.codes.requeue {
            run.enter(RunState::Requeuing, Event::Requeuing);

            match self.scheduler.requeue(identity.job_id) {
                Ok(()) => RunOutcome::Requeued(identity.requeued()),
                Err(error) => RunOutcome::Failed(error.into()),
            }
        } else {
            RunOutcome::Failed(RunFailure::UnhandledExitCode(code))
        }
    }
}
