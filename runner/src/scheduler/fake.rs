use super::{Scheduler, SchedulerError};
use crate::job::JobId;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit { script: String, held: bool },
    Release(JobId),
    Cancel(JobId),
    Requeue(JobId),
}

/// In-memory scheduler recording every call, failures are switched on per operation
#[derive(Debug, Default)]
pub struct FakeScheduler {
    next_id: Mutex<u64>,
    calls: Mutex<Vec<Call>>,
    reject_submit: bool,
    fail_release: bool,
    fail_cancel: bool,
    fail_requeue: bool,
}

impl FakeScheduler {
    pub fn starting_at(id: u64) -> Self {
        Self {
            next_id: Mutex::new(id),
            ..Self::default()
        }
    }

    pub fn rejecting_submit(mut self) -> Self {
        self.reject_submit = true;
        self
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub fn failing_requeue(mut self) -> Self {
        self.fail_requeue = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Cancel(job) => Some(job),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<JobId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Release(job) => Some(job),
                _ => None,
            })
            .collect()
    }

    fn failure(operation: &str) -> SchedulerError {
        SchedulerError::Command {
            command: operation.to_string(),
            status: 1,
            stderr: format!("{operation} refused"),
        }
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&self, script: &str, held: bool) -> Result<JobId, SchedulerError> {
        self.calls.lock().push(Call::Submit {
            script: script.to_string(),
            held,
        });

        if self.reject_submit {
            return Err(Self::failure("sbatch"));
        }

        let mut next_id = self.next_id.lock();
        let job = JobId(*next_id);
        *next_id += 1;

        Ok(job)
    }

    fn release(&self, job: JobId) -> Result<(), SchedulerError> {
        self.calls.lock().push(Call::Release(job));

        if self.fail_release {
            Err(Self::failure("release"))
        } else {
            Ok(())
        }
    }

    fn cancel(&self, job: JobId) -> Result<(), SchedulerError> {
        self.calls.lock().push(Call::Cancel(job));

        if self.fail_cancel {
            Err(Self::failure("cancel"))
        } else {
            Ok(())
        }
    }

    fn requeue(&self, job: JobId) -> Result<(), SchedulerError> {
        self.calls.lock().push(Call::Requeue(job));

        if self.fail_requeue {
            Err(Self::failure("requeue"))
        } else {
            Ok(())
        }
    }
}
