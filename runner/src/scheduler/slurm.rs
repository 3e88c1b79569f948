use super::{Scheduler, SchedulerError};
use crate::{
    job::{JobId, ORIGINAL_JOB_ID_ENV, RESTART_COUNT_ENV},
    process::{self, Output},
};
use std::{process::Command, time::Duration};
use tracing::{debug, info, instrument};

/// Scheduler backed by the slurm command line tools
#[derive(Debug, Clone)]
pub struct Slurm {
    sbatch: String,
    scontrol: String,
    scancel: String,
    timeout: Duration,
}

impl Slurm {
    pub fn new(
        sbatch: impl Into<String>,
        scontrol: impl Into<String>,
        scancel: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            sbatch: sbatch.into(),
            scontrol: scontrol.into(),
            scancel: scancel.into(),
            timeout,
        }
    }

    fn check(&self, command: &str, output: Output) -> Result<Output, SchedulerError> {
        if output.success() {
            Ok(output)
        } else {
            Err(SchedulerError::Command {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    fn control(&self, action: &str, job: JobId) -> Result<(), SchedulerError> {
        let mut command = Command::new(&self.scontrol);
        command.arg(action).arg(job.to_string());

        let output = process::run_captured(command, None, self.timeout)?;
        self.check(&format!("{} {action} {job}", self.scontrol), output)?;

        Ok(())
    }
}

/// arguments for `sbatch`, the script itself is read from stdin
pub fn sbatch_args(held: bool) -> Vec<&'static str> {
    if held {
        vec!["--parsable", "--hold"]
    } else {
        vec!["--parsable"]
    }
}

/// `sbatch --parsable` prints `<job id>[;<cluster>]`
pub fn parse_job_id(stdout: &str) -> Result<JobId, SchedulerError> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(';').next())
        .and_then(|id| id.parse::<JobId>().ok())
        .ok_or_else(|| SchedulerError::InvalidJobId(stdout.trim().to_string()))
}

impl Scheduler for Slurm {
    #[instrument(skip(self, script), level = "debug")]
    fn submit(&self, script: &str, held: bool) -> Result<JobId, SchedulerError> {
        let mut command = Command::new(&self.sbatch);
        // identity is carried by the script, never by the submitting shell
        command
            .args(sbatch_args(held))
            .env_remove(ORIGINAL_JOB_ID_ENV)
            .env_remove(RESTART_COUNT_ENV);

        let output = process::run_captured(command, Some(script.as_bytes()), self.timeout)?;
        let output = self.check(&self.sbatch, output)?;
        let job = parse_job_id(&output.stdout)?;

        info!(job = %job, held = held, "Submitted batch script");

        Ok(job)
    }

    fn release(&self, job: JobId) -> Result<(), SchedulerError> {
        debug!(job = %job, "Releasing job");
        self.control("release", job)
    }

    fn cancel(&self, job: JobId) -> Result<(), SchedulerError> {
        debug!(job = %job, "Cancelling job");

        let mut command = Command::new(&self.scancel);
        command.arg(job.to_string());

        let output = process::run_captured(command, None, self.timeout)?;
        self.check(&format!("{} {job}", self.scancel), output)?;

        Ok(())
    }

    fn requeue(&self, job: JobId) -> Result<(), SchedulerError> {
        debug!(job = %job, "Requeueing job");
        self.control("requeue", job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};
    use tempfile::TempDir;

    fn stub(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        path.to_string_lossy().into_owned()
    }

    #[test]
    pub fn parsable_output() {
        assert_eq!(parse_job_id("100\n").unwrap(), JobId(100));
        assert_eq!(parse_job_id("\n4242;cluster\n").unwrap(), JobId(4242));
        assert!(matches!(
            parse_job_id("sbatch: error: invalid partition"),
            Err(SchedulerError::InvalidJobId(_))
        ));
        assert!(parse_job_id("").is_err());
    }

    #[test]
    pub fn held_submissions_pass_hold() {
        assert_eq!(sbatch_args(true), vec!["--parsable", "--hold"]);
        assert_eq!(sbatch_args(false), vec!["--parsable"]);
    }

    #[test]
    pub fn submit_pipes_script_and_strips_identity() {
        let dir = TempDir::new().unwrap();
        let captured = dir.path().join("script");
        let sbatch = stub(
            dir.path(),
            "sbatch",
            &format!(
                "cat > {0}\necho \"args=$* original=${{ORIGINAL_JOB_ID:-unset}}\" >> {0}\necho '123;cluster'",
                captured.display()
            ),
        );
        let slurm = Slurm::new(sbatch, "scontrol", "scancel", Duration::from_secs(10));

        std::env::set_var(ORIGINAL_JOB_ID_ENV, "999");
        let job = slurm.submit("#!/usr/bin/env bash\necho hi\n", true);
        std::env::remove_var(ORIGINAL_JOB_ID_ENV);

        assert_eq!(job.unwrap(), JobId(123));
        assert_eq!(
            fs::read_to_string(&captured).unwrap(),
            "#!/usr/bin/env bash\necho hi\nargs=--parsable --hold original=unset\n"
        );
    }

    #[test]
    pub fn rejected_submission_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let sbatch = stub(
            dir.path(),
            "sbatch",
            "cat > /dev/null\necho 'sbatch: error: Batch job submission failed' >&2\nexit 1",
        );
        let slurm = Slurm::new(sbatch, "scontrol", "scancel", Duration::from_secs(10));

        match slurm.submit("#!/usr/bin/env bash\n", true) {
            Err(SchedulerError::Command { status, stderr, .. }) => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "sbatch: error: Batch job submission failed");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    pub fn control_commands_address_the_job() {
        let dir = TempDir::new().unwrap();
        let calls = dir.path().join("calls");
        let scontrol = stub(
            dir.path(),
            "scontrol",
            &format!("echo \"scontrol $*\" >> {}", calls.display()),
        );
        let scancel = stub(
            dir.path(),
            "scancel",
            &format!("echo \"scancel $*\" >> {}", calls.display()),
        );
        let slurm = Slurm::new("sbatch", scontrol, scancel, Duration::from_secs(10));

        slurm.release(JobId(5)).unwrap();
        slurm.requeue(JobId(5)).unwrap();
        slurm.cancel(JobId(5)).unwrap();

        assert_eq!(
            fs::read_to_string(&calls).unwrap(),
            "scontrol release 5\nscontrol requeue 5\nscancel 5\n"
        );
    }
}
