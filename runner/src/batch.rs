
use crate::{
    job::{JobPayload, JobRequest, Lineage, ORIGINAL_JOB_ID_ENV, RESTART_COUNT_ENV},
    restart::{ExitCodes, BACKOFF_SECS, MAX_ATTEMPTS},
};
use itertools::Itertools;
use std::path::{Path, PathBuf};

/// Everything a rendered script needs besides the job itself
#[derive(Debug, Clone)]
pub struct BatchScriptBuilder {
    /// this binary as seen from the compute nodes
    pub runner: PathBuf,
    /// scheduler control command used to requeue from inside the job
    pub control: String,
    pub launch: Vec<String>,
    pub restart: Vec<String>,
    pub image_glob: String,
    pub codes: ExitCodes,
}

/// quote a value for a POSIX shell
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@%,".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

impl BatchScriptBuilder {
    /// render the batch script of `request` for the given lineage
    ///
    /// The output only depends on the arguments, retry bound and backoff are rendered as
    /// literals so every change to them shows up in the script.
    pub fn render(&self, request: &JobRequest, lineage: &Lineage) -> String {
        let resources = &request.resources;
        let logdir = request.logdir.to_string_lossy();
        // the log file is named after the original job, slurm expands `%j` on first submission
        let output = match (&request.payload, lineage.original_job_id) {
            (_, Some(original)) => original.to_string(),
            (JobPayload::Resume(original), None) => original.to_string(),
            (JobPayload::Fresh(_), None) => "%j".to_string(),
        };

        let mut script = String::new();
        let mut directive = |line: String| {
            script.push_str("#SBATCH ");
            script.push_str(&line);
            script.push('\n');
        };

        directive(format!("--account={}", resources.account));
        directive(format!("--cpus-per-task={}", resources.cpus));
        directive(format!("--error=\"{logdir}/{output}.txt\""));
        directive("--exclusive".to_string());
        directive(format!(
            "--export=ALL,OMP_PROC_BIND=FALSE,OMP_NUM_THREADS={}",
            resources.cpus
        ));
        directive(format!("--job-name=\"{}\"", request.name));
        directive("--nodes=1".to_string());
        directive("--open-mode=append".to_string());
        directive(format!("--output=\"{logdir}/{output}.txt\""));
        directive(format!("--partition={}", resources.partition));
        directive(format!("--qos={}", resources.qos));
        directive("--requeue".to_string());
        directive(format!("--signal=SIGTERM@{}", resources.prelimit_seconds));
        directive(format!("--time-min={}", resources.time_min));
        directive(format!("--chdir=\"{}\"", request.workdir.to_string_lossy()));
        if resources.notify {
            directive("--mail-type=END,FAIL,TIME_LIMIT".to_string());
        }

        let original = match lineage.original_job_id {
            Some(original) => original.to_string(),
            None => "\"$SLURM_JOB_ID\"".to_string(),
        };

        let mut arguments = vec![
            format!("--name {}", quote(&request.name)),
            format!("--binary {}", quote_path(&request.binary)),
            format!("--checkpoint-dir {}", quote_path(&request.checkpointdir)),
            format!("--log-dir {}", quote_path(&request.logdir)),
            format!("--control {}", quote(&self.control)),
            format!("--image-glob {}", quote(&self.image_glob)),
            format!("--max-attempts {MAX_ATTEMPTS}"),
            format!("--backoff-secs {BACKOFF_SECS}"),
            format!("--busy-exit-code {}", self.codes.busy),
            format!("--requeue-exit-code {}", self.codes.requeue),
        ];
        arguments.extend(self.launch.iter().map(|arg| format!("--launch={}", quote(arg))));
        arguments.extend(self.restart.iter().map(|arg| format!("--restart={}", quote(arg))));

        let body = format!(
            "\nexport {ORIGINAL_JOB_ID_ENV}={original}\n\
             export {RESTART_COUNT_ENV}=$(({} + ${{SLURM_RESTART_COUNT:-0}}))\n\n\
             exec {} run \\\n    {}\n",
            lineage.restart_count,
            quote_path(&self.runner),
            arguments.iter().join(" \\\n    "),
        );

        format!("#!/usr/bin/env bash\n{script}{body}")
    }
}

/// read back the identity a script was rendered with
#[cfg(test)]
pub fn parse_lineage(script: &str) -> Option<Lineage> {
    let original_prefix = format!("export {ORIGINAL_JOB_ID_ENV}=");
    let restart_prefix = format!("export {RESTART_COUNT_ENV}=$((");

    let original = script
        .lines()
        .find_map(|line| line.strip_prefix(original_prefix.as_str()))?;
    let restart_count = script
        .lines()
        .find_map(|line| line.strip_prefix(restart_prefix.as_str()))?
        .split(" + ")
        .next()?
        .trim()
        .parse()
        .ok()?;

    Some(Lineage {
        original_job_id: original.parse::<crate::job::JobId>().ok(),
        restart_count,
    })
}
