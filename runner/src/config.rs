use crate::{
    batch::BatchScriptBuilder,
    checkpoint::{self, CheckpointError, DEFAULT_IMAGE_GLOB},
    job::{JobId, JobRequest, RequestError, Resources},
    process,
    restart::{ExitCodes, DEFAULT_BUSY_EXIT_CODE, DEFAULT_REQUEUE_EXIT_CODE},
    scheduler::slurm::Slurm,
    tools::dmtcp,
};
use globset::GlobMatcher;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config {path}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Job {0} is not defined")]
    UnknownJob(String),
    #[error("Job {name} is invalid: {source}")]
    InvalidJob { name: String, source: RequestError },
    #[error("Failed to read settings of job {name} from {path}: {source}")]
    Settings {
        name: String,
        path: PathBuf,
        source: Error,
    },
    #[error("Checkpoint image glob was invalid: {0}")]
    InvalidGlob(#[from] CheckpointError),
    #[error("Failed to locate the runner executable: {0}")]
    Runner(Error),
    #[error("Failed to resolve relative path {path}: {source}")]
    Relative { path: PathBuf, source: Error },
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub defaults: JobDefaults,
    pub jobs: Vec<JobConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_submit")]
    pub submit: String,
    #[serde(default = "default_control")]
    pub control: String,
    #[serde(default = "default_cancel")]
    pub cancel: String,
    // timeout of a single scheduler command in ms
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    // path of this binary on the compute nodes, defaults to the running executable
    pub runner: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    #[serde(default = "dmtcp::default_launch")]
    pub launch: Vec<String>,
    #[serde(default = "dmtcp::default_restart")]
    pub restart: Vec<String>,
    #[serde(default = "default_image_glob")]
    pub image_glob: String,
    #[serde(default = "default_busy_exit_code")]
    pub busy_exit_code: i32,
    #[serde(default = "default_requeue_exit_code")]
    pub requeue_exit_code: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // number of concurrent submissions, 1 submits one after the other
    #[serde(default = "default_threads")]
    pub threads: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobDefaults {
    pub account: Option<String>,
    pub partition: Option<String>,
    pub qos: Option<String>,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_time_min")]
    pub time_min: String,
    #[serde(default = "default_notify")]
    pub notify: bool,
    #[serde(default = "default_prelimit_seconds")]
    pub prelimit_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,
    pub binary: PathBuf,
    // path to the settings file handed to the binary on a fresh start
    pub settings: Option<PathBuf>,
    // original job id of a logical job to continue
    pub resume: Option<u64>,
    pub workdir: PathBuf,
    pub logdir: Option<PathBuf>,
    pub checkpointdir: Option<PathBuf>,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub cpus: Option<u32>,
    pub time_min: Option<String>,
    pub notify: Option<bool>,
    pub prelimit_seconds: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit: default_submit(),
            control: default_control(),
            cancel: default_cancel(),
            timeout: default_timeout(),
            runner: None,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            launch: dmtcp::default_launch(),
            restart: dmtcp::default_restart(),
            image_glob: default_image_glob(),
            busy_exit_code: default_busy_exit_code(),
            requeue_exit_code: default_requeue_exit_code(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            account: None,
            partition: None,
            qos: None,
            cpus: default_cpus(),
            time_min: default_time_min(),
            notify: default_notify(),
            prelimit_seconds: default_prelimit_seconds(),
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn slurm(&self) -> Slurm {
        Slurm::new(&self.submit, &self.control, &self.cancel, self.timeout())
    }
}

impl CheckpointConfig {
    pub fn codes(&self) -> ExitCodes {
        ExitCodes {
            busy: self.busy_exit_code,
            requeue: self.requeue_exit_code,
        }
    }

    pub fn matcher(&self) -> Result<GlobMatcher, ConfigErrors> {
        Ok(checkpoint::image_matcher(&self.image_glob)?)
    }
}

// relative paths are taken relative to the working directory of the submitting process
fn absolute(path: &Path) -> Result<PathBuf, ConfigErrors> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .map_err(|source| ConfigErrors::Relative {
                path: path.to_path_buf(),
                source,
            })
    }
}

// names end up inside a quoted `#SBATCH --job-name` directive
fn valid_job_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.chars().any(|c| c == '"' || c == '\\' || c.is_control())
}

fn required(
    name: &str,
    field: &'static str,
    job: &Option<String>,
    default: &Option<String>,
) -> Result<String, ConfigErrors> {
    job.as_ref()
        .or(default.as_ref())
        .cloned()
        .ok_or_else(|| ConfigErrors::InvalidJob {
            name: name.to_string(),
            source: RequestError::MissingField(field),
        })
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig, ConfigErrors> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| ConfigErrors::UnknownJob(name.to_string()))
    }

    pub fn script_builder(&self) -> Result<BatchScriptBuilder, ConfigErrors> {
        let runner = match &self.scheduler.runner {
            Some(runner) => absolute(runner)?,
            None => env::current_exe().map_err(ConfigErrors::Runner)?,
        };

        Ok(BatchScriptBuilder {
            runner,
            control: self.scheduler.control.clone(),
            launch: self.checkpoint.launch.clone(),
            restart: self.checkpoint.restart.clone(),
            image_glob: self.checkpoint.image_glob.clone(),
            codes: self.checkpoint.codes(),
        })
    }

    /// resolve a configured job into a request, reading its settings payload
    pub fn job_request(&self, job: &JobConfig) -> Result<JobRequest, ConfigErrors> {
        let defaults = &self.defaults;
        let resources = Resources {
            account: required(&job.name, "account", &job.account, &defaults.account)?,
            partition: required(&job.name, "partition", &job.partition, &defaults.partition)?,
            qos: required(&job.name, "qos", &job.qos, &defaults.qos)?,
            cpus: job.cpus.unwrap_or(defaults.cpus),
            time_min: job
                .time_min
                .clone()
                .unwrap_or_else(|| defaults.time_min.clone()),
            notify: job.notify.unwrap_or(defaults.notify),
            prelimit_seconds: job.prelimit_seconds.unwrap_or(defaults.prelimit_seconds),
        };

        let mut builder = JobRequest::builder(job.name.clone())
            .binary(absolute(&job.binary)?)
            .resources(resources)
            .workdir(absolute(&job.workdir)?);

        if let Some(ref logdir) = job.logdir {
            builder = builder.logdir(absolute(logdir)?);
        }
        if let Some(ref checkpointdir) = job.checkpointdir {
            builder = builder.checkpointdir(absolute(checkpointdir)?);
        }
        if let Some(ref settings) = job.settings {
            let payload = fs::read(settings).map_err(|source| ConfigErrors::Settings {
                name: job.name.clone(),
                path: settings.clone(),
                source,
            })?;
            builder = builder.settings(payload);
        }
        if let Some(resume) = job.resume {
            builder = builder.resume(JobId(resume));
        }

        builder.build().map_err(|source| ConfigErrors::InvalidJob {
            name: job.name.clone(),
            source,
        })
    }

    pub fn job_requests(&self) -> Result<Vec<JobRequest>, ConfigErrors> {
        self.jobs.iter().map(|job| self.job_request(job)).collect()
    }

    /// check whether a binary is usable, it has to answer `--info` successfully
    fn check_binary(&self, name: &str, binary: &Path) -> bool {
        match check_executable(binary) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "jobs.{name}.binary {} is not executable",
                    binary.to_string_lossy()
                );
                return false;
            }
            Err(e) => {
                error!(
                    "Failed to find jobs.{name}.binary at {}: {e}",
                    binary.to_string_lossy()
                );
                return false;
            }
        }

        let mut command = Command::new(binary);
        command.arg("--info");

        match process::run_captured(command, None, self.scheduler.timeout()) {
            Ok(output) if output.success() => {
                debug!("jobs.{name}.binary answered --info");
                true
            }
            Ok(output) => {
                error!(
                    stderr = %output.stderr,
                    "Could not run jobs.{name}.binary {}: exit code {}",
                    binary.to_string_lossy(),
                    output.status
                );
                false
            }
            Err(e) => {
                error!(
                    "Could not run jobs.{name}.binary {}: {e}",
                    binary.to_string_lossy()
                );
                false
            }
        }
    }

    /// returns true if any check failed, every problem is logged before returning
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.jobs.is_empty() {
            error!("No job was defined, nothing to schedule");
            contains_error = true;
        }

        for name in self.jobs.iter().map(|job| &job.name).duplicates() {
            error!("Job {name} is defined more than once");
            contains_error = true;
        }

        if let Err(e) = self.checkpoint.matcher() {
            error!("checkpoint.image_glob is invalid: {e}");
            contains_error = true;
        }

        let codes = self.checkpoint.codes();
        if codes.busy == codes.requeue {
            error!("checkpoint.busy_exit_code and checkpoint.requeue_exit_code must differ");
            contains_error = true;
        }
        if codes.busy == 0 || codes.requeue == 0 {
            error!("checkpoint exit codes must not be 0, 0 marks a finished job");
            contains_error = true;
        }

        if self.checkpoint.launch.is_empty() || self.checkpoint.restart.is_empty() {
            error!("checkpoint.launch and checkpoint.restart must name a command");
            contains_error = true;
        }

        if self.executor.threads == 0 {
            error!("executor.threads must be at least 1");
            contains_error = true;
        }

        // binaries are usually shared between jobs, only probe each once
        for (binary, names) in &self
            .jobs
            .iter()
            .sorted_by(|a, b| a.binary.cmp(&b.binary))
            .group_by(|job| job.binary.clone())
        {
            let names = names.map(|job| job.name.as_str()).collect_vec();
            if !self.check_binary(&names.join(", "), &binary) {
                contains_error = true;
            }
        }

        for job in self.jobs.iter() {
            let name = &job.name;

            if !valid_job_name(name) {
                error!("Job name {name:?} cannot be used in a batch script, avoid quotes and control characters");
                contains_error = true;
            }

            match (&job.settings, job.resume) {
                (Some(_), Some(_)) => {
                    error!("jobs.{name} defines both settings and resume, pick one");
                    contains_error = true;
                }
                (None, None) => {
                    error!("jobs.{name} defines neither settings nor resume");
                    contains_error = true;
                }
                (Some(settings), None) if !settings.is_file() => {
                    error!(
                        "jobs.{name}.settings {} is not a file",
                        settings.to_string_lossy()
                    );
                    contains_error = true;
                }
                _ => {}
            }

            if job.cpus.unwrap_or(self.defaults.cpus) == 0 {
                error!("jobs.{name}.cpus cannot be 0");
                contains_error = true;
            }

            for (field, value, default) in [
                ("account", &job.account, &self.defaults.account),
                ("partition", &job.partition, &self.defaults.partition),
                ("qos", &job.qos, &self.defaults.qos),
            ] {
                if value.is_none() && default.is_none() {
                    error!("jobs.{name}.{field} is not set and there is no default");
                    contains_error = true;
                }
            }

            if job.logdir.is_none() && job.checkpointdir.is_none() {
                warn!("jobs.{name} has neither logdir nor checkpointdir, both fall back to its workdir");
            }
        }

        contains_error
    }
}

fn default_submit() -> String {
    "sbatch".to_string()
}

fn default_control() -> String {
    "scontrol".to_string()
}

fn default_cancel() -> String {
    "scancel".to_string()
}

fn default_timeout() -> u64 {
    60_000
}

fn default_image_glob() -> String {
    DEFAULT_IMAGE_GLOB.to_string()
}

fn default_busy_exit_code() -> i32 {
    DEFAULT_BUSY_EXIT_CODE
}

fn default_requeue_exit_code() -> i32 {
    DEFAULT_REQUEUE_EXIT_CODE
}

fn default_threads() -> usize {
    1
}

fn default_cpus() -> u32 {
    16
}

fn default_time_min() -> String {
    "4:00:00".to_string()
}

fn default_notify() -> bool {
    true
}

fn default_prelimit_seconds() -> u64 {
    60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn model(dir: &Path, info_exit: i32) -> PathBuf {
        let path = dir.join("model");
        fs::write(&path, format!("#!/bin/sh\nexit {info_exit}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(jobs: &str) -> RunnerConfig {
        serde_yaml::from_str(&format!(
            "defaults:\n  account: acclimat\n  partition: priority\n  qos: priority\njobs:\n{jobs}",
        ))
        .unwrap()
    }

    #[test]
    pub fn defaults_follow_the_dmtcp_setup() {
        let config: RunnerConfig = serde_yaml::from_str("jobs: []").unwrap();

        assert_eq!(config.scheduler.submit, "sbatch");
        assert_eq!(config.scheduler.timeout(), Duration::from_secs(60));
        assert_eq!(config.checkpoint.image_glob, "*.dmtcp");
        assert_eq!(config.checkpoint.codes(), ExitCodes { busy: 1, requeue: 7 });
        assert_eq!(config.checkpoint.launch, vec!["srun", "dmtcp_launch"]);
        assert_eq!(config.defaults.cpus, 16);
        assert_eq!(config.defaults.prelimit_seconds, 3600);
        assert_eq!(config.executor.threads, 1);
    }

    #[test]
    pub fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RunnerConfig>("jobs: []\nqueue: short\n").is_err());
    }

    #[test]
    pub fn job_request_reads_settings_and_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let binary = model(dir.path(), 0);
        let settings = dir.path().join("settings.yml");
        fs::write(&settings, b"years: 3\n").unwrap();

        let config = config(
            &format!(
                "  - name: run_0\n    binary: {}\n    settings: {}\n    workdir: {}\n    cpus: 4\n",
                binary.display(),
                settings.display(),
                dir.path().display()
            ),
        );
        let request = config.job_request(config.job("run_0").unwrap()).unwrap();

        assert_eq!(request.payload, JobPayload::Fresh(b"years: 3\n".to_vec()));
        assert_eq!(request.resources.cpus, 4);
        assert_eq!(request.resources.account, "acclimat");
        assert_eq!(request.resources.time_min, "4:00:00");
        assert_eq!(request.checkpointdir, dir.path());
        assert!(!config.preflight_checks());
    }

    #[test]
    pub fn job_names_must_fit_a_directive() {
        assert!(valid_job_name("run_0"));
        assert!(valid_job_name("ensemble member 3"));
        assert!(!valid_job_name(""));
        assert!(!valid_job_name("say \"hi\""));
        assert!(!valid_job_name("two\nlines"));
        assert!(!valid_job_name("back\\slash"));

        let dir = TempDir::new().unwrap();
        let binary = model(dir.path(), 0);
        let settings = dir.path().join("settings.yml");
        fs::write(&settings, b"years: 3\n").unwrap();
        let mut config = config(&format!(
            "  - name: run_0\n    binary: {}\n    settings: {}\n    workdir: {}\n",
            binary.display(),
            settings.display(),
            dir.path().display()
        ));
        assert!(!config.preflight_checks());

        config.jobs[0].name = "run\"0".to_string();
        assert!(config.preflight_checks());
    }

    #[test]
    pub fn preflight_reports_every_problem() {
        let dir = TempDir::new().unwrap();
        let broken = model(dir.path(), 1);

        let mut config = config(
            &format!(
                "  - name: a\n    binary: {0}\n    workdir: /tmp\n  - name: a\n    binary: {0}\n    resume: 5\n    settings: /nonexistent\n    workdir: /tmp\n",
                broken.display()
            ),
        );
        config.checkpoint.requeue_exit_code = 1;

        assert!(config.preflight_checks());
        assert!(matches!(
            config.job_request(&config.jobs[0]),
            Err(ConfigErrors::InvalidJob {
                source: RequestError::MissingPayload,
                ..
            })
        ));
        assert!(matches!(
            config.job_request(&config.jobs[1]),
            Err(ConfigErrors::Settings { .. })
        ));
        assert!(matches!(config.job("b"), Err(ConfigErrors::UnknownJob(_))));
    }

    #[test]
    pub fn resume_jobs_need_no_settings() {
        let dir = TempDir::new().unwrap();
        let binary = model(dir.path(), 0);
        let config = config(
            &format!(
                "  - name: again\n    binary: {}\n    resume: 100\n    workdir: {}\n    logdir: {}/log\n",
                binary.display(),
                dir.path().display(),
                dir.path().display()
            ),
        );

        let request = config.job_request(&config.jobs[0]).unwrap();
        assert_eq!(request.resume_id(), Some(JobId(100)));
        assert_eq!(request.checkpointdir, dir.path().join("log"));
    }
}
