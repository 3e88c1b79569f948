use chrono::NaiveDateTime;
use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};
use thiserror::Error;

pub const ORIGINAL_JOB_ID_ENV: &str = "ORIGINAL_JOB_ID";
pub const RESTART_COUNT_ENV: &str = "RESTART_COUNT";
pub const SLURM_JOB_ID_ENV: &str = "SLURM_JOB_ID";
pub const SLURM_JOB_NAME_ENV: &str = "SLURM_JOB_NAME";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Specify either a settings payload or a resume id, not both")]
    ConflictingPayload,
    #[error("Specify a settings payload or a resume id")]
    MissingPayload,
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),
    #[error("Invalid job id `{0}`")]
    InvalidJobId(String),
    #[error("Invalid value for {name}: `{value}`")]
    InvalidEnvironment { name: &'static str, value: String },
}

/// scheduler assigned job id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(JobId)
            .map_err(|_| RequestError::InvalidJobId(value.to_string()))
    }
}

/// What a job starts from: a fresh settings file or an existing logical job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Fresh(Vec<u8>),
    Resume(JobId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    pub account: String,
    pub partition: String,
    pub qos: String,
    pub cpus: u32,
    /// minimal run time in slurm notation, e.g. `4:00:00`
    pub time_min: String,
    pub notify: bool,
    /// lead time of the preemption signal before the hard limit
    pub prelimit_seconds: u64,
}

/// Immutable description of one logical job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub binary: PathBuf,
    pub resources: Resources,
    pub workdir: PathBuf,
    pub logdir: PathBuf,
    pub checkpointdir: PathBuf,
    pub payload: JobPayload,
}

impl JobRequest {
    pub fn builder(name: impl Into<String>) -> JobRequestBuilder {
        JobRequestBuilder::new(name)
    }

    pub fn resume_id(&self) -> Option<JobId> {
        match self.payload {
            JobPayload::Resume(id) => Some(id),
            JobPayload::Fresh(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequestBuilder {
    name: String,
    binary: Option<PathBuf>,
    resources: Option<Resources>,
    workdir: Option<PathBuf>,
    logdir: Option<PathBuf>,
    checkpointdir: Option<PathBuf>,
    settings: Option<Vec<u8>>,
    resume: Option<JobId>,
}

impl JobRequestBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: None,
            resources: None,
            workdir: None,
            logdir: None,
            checkpointdir: None,
            settings: None,
            resume: None,
        }
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn logdir(mut self, logdir: impl Into<PathBuf>) -> Self {
        self.logdir = Some(logdir.into());
        self
    }

    pub fn checkpointdir(mut self, checkpointdir: impl Into<PathBuf>) -> Self {
        self.checkpointdir = Some(checkpointdir.into());
        self
    }

    pub fn settings(mut self, settings: impl Into<Vec<u8>>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    pub fn resume(mut self, original: JobId) -> Self {
        self.resume = Some(original);
        self
    }

    /// logdir falls back to workdir, checkpointdir falls back to logdir
    pub fn build(self) -> Result<JobRequest, RequestError> {
        let payload = match (self.settings, self.resume) {
            (Some(_), Some(_)) => return Err(RequestError::ConflictingPayload),
            (None, None) => return Err(RequestError::MissingPayload),
            (Some(settings), None) => JobPayload::Fresh(settings),
            (None, Some(original)) => JobPayload::Resume(original),
        };

        let workdir = self.workdir.ok_or(RequestError::MissingField("workdir"))?;
        let logdir = self.logdir.unwrap_or_else(|| workdir.clone());
        let checkpointdir = self.checkpointdir.unwrap_or_else(|| logdir.clone());

        Ok(JobRequest {
            name: self.name,
            binary: self.binary.ok_or(RequestError::MissingField("binary"))?,
            resources: self
                .resources
                .ok_or(RequestError::MissingField("resources"))?,
            workdir,
            logdir,
            checkpointdir,
            payload,
        })
    }
}

/// Identity a batch script is rendered with
///
/// `original_job_id` is `None` for a fresh submission, the id is then only known once the
/// scheduler accepted the script and is taken from the scheduler environment at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineage {
    pub original_job_id: Option<JobId>,
    pub restart_count: u32,
}

impl Lineage {
    pub fn fresh() -> Self {
        Self {
            original_job_id: None,
            restart_count: 0,
        }
    }

    pub fn resumed(original_job_id: JobId, restart_count: u32) -> Self {
        Self {
            original_job_id: Some(original_job_id),
            restart_count,
        }
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub name: String,
    pub job_id: JobId,
    pub original_job_id: JobId,
    pub restart_count: u32,
    pub schedule_time: NaiveDateTime,
}

/// Identity of the physical run as seen from inside the batch job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub name: String,
    pub job_id: JobId,
    pub original_job_id: JobId,
    pub restart_count: u32,
}

impl RunIdentity {
    /// recover the identity from the process environment
    pub fn from_env() -> Result<Self, RequestError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// recover the identity from any key/value source
    /// an empty or unset `ORIGINAL_JOB_ID` means this is the first run of the logical job
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RequestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let job_id = lookup(SLURM_JOB_ID_ENV)
            .ok_or(RequestError::MissingField(SLURM_JOB_ID_ENV))?
            .parse::<JobId>()?;

        let original_job_id = match lookup(ORIGINAL_JOB_ID_ENV).filter(|v| !v.trim().is_empty()) {
            Some(value) => value.parse::<JobId>()?,
            None => job_id,
        };

        let restart_count = match lookup(RESTART_COUNT_ENV).filter(|v| !v.trim().is_empty()) {
            Some(value) => {
                value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| RequestError::InvalidEnvironment {
                        name: RESTART_COUNT_ENV,
                        value,
                    })?
            }
            None => 0,
        };

        Ok(Self {
            name: lookup(SLURM_JOB_NAME_ENV).unwrap_or_default(),
            job_id,
            original_job_id,
            restart_count,
        })
    }

    /// the very first physical run of a fresh logical job, nothing can have been checkpointed yet
    pub fn is_first_run(&self) -> bool {
        self.restart_count == 0 && self.job_id == self.original_job_id
    }

    /// identity of the next physical run after a requeue
    pub fn requeued(&self) -> Self {
        Self {
            restart_count: self.restart_count + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
pub(crate) fn test_resources() -> Resources {
    Resources {
        account: "acclimat".into(),
        partition: "priority".into(),
        qos: "priority".into(),
        cpus: 16,
        time_min: "4:00:00".into(),
        notify: true,
        prelimit_seconds: 3600,
    }
}
