use crate::job::JobId;
use chrono::{Local, NaiveDateTime};
use std::{
    fmt::{self, Display},
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Labels of the lines in a lifecycle log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Scheduled,
    Starting,
    Continuing,
    Busy { attempt: u32, max: u32 },
    Done,
    Requeuing,
    Failed(i32),
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Continuing => write!(f, "CONTINUING"),
            Self::Busy { attempt, max } => write!(f, "BUSY({attempt}/{max})"),
            Self::Done => write!(f, "DONE"),
            Self::Requeuing => write!(f, "REQUEUING"),
            Self::Failed(code) => write!(f, "FAILED({code})"),
        }
    }
}

pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// format a single lifecycle line, without the trailing newline
pub fn format_line(
    event: Event,
    name: &str,
    job_id: JobId,
    restart_count: u32,
    time: &NaiveDateTime,
) -> String {
    format!(
        "{event} {name} {job_id} #{restart_count} @ {}",
        time.format(TIMESTAMP_FORMAT)
    )
}

/// Append-only, human readable log of a logical job, `<logdir>/<original id>.txt`
///
/// The scheduler's own output of the job is appended to the same file.
#[derive(Debug, Clone)]
pub struct LifecycleLog {
    path: PathBuf,
}

impl LifecycleLog {
    pub fn new(logdir: &Path, original_job_id: JobId) -> Self {
        Self {
            path: logdir.join(format!("{original_job_id}.txt")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        event: Event,
        name: &str,
        job_id: JobId,
        restart_count: u32,
        time: &NaiveDateTime,
    ) -> io::Result<()> {
        let line = format_line(event, name, job_id, restart_count, time);
        debug!(path = ?self.path, line = %line, "Appending lifecycle record");

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{line}")
    }

    /// highest restart count recorded so far, `None` if the log is missing or has no records
    pub fn last_restart_count(&self) -> io::Result<Option<u32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };

        Ok(content.lines().filter_map(parse_restart_count).max())
    }
}

// `<EVENT> <name> <id> #<count> @ <time>`, the name may contain spaces
fn parse_restart_count(line: &str) -> Option<u32> {
    let (head, _time) = line.rsplit_once(" @ ")?;
    let (_, count) = head.rsplit_once(" #")?;

    count.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap()
    }

    #[test]
    pub fn scheduled_line_format() {
        assert_eq!(
            format_line(Event::Scheduled, "acclimate", JobId(100), 0, &time()),
            "SCHEDULED acclimate 100 #0 @ 2024-03-01T12:30:05"
        );
        assert_eq!(
            format_line(Event::Failed(3), "acclimate", JobId(101), 2, &time()),
            "FAILED(3) acclimate 101 #2 @ 2024-03-01T12:30:05"
        );
        assert_eq!(
            Event::Busy { attempt: 2, max: 5 }.to_string(),
            "BUSY(2/5)"
        );
    }

    #[test]
    pub fn append_and_scan_restart_count() {
        let dir = TempDir::new().unwrap();
        let log = LifecycleLog::new(dir.path(), JobId(100));

        assert_eq!(log.path(), dir.path().join("100.txt"));
        assert_eq!(log.last_restart_count().unwrap(), None);

        log.append(Event::Scheduled, "run one", JobId(100), 0, &time())
            .unwrap();
        log.append(Event::Requeuing, "run one", JobId(100), 0, &time())
            .unwrap();
        log.append(Event::Continuing, "run one", JobId(100), 1, &time())
            .unwrap();

        // scheduler output shares the file
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"Iteration 5 #9 of 10\n")
            .unwrap();

        assert_eq!(log.last_restart_count().unwrap(), Some(1));

        let content = fs::read_to_string(log.path()).unwrap();
        assert!(content.starts_with("SCHEDULED run one 100 #0 @ 2024-03-01T12:30:05\n"));
    }
}
