use super::CheckpointTool;
use crate::process::{self, ProcessError};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CHECKPOINT_DIR_ENV: &str = "DMTCP_CHECKPOINT_DIR";

pub fn default_launch() -> Vec<String> {
    vec!["srun".into(), "dmtcp_launch".into()]
}

pub fn default_restart() -> Vec<String> {
    vec!["srun".into(), "--disable-status".into(), "dmtcp_restart".into()]
}

/// DMTCP driven through configurable command lines, by default run as a job step via `srun`
#[derive(Debug, Clone)]
pub struct Dmtcp {
    launch: Vec<String>,
    restart: Vec<String>,
    directory: PathBuf,
}

impl Dmtcp {
    /// `directory` is where DMTCP writes its images, the checkpoint directory of the job
    pub fn new(launch: Vec<String>, restart: Vec<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            launch,
            restart,
            directory: directory.into(),
        }
    }
}

impl CheckpointTool for Dmtcp {
    fn launch(&self, binary: &Path, settings: &Path) -> Result<i32, ProcessError> {
        let mut command = process::command_line(&self.launch)?;
        command
            .arg(binary)
            .arg(settings)
            .env(CHECKPOINT_DIR_ENV, &self.directory);

        info!(binary = ?binary, settings = ?settings, "Launching under checkpoint control");
        process::run_inherited(command)
    }

    fn restart(&self, image: &Path) -> Result<i32, ProcessError> {
        let mut command = process::command_line(&self.restart)?;
        command.arg(image).env(CHECKPOINT_DIR_ENV, &self.directory);

        info!(image = ?image, "Restarting from checkpoint image");
        process::run_inherited(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn recorder(dir: &Path, code: i32) -> Vec<String> {
        let out = dir.join("out");
        vec![
            "sh".into(),
            "-c".into(),
            format!(
                "echo \"$* $DMTCP_CHECKPOINT_DIR\" >> {}; exit {code}",
                out.display()
            ),
            "tool".into(),
        ]
    }

    #[test]
    pub fn passes_paths_and_checkpoint_dir() {
        let dir = TempDir::new().unwrap();
        let tool = Dmtcp::new(recorder(dir.path(), 0), recorder(dir.path(), 7), "/ck/100");

        assert_eq!(
            tool.launch(Path::new("/opt/model"), Path::new("/ck/100/settings"))
                .unwrap(),
            0
        );
        assert_eq!(tool.restart(Path::new("/ck/100/ckpt.dmtcp")).unwrap(), 7);

        assert_eq!(
            fs::read_to_string(dir.path().join("out")).unwrap(),
            "/opt/model /ck/100/settings /ck/100\n/ck/100/ckpt.dmtcp /ck/100\n"
        );
    }

    #[test]
    pub fn empty_command_line_is_an_error() {
        let tool = Dmtcp::new(Vec::new(), Vec::new(), "/ck/100");

        assert!(matches!(
            tool.restart(Path::new("/ck/100/ckpt.dmtcp")),
            Err(ProcessError::EmptyCommand)
        ));
    }
}
