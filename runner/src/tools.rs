pub mod dmtcp;

#[cfg(test)]
pub mod fake;

use crate::process::ProcessError;
use std::path::Path;

/// Checkpoint/restart tool wrapping the simulation binary
///
/// Both operations block until the wrapped program exits and return its exit code.
pub trait CheckpointTool {
    /// start `binary` fresh with its settings file, under checkpoint control
    fn launch(&self, binary: &Path, settings: &Path) -> Result<i32, ProcessError>;

    /// continue a program from a checkpoint image
    fn restart(&self, image: &Path) -> Result<i32, ProcessError>;
}
