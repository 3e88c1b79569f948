use super::CheckpointTool;
use crate::process::ProcessError;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Launch { binary: PathBuf, settings: PathBuf },
    Restart(PathBuf),
}

/// Tool answering with scripted exit codes, the last code repeats once the script runs out
#[derive(Debug)]
pub struct FakeTool {
    codes: Mutex<VecDeque<i32>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeTool {
    pub fn with_codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            codes: Mutex::new(codes.into_iter().collect()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    fn next_code(&self) -> i32 {
        let mut codes = self.codes.lock();

        if codes.len() > 1 {
            codes.pop_front().unwrap_or(0)
        } else {
            codes.front().copied().unwrap_or(0)
        }
    }
}

impl CheckpointTool for FakeTool {
    fn launch(&self, binary: &Path, settings: &Path) -> Result<i32, ProcessError> {
        self.invocations.lock().push(Invocation::Launch {
            binary: binary.to_path_buf(),
            settings: settings.to_path_buf(),
        });

        Ok(self.next_code())
    }

    fn restart(&self, image: &Path) -> Result<i32, ProcessError> {
        self.invocations
            .lock()
            .push(Invocation::Restart(image.to_path_buf()));

        Ok(self.next_code())
    }
}
