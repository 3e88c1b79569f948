mod atomic;
#[cfg(test)]
mod store_test;

use crate::job::JobId;
use globset::{GlobBuilder, GlobMatcher};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SETTINGS_FILE: &str = "settings";
pub const BACKUP_FILE: &str = "backup";
pub const DEFAULT_IMAGE_GLOB: &str = "*.dmtcp";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("No checkpoint image in {0} to back up")]
    NoImageToBackup(PathBuf),
    #[error("Checkpoint image glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("Filesystem operation on {path} failed: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl CheckpointError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// compile the pattern checkpoint image file names are matched against
pub fn image_matcher(image_glob: &str) -> Result<GlobMatcher, CheckpointError> {
    Ok(GlobBuilder::new(image_glob)
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

/// On-disk checkpoints of logical jobs, one directory per original job id:
///
/// ```text
/// <root>/<original id>/settings   payload written at first submission
/// <root>/<original id>/*.dmtcp    image(s) written by the checkpoint tool
/// <root>/<original id>/backup     copy of the image made before each restart
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    images: GlobMatcher,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, image_glob: &str) -> Result<Self, CheckpointError> {
        Ok(Self::with_matcher(root, image_matcher(image_glob)?))
    }

    pub fn with_matcher(root: impl Into<PathBuf>, images: GlobMatcher) -> Self {
        Self {
            root: root.into(),
            images,
        }
    }

    pub fn directory(&self, original: JobId) -> PathBuf {
        self.root.join(original.to_string())
    }

    pub fn settings_path(&self, original: JobId) -> PathBuf {
        self.directory(original).join(SETTINGS_FILE)
    }

    pub fn backup_path(&self, original: JobId) -> PathBuf {
        self.directory(original).join(BACKUP_FILE)
    }

    pub fn exists(&self, original: JobId) -> bool {
        self.directory(original).is_dir()
    }

    pub fn ensure_directory(&self, original: JobId) -> Result<PathBuf, CheckpointError> {
        let directory = self.directory(original);
        fs::create_dir_all(&directory).map_err(CheckpointError::io(&directory))?;

        Ok(directory)
    }

    /// the image a restart continues from, the most recently written one if there are several
    pub fn image(&self, original: JobId) -> Result<Option<PathBuf>, CheckpointError> {
        let directory = self.directory(original);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(CheckpointError::io(&directory)(error)),
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;

        for entry in entries {
            let entry = entry.map_err(CheckpointError::io(&directory))?;
            let path = entry.path();

            if !path.is_file() || !self.images.is_match(entry.file_name()) {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map_err(CheckpointError::io(&path))?;

            if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
                newest = Some((modified, path));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }

    pub fn has_image(&self, original: JobId) -> bool {
        match self.image(original) {
            Ok(image) => image.is_some(),
            Err(error) => {
                warn!(error = ?error, "Failed to look for a checkpoint image: {error}");

                false
            }
        }
    }

    /// copy the current image aside before a restart consumes it
    pub fn backup_image(&self, original: JobId) -> Result<PathBuf, CheckpointError> {
        let image = self
            .image(original)?
            .ok_or_else(|| CheckpointError::NoImageToBackup(self.directory(original)))?;
        let backup = self.backup_path(original);

        let bytes = atomic::copy(&image, &backup).map_err(CheckpointError::io(&backup))?;
        debug!(image = ?image, backup = ?backup, bytes = bytes, "Backed up checkpoint image");

        Ok(image)
    }

    /// write the settings payload, overwriting any previous one
    pub fn write_payload(&self, original: JobId, payload: &[u8]) -> Result<PathBuf, CheckpointError> {
        self.ensure_directory(original)?;
        let settings = self.settings_path(original);

        atomic::write(&settings, payload).map_err(CheckpointError::io(&settings))?;
        debug!(path = ?settings, bytes = payload.len(), "Wrote settings payload");

        Ok(settings)
    }

    pub fn delete(&self, original: JobId) -> Result<(), CheckpointError> {
        let directory = self.directory(original);

        match fs::remove_dir_all(&directory) {
            Ok(()) => {
                info!(path = ?directory, "Removed checkpoint directory");

                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(CheckpointError::MissingDirectory(directory))
            }
            Err(error) => Err(CheckpointError::io(&directory)(error)),
        }
    }
}
