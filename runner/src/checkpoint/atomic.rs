use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::debug;

/// write `bytes` to `path` through a sibling temporary file and a rename
/// rename(2) is atomic on the same filesystem, readers see either the old or the new content
pub fn write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = NamedTempFile::new_in(parent(path)?)?;

    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    persist(file, path)
}

/// copy `from` to `to` with the same guarantees as `write`
pub fn copy(from: &Path, to: &Path) -> io::Result<u64> {
    let mut source = File::open(from)?;
    let mut file = NamedTempFile::new_in(parent(to)?)?;

    let copied = io::copy(&mut source, &mut file)?;
    file.as_file().sync_all()?;
    persist(file, to)?;

    Ok(copied)
}

fn persist(file: NamedTempFile, path: &Path) -> io::Result<()> {
    match file.persist(path) {
        Ok(_) => {
            debug!(path = ?path, "Finished rename for file");

            Ok(())
        }
        Err(error) => Err(error.error),
    }
}

fn parent(path: &Path) -> io::Result<&Path> {
    path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })
}
