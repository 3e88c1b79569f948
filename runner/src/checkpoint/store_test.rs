use super::{CheckpointError, CheckpointStore, DEFAULT_IMAGE_GLOB};
use crate::job::JobId;
use std::{fs, thread, time::Duration};
use tempfile::TempDir;

fn store(dir: &TempDir) -> CheckpointStore {
    CheckpointStore::new(dir.path(), DEFAULT_IMAGE_GLOB).unwrap()
}

#[test]
pub fn payload_lands_in_settings_file() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);

    assert!(!store.exists(JobId(100)));

    let path = store.write_payload(JobId(100), b"cfg").unwrap();

    assert_eq!(path, dir.path().join("100").join("settings"));
    assert!(store.exists(JobId(100)));
    assert_eq!(fs::read(&path).unwrap(), b"cfg");

    // overwrite semantics
    store.write_payload(JobId(100), b"other").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"other");
    assert_eq!(fs::read_dir(dir.path().join("100")).unwrap().count(), 1);
}

#[test]
pub fn image_detection_ignores_settings_and_backup() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let directory = store.ensure_directory(JobId(7)).unwrap();

    fs::write(directory.join("settings"), b"cfg").unwrap();
    fs::write(directory.join("backup"), b"old image").unwrap();
    assert!(!store.has_image(JobId(7)));
    assert!(store.image(JobId(7)).unwrap().is_none());

    fs::write(directory.join("ckpt_acclimate_1.dmtcp"), b"image").unwrap();
    assert!(store.has_image(JobId(7)));
}

#[test]
pub fn newest_image_wins() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let directory = store.ensure_directory(JobId(7)).unwrap();

    fs::write(directory.join("ckpt_a.dmtcp"), b"first").unwrap();
    thread::sleep(Duration::from_millis(20));
    fs::write(directory.join("ckpt_b.dmtcp"), b"second").unwrap();

    assert_eq!(
        store.image(JobId(7)).unwrap(),
        Some(directory.join("ckpt_b.dmtcp"))
    );
}

#[test]
pub fn backup_copies_current_image() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let directory = store.ensure_directory(JobId(100)).unwrap();
    fs::write(directory.join("ckpt_acclimate.dmtcp"), b"image v1").unwrap();

    let image = store.backup_image(JobId(100)).unwrap();

    assert_eq!(image, directory.join("ckpt_acclimate.dmtcp"));
    assert_eq!(fs::read(store.backup_path(JobId(100))).unwrap(), b"image v1");
    // the image itself stays in place
    assert_eq!(fs::read(&image).unwrap(), b"image v1");
}

#[test]
pub fn backup_without_image_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store.ensure_directory(JobId(100)).unwrap();

    assert!(matches!(
        store.backup_image(JobId(100)),
        Err(CheckpointError::NoImageToBackup(_))
    ));
    assert!(!store.backup_path(JobId(100)).exists());
}

#[test]
pub fn delete_removes_directory() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store.write_payload(JobId(100), b"cfg").unwrap();

    store.delete(JobId(100)).unwrap();

    assert!(!store.exists(JobId(100)));
    assert!(matches!(
        store.delete(JobId(100)),
        Err(CheckpointError::MissingDirectory(_))
    ));
}

#[test]
pub fn invalid_glob_is_reported() {
    assert!(matches!(
        CheckpointStore::new("/ck", "[unclosed"),
        Err(CheckpointError::InvalidGlob(_))
    ));
}
