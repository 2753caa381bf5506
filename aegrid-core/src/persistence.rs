//! Snapshot persistence: atomic JSON writes and tolerant removal.
//!
//! Run snapshots are read by concurrently launched trials during collision
//! checks, so every write goes to a `.tmp` sibling first and is renamed into
//! place.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Write `data` as pretty JSON, replacing `path` in one rename.
///
/// Used for `hparams.json` snapshots, `meta.experiment`, and cluster trial
/// requests. Missing parent directories are created.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> io::Result<()> {
    let mut body = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    body.push(b'\n');
    atomic_write(path, &body)
}

/// Write raw bytes through a uniquely named sibling, then rename into place.
///
/// Two trials writing the same path never share a temporary file, and a
/// failed rename leaves no temporary behind.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = staging_path(path);
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

/// Read a JSON document, or `None` when there is no file at `path`.
///
/// A half-written snapshot never appears here since writers rename into
/// place; malformed content is `InvalidData`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Remove a file or directory tree, treating "already gone" as success.
///
/// Returns whether anything was removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("version_0").join("hparams.json");

        let snapshot = json!({ "n_ae_latents": 8, "training_completed": false });
        atomic_write_json(&path, &snapshot).unwrap();

        let loaded: Option<serde_json::Value> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(snapshot));
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("hparams.json")]);
    }

    #[test]
    fn test_failed_rename_leaves_no_staging_file() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("trial_1.json");
        std::fs::create_dir_all(blocked.join("occupied")).unwrap();

        assert!(atomic_write_json(&blocked, &json!({ "index": 1 })).is_err());
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("trial_1.json")]);
    }

    #[test]
    fn test_load_json_missing_file() {
        let loaded: Option<serde_json::Value> =
            load_json(Path::new("/nonexistent/hparams.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_json_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hparams.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json::<serde_json::Value>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_remove_if_exists_handles_files_dirs_and_absence() {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir_all(media.join("nested")).unwrap();
        let meta = dir.path().join("meta.experiment");
        std::fs::write(&meta, "{}").unwrap();

        assert!(remove_if_exists(&media).unwrap());
        assert!(remove_if_exists(&meta).unwrap());
        assert!(!remove_if_exists(&meta).unwrap());
        assert!(!media.exists());
    }
}
