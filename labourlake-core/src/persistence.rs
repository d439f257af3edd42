//! Shared persistence utilities: atomic file writes, JSON load/save.
//!
//! Every JSON artifact in the catalog (transition logs, table metadata,
//! schema directives, glossary terms) goes through these helpers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique temporary sibling for `path`, so concurrent writers never share a
/// scratch file.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a temporary sibling,
/// then renames onto the target path. Creates parent directories if they
/// don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write JSON that must never be overwritten.
///
/// The body is written to a temporary sibling and hard-linked into place, so
/// the target appears complete or not at all. Fails with `AlreadyExists` when
/// `path` is present, even if another writer created it a moment earlier.
pub fn write_json_once<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, json.as_bytes())?;
    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    linked.map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("refusing to overwrite {}", path.display()),
            )
        } else {
            e
        }
    })
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// All `*.json` files directly inside `dir`, sorted by file name.
///
/// A missing directory yields an empty list.
pub fn list_json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TableStub {
        name: String,
        rows: u32,
    }

    #[test]
    fn test_table_entry_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noc.json");

        let data = TableStub {
            name: "noc_unit_groups".into(),
            rows: 516,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<TableStub> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_nested_catalog_dirs_are_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog").join("tables").join("x.json");

        atomic_write_json(&path, &["code", "title"]).unwrap();
        let columns: Option<Vec<String>> = load_json(&path).unwrap();
        assert_eq!(columns.unwrap(), vec!["code", "title"]);
    }

    #[test]
    fn test_absent_entry_is_none() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("schemas").join("cops.json");
        let result: Option<TableStub> = load_json(&missing).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_write_json_once_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");

        write_json_once(&path, &1).unwrap();
        let err = write_json_once(&path, &2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        let loaded: Option<i32> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(1));
    }

    #[test]
    fn test_concurrent_write_once_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transition.json");

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || write_json_once(&path, &i).is_ok())
            })
            .collect();
        let winners = writers.into_iter().map(|w| w.join().unwrap()).filter(|&won| won).count();
        assert_eq!(winners, 1);
        assert!(load_json::<i32>(&path).unwrap().is_some());

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("transition.json")]);
    }

    #[test]
    fn test_replacing_write_leaves_only_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oasis.json");

        atomic_write_json(&path, &1).unwrap();
        atomic_write_json(&path, &2).unwrap();
        assert_eq!(load_json::<i32>(&path).unwrap(), Some(2));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_json_files_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        atomic_write(&dir.path().join("b.json"), b"{}").unwrap();
        atomic_write(&dir.path().join("a.json"), b"{}").unwrap();
        atomic_write(&dir.path().join("notes.txt"), b"hi").unwrap();

        let files = list_json_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
        assert!(list_json_files(&dir.path().join("missing")).unwrap().is_empty());
    }
}
