use super::CacheStorage;
use crate::error::StorageError;
use crate::types::Response;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const ENTRY_EXT: &str = "entry";

/// Written into every store directory this backend creates. Directories
/// without it are never listed or deleted.
const STORE_MARKER: &str = ".fieldcache-store";

/// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Metadata header of an entry file. The body follows it verbatim.
#[derive(Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
}

/// File-backed cache storage.
///
/// Layout: `<root>/<store>/<sha256(key)>.entry`. An entry file holds a 4-byte
/// big-endian metadata length, the JSON metadata, then the raw body. Entries
/// are written to a temp file and renamed into place, so a reader never sees
/// a half-written response. Each store directory carries a marker file so
/// that other directories under the root are left alone.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, store: &str) -> Result<PathBuf, StorageError> {
        validate_store_name(store)?;
        Ok(self.root.join(store))
    }

    fn entry_path(&self, store: &str, key: &str) -> Result<PathBuf, StorageError> {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        Ok(self
            .store_dir(store)?
            .join(format!("{digest}.{ENTRY_EXT}")))
    }

    fn is_store(&self, dir: &Path) -> bool {
        dir.join(STORE_MARKER).is_file()
    }
}

/// Store names become directory names: `[A-Za-z0-9._-]`, no leading dot.
fn validate_store_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

fn encode_entry(key: &str, response: &Response) -> Result<Vec<u8>, StorageError> {
    let meta = serde_json::to_vec(&EntryMeta {
        key: key.to_string(),
        status: response.status,
        headers: response.headers.clone(),
    })?;
    let meta_len = u32::try_from(meta.len())
        .map_err(|_| StorageError::Corrupt(format!("metadata too large for {key}")))?;

    let mut buf = Vec::with_capacity(4 + meta.len() + response.body.len());
    buf.extend_from_slice(&meta_len.to_be_bytes());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(&response.body);
    Ok(buf)
}

fn decode_entry(path: &Path, raw: Vec<u8>) -> Result<(EntryMeta, Bytes), StorageError> {
    let corrupt = || StorageError::Corrupt(path.display().to_string());

    let len_bytes: [u8; 4] = raw
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(corrupt)?;
    let meta_end = 4 + u32::from_be_bytes(len_bytes) as usize;
    let meta_bytes = raw.get(4..meta_end).ok_or_else(corrupt)?;
    let meta: EntryMeta = serde_json::from_slice(meta_bytes).map_err(|_| corrupt())?;

    let body = Bytes::from(raw).slice(meta_end..);
    Ok((meta, body))
}

impl CacheStorage for DiskStorage {
    fn lookup(&self, store: &str, key: &str) -> Result<Option<Response>, StorageError> {
        let path = self.entry_path(store, key)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (meta, body) = decode_entry(&path, raw)?;
        if meta.key != key {
            tracing::warn!(store, key, found = %meta.key, "digest collision, treating as miss");
            return Ok(None);
        }

        Ok(Some(Response {
            status: meta.status,
            headers: meta.headers,
            body,
        }))
    }

    fn put(&self, store: &str, key: &str, response: &Response) -> Result<(), StorageError> {
        let path = self.entry_path(store, key)?;
        let dir = self.store_dir(store)?;
        fs::create_dir_all(&dir)?;
        if !self.is_store(&dir) {
            fs::write(dir.join(STORE_MARKER), store)?;
        }

        let tmp = dir.join(format!(
            ".{}-{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let buf = encode_entry(key, response)?;

        if let Err(e) = fs::write(&tmp, &buf).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>, StorageError> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !self.is_store(&entry.path()) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_store_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, store: &str) -> Result<bool, StorageError> {
        let dir = self.store_dir(store)?;
        if !self.is_store(&dir) {
            return Ok(false);
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self, store: &str) -> Result<usize, StorageError> {
        let read_dir = match fs::read_dir(self.store_dir(store)?) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        for entry in read_dir {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn validate_name(&self, store: &str) -> Result<(), StorageError> {
        validate_store_name(store)
    }

    fn kind(&self) -> &'static str {
        "disk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip_page(body: &'static str) -> Response {
        Response::ok(body)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_header("etag", "\"abc\"")
    }

    #[test]
    fn persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let key = "GET /trips/dolomites.html";

        DiskStorage::new(tmp.path())
            .put("field-planner-v2", key, &trip_page("<h1>Dolomites</h1>"))
            .unwrap();

        let reopened = DiskStorage::new(tmp.path());
        let entry = reopened.lookup("field-planner-v2", key).unwrap();
        assert_eq!(entry, Some(trip_page("<h1>Dolomites</h1>")));
        assert_eq!(reopened.names().unwrap(), vec!["field-planner-v2"]);
        assert_eq!(reopened.len("field-planner-v2").unwrap(), 1);
    }

    #[test]
    fn missing_store_and_key_are_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(tmp.path().join("not-yet-created"));

        assert_eq!(storage.lookup("v1", "GET /").unwrap(), None);
        assert!(storage.names().unwrap().is_empty());
        assert_eq!(storage.len("v1").unwrap(), 0);
        assert!(!storage.delete("v1").unwrap());
    }

    #[test]
    fn overwrite_replaces_entry_and_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(tmp.path());

        storage.put("v1", "GET /", &trip_page("old")).unwrap();
        storage.put("v1", "GET /", &Response::ok("new")).unwrap();

        let entry = storage.lookup("v1", "GET /").unwrap().unwrap();
        assert_eq!(entry.body.as_ref(), b"new");
        assert!(entry.headers.is_empty());

        let mut files: Vec<_> = fs::read_dir(tmp.path().join("v1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();
        assert_eq!(files.len(), 2, "unexpected files: {files:?}");
        assert_eq!(files[0], STORE_MARKER);
        assert!(files[1].ends_with(".entry"));
    }

    #[test]
    fn delete_removes_whole_store() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(tmp.path());
        storage.put("v1", "GET /a", &trip_page("a")).unwrap();
        storage.put("v1", "GET /b", &trip_page("b")).unwrap();
        storage.put("v2", "GET /a", &trip_page("a2")).unwrap();

        assert!(storage.delete("v1").unwrap());
        assert_eq!(storage.names().unwrap(), vec!["v2"]);
        assert_eq!(storage.lookup("v1", "GET /a").unwrap(), None);
        assert_eq!(storage.len("v2").unwrap(), 1);
    }

    #[test]
    fn rejects_path_like_store_names() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(tmp.path());

        for bad in ["", "../escape", ".hidden", "a/b", "v 1"] {
            assert!(
                matches!(
                    storage.put(bad, "GET /", &trip_page("x")),
                    Err(StorageError::InvalidName(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn truncated_entry_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(tmp.path());
        storage.put("v1", "GET /", &trip_page("body")).unwrap();

        let path = storage.entry_path("v1", "GET /").unwrap();
        fs::write(&path, [0, 0, 1, 0, b'{']).unwrap();

        assert!(matches!(
            storage.lookup("v1", "GET /"),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn ignores_stray_files_in_root() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("README"), "not a store").unwrap();
        fs::create_dir(tmp.path().join(".trash")).unwrap();
        let storage = DiskStorage::new(tmp.path());
        storage.put("v1", "GET /", &trip_page("x")).unwrap();

        assert_eq!(storage.names().unwrap(), vec!["v1"]);
    }

    #[test]
    fn foreign_directories_are_neither_listed_nor_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let notes = tmp.path().join("notes");
        fs::create_dir(&notes).unwrap();
        fs::write(notes.join("todo.txt"), "pack rain gear").unwrap();
        let storage = DiskStorage::new(tmp.path());
        storage.put("v1", "GET /", &trip_page("x")).unwrap();

        assert_eq!(storage.names().unwrap(), vec!["v1"]);
        assert!(!storage.delete("notes").unwrap());
        assert_eq!(fs::read_to_string(notes.join("todo.txt")).unwrap(), "pack rain gear");
    }

    #[test]
    fn validate_name_matches_put_rules() {
        let storage = DiskStorage::new("unused");
        assert!(storage.validate_name("field-planner-v3").is_ok());
        assert!(matches!(
            storage.validate_name("field planner v3"),
            Err(StorageError::InvalidName(_))
        ));
    }
}
