//! Blob store behind the run database.
//!
//! Keys are relative paths. The filesystem backend maps them below a root
//! directory; the memory backend keeps a tree in a map so the schedulers can
//! be exercised without touching disk.

use crate::error::{EngineError, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

pub trait Store: Send + Sync {
    /// Returns `None` when the key does not exist.
    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>>;

    /// Creates missing parent directories. Fails on a read-only entry.
    fn write(&self, key: &Path, bytes: &[u8]) -> Result<()>;

    fn append(&self, key: &Path, bytes: &[u8]) -> Result<()>;

    fn exists(&self, key: &Path) -> bool;

    fn is_dir(&self, key: &Path) -> bool;

    /// Creates `key` and its parents. Fails if `key` already exists.
    fn create_dir(&self, key: &Path) -> Result<()>;

    fn create_dir_all(&self, key: &Path) -> Result<()>;

    /// Names of the directories directly below `key`, sorted. Empty if `key` is absent.
    fn list_dirs(&self, key: &Path) -> Result<Vec<String>>;

    /// Names of the files directly below `key`, sorted. Empty if `key` is absent.
    fn list_files(&self, key: &Path) -> Result<Vec<String>>;

    /// Removes everything below `key` but keeps `key` itself.
    fn remove_contents(&self, key: &Path) -> Result<()>;

    fn remove_all(&self, key: &Path) -> Result<()>;

    fn set_read_only(&self, key: &Path, read_only: bool) -> Result<()>;

    fn is_read_only(&self, key: &Path) -> bool;

    /// Physical location of `key`, if the backend has one.
    fn locate(&self, key: &Path) -> Option<PathBuf>;
}

pub fn read_string(store: &dyn Store, key: &Path) -> Result<Option<String>> {
    match store.read(key)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| EngineError::format(key, e.to_string())),
        None => Ok(None),
    }
}

// ============================================================================
// Filesystem backend
// ============================================================================

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Permission bits are not enforced for every user, so read-only
    /// entries are refused before touching the file.
    fn check_writable(&self, key: &Path) -> Result<()> {
        if self.is_read_only(key) {
            return Err(EngineError::Validation(format!("{} is read-only", key.display())));
        }
        Ok(())
    }

    fn path(&self, key: &Path) -> PathBuf {
        self.root.join(key)
    }

    fn list(&self, key: &Path, want_dirs: bool) -> Result<Vec<String>> {
        let dir = self.path(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::io(dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            // entries removed while iterating are skipped
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() == want_dirs {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Store for FsStore {
    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    fn write(&self, key: &Path, bytes: &[u8]) -> Result<()> {
        self.check_writable(key)?;
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        fs::write(&path, bytes).map_err(|e| EngineError::io(path, e))
    }

    fn append(&self, key: &Path, bytes: &[u8]) -> Result<()> {
        self.check_writable(key)?;
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::io(&path, e))?;
        file.write_all(bytes).map_err(|e| EngineError::io(path, e))
    }

    fn exists(&self, key: &Path) -> bool {
        self.path(key).exists()
    }

    fn is_dir(&self, key: &Path) -> bool {
        self.path(key).is_dir()
    }

    fn create_dir(&self, key: &Path) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        fs::create_dir(&path).map_err(|e| EngineError::io(path, e))
    }

    fn create_dir_all(&self, key: &Path) -> Result<()> {
        let path = self.path(key);
        fs::create_dir_all(&path).map_err(|e| EngineError::io(path, e))
    }

    fn list_dirs(&self, key: &Path) -> Result<Vec<String>> {
        self.list(key, true)
    }

    fn list_files(&self, key: &Path) -> Result<Vec<String>> {
        self.list(key, false)
    }

    fn remove_contents(&self, key: &Path) -> Result<()> {
        let dir = self.path(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::io(dir, e)),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::io(path, e)),
            }
        }
        Ok(())
    }

    fn remove_all(&self, key: &Path) -> Result<()> {
        let path = self.path(key);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    fn set_read_only(&self, key: &Path, read_only: bool) -> Result<()> {
        let path = self.path(key);
        let mut perms = fs::metadata(&path)
            .map_err(|e| EngineError::io(&path, e))?
            .permissions();
        perms.set_readonly(read_only);
        fs::set_permissions(&path, perms).map_err(|e| EngineError::io(path, e))
    }

    fn is_read_only(&self, key: &Path) -> bool {
        fs::metadata(self.path(key))
            .map(|m| m.permissions().readonly())
            .unwrap_or(false)
    }

    fn locate(&self, key: &Path) -> Option<PathBuf> {
        Some(self.path(key))
    }
}

// ============================================================================
// Memory backend
// ============================================================================

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { bytes: Vec<u8>, read_only: bool },
}

#[derive(Debug, Default)]
pub struct MemStore {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, key: &Path) {
        for ancestor in key.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            nodes.entry(ancestor.to_path_buf()).or_insert(Node::Dir);
        }
    }

    fn children(&self, key: &Path, want_dirs: bool) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .iter()
            .filter(|(path, node)| {
                path.parent() == Some(key) && matches!(node, Node::Dir) == want_dirs
            })
            .filter_map(|(path, _)| path.file_name()?.to_str().map(str::to_string))
            .collect()
    }
}

impl Store for MemStore {
    fn read(&self, key: &Path) -> Result<Option<Vec<u8>>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        match nodes.get(key) {
            Some(Node::File { bytes, .. }) => Ok(Some(bytes.clone())),
            Some(Node::Dir) => Err(EngineError::format(key, "is a directory")),
            None => Ok(None),
        }
    }

    fn write(&self, key: &Path, bytes: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(Node::File { read_only: true, .. }) = nodes.get(key) {
            return Err(EngineError::Validation(format!(
                "{} is read-only",
                key.display()
            )));
        }
        Self::insert_parents(&mut nodes, key);
        nodes.insert(
            key.to_path_buf(),
            Node::File {
                bytes: bytes.to_vec(),
                read_only: false,
            },
        );
        Ok(())
    }

    fn append(&self, key: &Path, bytes: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        Self::insert_parents(&mut nodes, key);
        match nodes.get_mut(key) {
            Some(Node::File { read_only: true, .. }) => Err(EngineError::Validation(format!(
                "{} is read-only",
                key.display()
            ))),
            Some(Node::File { bytes: existing, .. }) => {
                existing.extend_from_slice(bytes);
                Ok(())
            }
            Some(Node::Dir) => Err(EngineError::format(key, "is a directory")),
            None => {
                nodes.insert(
                    key.to_path_buf(),
                    Node::File {
                        bytes: bytes.to_vec(),
                        read_only: false,
                    },
                );
                Ok(())
            }
        }
    }

    fn exists(&self, key: &Path) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.contains_key(key)
    }

    fn is_dir(&self, key: &Path) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        matches!(nodes.get(key), Some(Node::Dir))
    }

    fn create_dir(&self, key: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.contains_key(key) {
            return Err(EngineError::io(
                key,
                std::io::Error::new(ErrorKind::AlreadyExists, "entry exists"),
            ));
        }
        Self::insert_parents(&mut nodes, key);
        nodes.insert(key.to_path_buf(), Node::Dir);
        Ok(())
    }

    fn create_dir_all(&self, key: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get(key) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File { .. }) => Err(EngineError::format(key, "is a file")),
            None => {
                Self::insert_parents(&mut nodes, key);
                nodes.insert(key.to_path_buf(), Node::Dir);
                Ok(())
            }
        }
    }

    fn list_dirs(&self, key: &Path) -> Result<Vec<String>> {
        Ok(self.children(key, true))
    }

    fn list_files(&self, key: &Path) -> Result<Vec<String>> {
        Ok(self.children(key, false))
    }

    fn remove_contents(&self, key: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.retain(|path, _| path == key || !path.starts_with(key));
        Ok(())
    }

    fn remove_all(&self, key: &Path) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.retain(|path, _| !path.starts_with(key));
        Ok(())
    }

    fn set_read_only(&self, key: &Path, read_only: bool) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(key) {
            Some(Node::File { read_only: flag, .. }) => {
                *flag = read_only;
                Ok(())
            }
            Some(Node::Dir) => Ok(()),
            None => Err(EngineError::NotFound(key.display().to_string())),
        }
    }

    fn is_read_only(&self, key: &Path) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        matches!(nodes.get(key), Some(Node::File { read_only: true, .. }))
    }

    fn locate(&self, _key: &Path) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Store) {
        let run = Path::new("spinup/run_00");
        store.create_dir(run).unwrap();
        assert!(store.is_dir(run));
        assert!(store.create_dir(run).is_err(), "second create must fail");

        let file = run.join("job_options.json");
        store.write(&file, b"{}").unwrap();
        assert_eq!(store.read(&file).unwrap().as_deref(), Some(&b"{}"[..]));
        assert_eq!(store.read(&run.join("missing")).unwrap(), None);

        store.append(Path::new("lookup.txt"), b"a\n").unwrap();
        store.append(Path::new("lookup.txt"), b"b\n").unwrap();
        assert_eq!(
            read_string(store, Path::new("lookup.txt")).unwrap().as_deref(),
            Some("a\nb\n")
        );

        store.create_dir(Path::new("spinup/run_01")).unwrap();
        assert_eq!(
            store.list_dirs(Path::new("spinup")).unwrap(),
            vec!["run_00".to_string(), "run_01".to_string()]
        );
        assert_eq!(store.list_files(run).unwrap(), vec!["job_options.json".to_string()]);
        assert!(store.list_dirs(Path::new("absent")).unwrap().is_empty());

        store.set_read_only(&file, true).unwrap();
        assert!(store.is_read_only(&file));
        assert!(matches!(store.write(&file, b"[]"), Err(EngineError::Validation(_))));
        assert!(matches!(store.append(&file, b"[]"), Err(EngineError::Validation(_))));
        assert_eq!(store.read(&file).unwrap().as_deref(), Some(&b"{}"[..]));
        store.set_read_only(&file, false).unwrap();
        assert!(!store.is_read_only(&file));

        store.remove_contents(run).unwrap();
        assert!(store.is_dir(run));
        assert!(!store.exists(&file));

        store.remove_all(Path::new("spinup")).unwrap();
        assert!(!store.exists(run));
    }

    #[test]
    fn test_mem_store() {
        exercise(&MemStore::new());
    }

    #[test]
    fn test_mem_store_rejects_read_only_writes() {
        let store = MemStore::new();
        let file = Path::new("run_00/job_options.json");
        store.write(file, b"{}").unwrap();
        store.set_read_only(file, true).unwrap();
        assert!(store.write(file, b"[]").is_err());
        assert!(store.append(file, b"[]").is_err());
    }

    #[test]
    fn test_fs_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        exercise(&store);
        assert_eq!(store.locate(Path::new("a")), Some(tmp.path().join("a")));
    }

    #[test]
    fn test_mem_store_has_no_location() {
        assert_eq!(MemStore::new().locate(Path::new("a")), None);
    }
}
