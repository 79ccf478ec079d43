//! File system and remote location collaborators
//!
//! Everything the loader and the bulk operations touch on disk goes through
//! [`FileSystem`], so tests can run against [`MemoryFileSystem`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use stackfile_engine::ReadFileFn;

pub trait FileSystem: Send + Sync {
    fn read_file(&self, path: &Path) -> io::Result<String>;
    fn write_file(&self, path: &Path, content: &[u8]) -> io::Result<()>;
    fn file_exists(&self, path: &Path) -> bool;
    fn directory_exists(&self, path: &Path) -> bool;
    /// Paths matching `pattern`, sorted
    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn abs(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Adapt a file system into the reader the template engine expects
pub fn reader(fs: Arc<dyn FileSystem>) -> ReadFileFn {
    Arc::new(move |path: &Path| fs.read_file(path))
}

/// The real file system
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let paths = glob::glob(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut matches = paths
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| io::Error::other(e.to_string()))?;
        matches.sort();
        Ok(matches)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn abs(&self, path: &Path) -> io::Result<PathBuf> {
        std::path::absolute(path)
    }
}

/// In-memory file system keyed by absolute path
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), content.into());
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>>> {
        self.files
            .lock()
            .map_err(|_| io::Error::other("memory file system lock poisoned"))
    }
}

impl FileSystem for MemoryFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<String> {
        let files = self.lock()?;
        let content = files.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
        })?;
        String::from_utf8(content.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        self.lock()?.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.lock().map(|f| f.contains_key(path)).unwrap_or(false)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        self.lock()
            .map(|f| f.keys().any(|p| p != path && p.starts_with(path)))
            .unwrap_or(false)
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(self
            .lock()?
            .keys()
            .filter(|p| pattern.matches_path(p))
            .cloned()
            .collect())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.lock()?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn abs(&self, path: &Path) -> io::Result<PathBuf> {
        Ok(Path::new("/").join(path))
    }
}

/// Resolves a remote reference to a local path
pub trait Remote: Send + Sync {
    fn locate(&self, url_or_path: &str) -> io::Result<String>;
}

/// Remote that only accepts local paths
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRemote;

impl Remote for LocalRemote {
    fn locate(&self, url_or_path: &str) -> io::Result<String> {
        if url_or_path.contains("::") || url_or_path.contains("://") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{}: remote locations are not supported", url_or_path),
            ));
        }
        Ok(url_or_path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_glob_is_sorted() {
        let fs = MemoryFileSystem::new()
            .with_file("/env/b.yaml", "b: 1")
            .with_file("/env/a.yaml", "a: 1")
            .with_file("/other/c.yaml", "c: 1");
        assert_eq!(
            fs.glob("/env/*.yaml").unwrap(),
            vec![PathBuf::from("/env/a.yaml"), PathBuf::from("/env/b.yaml")]
        );
    }

    #[test]
    fn test_memory_round_trip() {
        let fs = MemoryFileSystem::new();
        fs.write_file(Path::new("/tmp/x"), b"hello").unwrap();
        assert!(fs.file_exists(Path::new("/tmp/x")));
        assert!(fs.directory_exists(Path::new("/tmp")));
        assert_eq!(fs.read_file(Path::new("/tmp/x")).unwrap(), "hello");
        fs.remove_file(Path::new("/tmp/x")).unwrap();
        assert!(!fs.file_exists(Path::new("/tmp/x")));
        assert!(fs.read_file(Path::new("/tmp/x")).is_err());
    }

    #[test]
    fn test_os_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2.yaml"), "").unwrap();
        std::fs::write(dir.path().join("1.yaml"), "").unwrap();
        let pattern = format!("{}/*.yaml", dir.path().display());
        let found = OsFileSystem.glob(&pattern).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("1.yaml"));
    }

    #[test]
    fn test_local_remote_rejects_urls() {
        assert_eq!(LocalRemote.locate("values.yaml").unwrap(), "values.yaml");
        assert!(LocalRemote.locate("git::https://example.com/repo").is_err());
    }
}
