//! The page store interface and its implementations.
//!
//! The core sees untrusted storage as a flat namespace of opaque pages
//! addressed by a stable string name. Everything the store sees is
//! ciphertext produced inside the enclave; see [`EncryptedStore`].

pub mod buffer;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_siv::siv::Aes256Siv;
use aes_siv::KeyInit;
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::types::PageNo;

pub use buffer::{BufferManager, PageHandle, PageType, Versioned};

/// Untrusted storage for encrypted pages.
///
/// `read` returns `None` for missing pages. A downstream replica's store
/// may block inside `read` while the upstream is mid-update; see
/// [`PageStore::is_remote`].
pub trait PageStore: Send + Sync {
    fn read(&self, name: &str) -> CResult<Option<Vec<u8>>>;

    fn write(&self, name: &str, data: &[u8]) -> CResult<()>;

    fn remove(&self, name: &str) -> CResult<()>;

    fn exists(&self, name: &str) -> CResult<bool> {
        Ok(self.read(name)?.is_some())
    }

    /// True when this store reads from an upstream replica's disk. Callers
    /// use this to decide between failing on stale pages and waiting for
    /// the upstream to finish writing.
    fn is_remote(&self) -> bool {
        false
    }
}

/// In-memory page store, mainly for tests.
pub struct MemoryStore {
    pages: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { pages: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemoryStore {
    fn read(&self, name: &str) -> CResult<Option<Vec<u8>>> {
        Ok(self.pages.lock().unwrap().get(name).cloned())
    }

    fn write(&self, name: &str, data: &[u8]) -> CResult<()> {
        self.pages.lock().unwrap().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> CResult<()> {
        self.pages.lock().unwrap().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> CResult<bool> {
        Ok(self.pages.lock().unwrap().contains_key(name))
    }
}

/// Page store backed by one file per page under a directory.
///
/// Takes an exclusive lock on a marker file so two processes cannot
/// operate on the same directory at once.
pub struct FileStore {
    dir: PathBuf,
    _lock_file: std::fs::File,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> CResult<Self> {
        std::fs::create_dir_all(&dir)
            .map_err(|err| Error::Io(format!("{}: {:?}", err, dir.to_str())))?;

        let lock_path = dir.join(".lock");
        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|err| Error::Io(format!("cannot lock {:?}: {}", lock_path, err)))?;

        Ok(Self { dir, _lock_file: lock_file })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl PageStore for FileStore {
    fn read(&self, name: &str) -> CResult<Option<Vec<u8>>> {
        match std::fs::read(self.path(name)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, name: &str, data: &[u8]) -> CResult<()> {
        // Write to a scratch file first so readers never observe a torn page.
        let tmp = self.path(&format!("{}.new", name));
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> CResult<()> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, name: &str) -> CResult<bool> {
        Ok(self.path(name).exists())
    }
}

/// Wraps any page store with AES-SIV authenticated encryption.
///
/// The page name is bound in as associated data, so the untrusted host
/// can neither tamper with a page nor swap two pages for each other.
pub struct EncryptedStore<S: PageStore> {
    inner: S,
    key: [u8; 64],
}

impl<S: PageStore> EncryptedStore<S> {
    pub fn new(inner: S, key: [u8; 64]) -> Self {
        Self { inner, key }
    }

    fn cipher(&self) -> CResult<Aes256Siv> {
        Aes256Siv::new_from_slice(&self.key)
            .map_err(|_| Error::Internal("invalid page encryption key length".into()))
    }
}

impl<S: PageStore> PageStore for EncryptedStore<S> {
    fn read(&self, name: &str) -> CResult<Option<Vec<u8>>> {
        match self.inner.read(name)? {
            None => Ok(None),
            Some(ciphertext) => {
                let mut cipher = self.cipher()?;
                let plaintext = cipher
                    .decrypt([name.as_bytes()], &ciphertext)
                    .map_err(|_| Error::Internal(format!("page '{}' failed to decrypt", name)))?;
                Ok(Some(plaintext))
            }
        }
    }

    fn write(&self, name: &str, data: &[u8]) -> CResult<()> {
        let mut cipher = self.cipher()?;
        let ciphertext = cipher
            .encrypt([name.as_bytes()], data)
            .map_err(|_| Error::Internal(format!("page '{}' failed to encrypt", name)))?;
        self.inner.write(name, &ciphertext)
    }

    fn remove(&self, name: &str) -> CResult<()> {
        self.inner.remove(name)
    }

    fn exists(&self, name: &str) -> CResult<bool> {
        self.inner.exists(name)
    }

    fn is_remote(&self) -> bool {
        self.inner.is_remote()
    }
}

/// Builds the stable name of a page on the untrusted store.
pub fn page_filename(prefix: &str, page_no: PageNo) -> String {
    format!("{}_page_{}", prefix, page_no)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_roundtrip() -> CResult<()> {
        let store = MemoryStore::new();
        assert_eq!(store.read("a")?, None);
        store.write("a", b"hello")?;
        assert_eq!(store.read("a")?, Some(b"hello".to_vec()));
        assert!(store.exists("a")?);
        store.remove("a")?;
        assert!(!store.exists("a")?);
        Ok(())
    }

    #[test]
    fn file_roundtrip() -> CResult<()> {
        let dir = tempdir::TempDir::new("pages")?;
        let store = FileStore::new(dir.path().join("db"))?;

        store.write("db_page_1", &[1, 2, 3])?;
        assert_eq!(store.read("db_page_1")?, Some(vec![1, 2, 3]));
        store.remove("db_page_1")?;
        assert_eq!(store.read("db_page_1")?, None);
        // Removing a missing page is a no-op.
        store.remove("db_page_1")?;
        Ok(())
    }

    #[test]
    fn file_store_locks_directory() -> CResult<()> {
        let dir = tempdir::TempDir::new("pages")?;
        let store = FileStore::new(dir.path().join("db"))?;
        assert!(FileStore::new(dir.path().join("db")).is_err());
        drop(store);
        assert!(FileStore::new(dir.path().join("db")).is_ok());
        Ok(())
    }

    #[test]
    fn encryption_roundtrip_and_tamper_detection() -> CResult<()> {
        let key = [7u8; 64];
        let store = EncryptedStore::new(MemoryStore::new(), key);

        store.write("p1", b"secret")?;
        assert_eq!(store.read("p1")?, Some(b"secret".to_vec()));

        // The untrusted side must only see ciphertext.
        let raw = store.inner.read("p1")?.unwrap();
        assert_ne!(raw, b"secret".to_vec());

        // Swapping page contents breaks authentication.
        store.inner.write("p2", &raw)?;
        assert!(store.read("p2").is_err());
        Ok(())
    }

    #[test]
    fn page_names() {
        assert_eq!(page_filename("test_enclave", 42), "test_enclave_page_42");
    }
}
