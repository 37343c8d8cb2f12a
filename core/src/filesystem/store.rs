//! Storage backing the LUN images
//!
//! Paths handed to a store are relative (`BeebSCSI0/scsi0.dat`); the store
//! decides where they live.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use log::*;

use crate::error::{DriveError, DriveResult};

/// An open image, positioned by the caller
pub trait ImageHandle: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> ImageHandle for T {}

pub trait ImageStore: Send {
    fn exists(&self, path: &Path) -> bool;
    fn create_dir(&mut self, path: &Path) -> DriveResult<()>;
    fn file_size(&self, path: &Path) -> DriveResult<u64>;
    fn read_file(&self, path: &Path) -> DriveResult<Vec<u8>>;

    /// Creates or replaces a file with the given contents
    fn write_file(&mut self, path: &Path, data: &[u8]) -> DriveResult<()>;

    /// Creates an empty file if none exists. Returns true if it was created.
    fn create_file(&mut self, path: &Path) -> DriveResult<bool>;

    /// Replaces a file with one of `len` bytes, reserving the space up
    /// front. Contents are unspecified.
    fn allocate(&mut self, path: &Path, len: u64) -> DriveResult<()>;

    fn open(&mut self, path: &Path) -> DriveResult<Box<dyn ImageHandle>>;
}

/// Images in a directory on the host filesystem
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn not_found(path: &Path, e: io::Error) -> DriveError {
        if e.kind() == io::ErrorKind::NotFound {
            DriveError::StorageNotFound(path.to_path_buf())
        } else {
            DriveError::Storage(e)
        }
    }
}

impl ImageStore for DirStore {
    fn exists(&self, path: &Path) -> bool {
        self.full(path).exists()
    }

    fn create_dir(&mut self, path: &Path) -> DriveResult<()> {
        fs::create_dir_all(self.full(path))?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> DriveResult<u64> {
        let meta = fs::metadata(self.full(path)).map_err(|e| Self::not_found(path, e))?;
        Ok(meta.len())
    }

    fn read_file(&self, path: &Path) -> DriveResult<Vec<u8>> {
        fs::read(self.full(path)).map_err(|e| Self::not_found(path, e))
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> DriveResult<()> {
        fs::write(self.full(path), data)?;
        Ok(())
    }

    fn create_file(&mut self, path: &Path) -> DriveResult<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.full(path))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn allocate(&mut self, path: &Path, len: u64) -> DriveResult<()> {
        let f = File::create(self.full(path))?;
        f.try_lock_exclusive()?;
        if let Err(e) = f.allocate(len) {
            // Not all filesystems support preallocation
            warn!("Cannot preallocate {}: {}", path.display(), e);
        }
        f.set_len(len)?;
        Ok(())
    }

    fn open(&mut self, path: &Path) -> DriveResult<Box<dyn ImageHandle>> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.full(path))
            .map_err(|e| Self::not_found(path, e))?;
        f.try_lock_exclusive().map_err(|e| {
            error!("Image {} is in use elsewhere", path.display());
            DriveError::Storage(e)
        })?;
        Ok(Box::new(f))
    }
}

type SharedFile = Arc<Mutex<Vec<u8>>>;

#[derive(Default)]
struct MemoryFs {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, SharedFile>,
}

/// Images held in memory.
///
/// Clones share the same contents, so a test can keep one to inspect or
/// tamper with what the drive sees.
#[derive(Clone, Default)]
pub struct MemoryStore {
    fs: Arc<Mutex<MemoryFs>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a file, creating its parent directory
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        let path = path.into();
        let mut fs = lock(&self.fs);
        if let Some(parent) = path.parent() {
            fs.dirs.insert(parent.to_path_buf());
        }
        fs.files.insert(path, Arc::new(Mutex::new(data)));
    }

    pub fn remove(&self, path: &Path) -> bool {
        lock(&self.fs).files.remove(path).is_some()
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.fs).files.get(path).map(|f| lock(f).clone())
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        lock(&self.fs).dirs.contains(path)
    }

    fn file(&self, path: &Path) -> DriveResult<SharedFile> {
        lock(&self.fs)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| DriveError::StorageNotFound(path.to_path_buf()))
    }
}

impl ImageStore for MemoryStore {
    fn exists(&self, path: &Path) -> bool {
        let fs = lock(&self.fs);
        fs.files.contains_key(path) || fs.dirs.contains(path)
    }

    fn create_dir(&mut self, path: &Path) -> DriveResult<()> {
        lock(&self.fs).dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn file_size(&self, path: &Path) -> DriveResult<u64> {
        let f = self.file(path)?;
        Ok(lock(&f).len() as u64)
    }

    fn read_file(&self, path: &Path) -> DriveResult<Vec<u8>> {
        let f = self.file(path)?;
        Ok(lock(&f).clone())
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> DriveResult<()> {
        self.insert(path, data.to_vec());
        Ok(())
    }

    fn create_file(&mut self, path: &Path) -> DriveResult<bool> {
        if lock(&self.fs).files.contains_key(path) {
            return Ok(false);
        }
        self.insert(path, vec![]);
        Ok(true)
    }

    fn allocate(&mut self, path: &Path, len: u64) -> DriveResult<()> {
        let len = usize::try_from(len).map_err(|_| {
            DriveError::Storage(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "image too large for memory store",
            ))
        })?;
        self.insert(path, vec![0; len]);
        Ok(())
    }

    fn open(&mut self, path: &Path) -> DriveResult<Box<dyn ImageHandle>> {
        Ok(Box::new(MemoryHandle {
            data: self.file(path)?,
            pos: 0,
        }))
    }
}

struct MemoryHandle {
    data: SharedFile,
    pos: u64,
}

impl Read for MemoryHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = lock(&self.data);
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = lock(&self.data);
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = lock(&self.data).len() as i64;
        let new = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => len + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if new < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of image",
            ));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_handle() {
        let mut store = MemoryStore::new();
        let path = Path::new("BeebSCSI0/scsi0.dat");
        assert!(matches!(
            store.open(path),
            Err(DriveError::StorageNotFound(_))
        ));
        assert!(store.create_file(path).unwrap());
        assert!(!store.create_file(path).unwrap());
        assert!(store.has_dir(Path::new("BeebSCSI0")));

        let mut h = store.open(path).unwrap();
        h.seek(SeekFrom::Start(512)).unwrap();
        h.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(store.file_size(path).unwrap(), 515);

        h.seek(SeekFrom::Start(510)).unwrap();
        let mut buf = [0xFF; 8];
        assert_eq!(h.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[0, 0, 1, 2, 3]);
        assert_eq!(h.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn memory_clones_share() {
        let mut a = MemoryStore::new();
        let b = a.clone();
        a.write_file(Path::new("x"), &[9]).unwrap();
        assert_eq!(b.contents(Path::new("x")), Some(vec![9]));
        assert!(b.remove(Path::new("x")));
        assert!(!a.exists(Path::new("x")));
    }

    #[test]
    fn memory_whole_file_access() {
        let mut s = MemoryStore::new();
        let p = Path::new("BeebSCSI0/scsi0.ucd");
        assert!(matches!(
            s.file_size(p),
            Err(DriveError::StorageNotFound(_))
        ));
        assert!(matches!(
            s.read_file(p),
            Err(DriveError::StorageNotFound(_))
        ));
        s.write_file(p, b"DOMES").unwrap();
        assert_eq!(s.file_size(p).unwrap(), 5);
        assert_eq!(s.read_file(p).unwrap(), b"DOMES");
    }

    #[test]
    fn memory_allocate_replaces() {
        let mut s = MemoryStore::new();
        let p = Path::new("d/img");
        s.insert(p, vec![1; 10]);
        s.allocate(p, 4).unwrap();
        assert_eq!(s.contents(p), Some(vec![0; 4]));
    }

    #[test]
    fn dir_store() {
        let root = tempfile::tempdir().unwrap();
        let mut s = DirStore::new(root.path());
        let dir = Path::new("BeebSCSI1");
        let img = dir.join("scsi3.dat");

        assert!(!s.exists(dir));
        s.create_dir(dir).unwrap();
        assert!(s.exists(dir));
        assert!(matches!(
            s.file_size(&img),
            Err(DriveError::StorageNotFound(_))
        ));
        assert!(s.create_file(&img).unwrap());
        assert!(!s.create_file(&img).unwrap());
        assert_eq!(s.file_size(&img).unwrap(), 0);

        s.allocate(&img, 8448).unwrap();
        assert_eq!(s.file_size(&img).unwrap(), 8448);

        {
            let mut h = s.open(&img).unwrap();
            h.seek(SeekFrom::Start(256)).unwrap();
            h.write_all(&[0xAB; 256]).unwrap();
        }
        let data = s.read_file(&img).unwrap();
        assert!(data[256..512].iter().all(|&b| b == 0xAB));

        s.write_file(&dir.join("scsi3.ucd"), b"12345").unwrap();
        assert_eq!(s.read_file(&dir.join("scsi3.ucd")).unwrap(), b"12345");
    }
}
