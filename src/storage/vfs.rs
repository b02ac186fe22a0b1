//! # Virtual file system
//!
//! The store never touches [`std::fs`] directly; it goes through the [`FileSystem`] and [`File`]
//! traits so that the same engine runs on disk and in memory. The in-memory implementation also
//! models durability: written bytes only survive a simulated crash once they have been synced.

use std::collections;
use std::fs;
use std::io;
use std::ops;
use std::path;
use std::sync;

use parking_lot::Mutex;

/// # File system interface
///
/// See: <https://www.sqlite.org/c3ref/vfs.html>
pub trait FileSystem {
  /// The type of paths that this file system uses.
  type Path: ?Sized;

  /// The type of files that this file system uses.
  type File: File;

  /// Opens a file at the given `path`, creating it if it does not exist.
  fn open(&mut self, path: &Self::Path) -> io::Result<Self::File>;
}

/// # File interface
///
/// See: <https://www.sqlite.org/c3ref/io_methods.html>
pub trait File: Send {
  /// Returns the size of the file in bytes.
  fn size(&mut self) -> io::Result<u64>;

  /// Sets the size of the file in bytes.
  fn truncate(&mut self, size: u64) -> io::Result<()>;

  /// Reads exactly `buf.len()` bytes from the file at the given `offset`.
  fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

  /// Writes `buf` to the file at the given `offset`, extending the file if needed.
  fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

  /// Makes every previous write durable. Nothing written before a successful `sync` may be lost
  /// by a crash.
  fn sync(&mut self) -> io::Result<()>;

  /// Tries locking the file exclusively, failing immediately if another handle holds the lock.
  fn try_lock(&mut self) -> io::Result<()>;

  /// Unlocks the file.
  fn unlock(&mut self) -> io::Result<()>;
}

/// # The primary implementation for [`FileSystem`]
///
/// This is simply a wrapper around [`std::fs`].
#[derive(Debug, Default)]
pub struct StandardFileSystem;

impl FileSystem for StandardFileSystem {
  type Path = path::Path;
  type File = StandardFile;

  fn open(&mut self, path: &Self::Path) -> io::Result<Self::File> {
    let file = fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    Ok(Self::File::from(file))
  }
}

/// # The primary implementation for [`File`]
///
/// This is simply a wrapper around [`std::fs::File`], with advisory locks from `fs2`.
#[derive(Debug)]
pub struct StandardFile(fs::File);

/// Public constructor for [`StandardFile`].
impl From<fs::File> for StandardFile {
  fn from(file: fs::File) -> Self {
    Self(file)
  }
}

impl File for StandardFile {
  fn size(&mut self) -> io::Result<u64> {
    let StandardFile(inner) = self;
    Ok(inner.metadata()?.len())
  }

  fn truncate(&mut self, size: u64) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs::File::set_len(inner, size)
  }

  fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let StandardFile(inner) = self;
    io::Seek::seek(inner, io::SeekFrom::Start(offset))?;
    io::Read::read_exact(inner, buf)
  }

  fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
    let StandardFile(inner) = self;
    io::Seek::seek(inner, io::SeekFrom::Start(offset))?;
    io::Write::write_all(inner, buf)
  }

  fn sync(&mut self) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs::File::sync_all(inner)
  }

  fn try_lock(&mut self) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs2::FileExt::try_lock_exclusive(inner)
  }

  fn unlock(&mut self) -> io::Result<()> {
    let StandardFile(inner) = self;
    fs2::FileExt::unlock(inner)
  }
}

/// A failure injected into a [`MemoryFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
  /// Every write fails.
  Write,
  /// Writes overlapping the given byte range fail; other writes succeed.
  WriteRange(ops::Range<u64>),
  /// Every sync fails.
  Sync,
}

#[derive(Debug, Default)]
struct MemoryFileData {
  data: Vec<u8>,
  durable: Vec<u8>,
  locked: bool,
  fault: Option<Fault>,
}

fn injected(what: &str) -> io::Error {
  io::Error::new(io::ErrorKind::Other, format!("injected {what} failure"))
}

/// In-memory implementation for [`FileSystem`]
///
/// Each file keeps two images: the bytes as last written, and the bytes as of the last `sync`.
/// [`MemoryFileSystem::crash`] throws away everything that was not synced, which is what a power
/// loss does to a real file.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
  files: collections::HashMap<String, sync::Arc<Mutex<MemoryFileData>>>,
}

impl MemoryFileSystem {
  /// Installs (or clears, with `None`) a fault on the file at `path`, affecting open handles too.
  pub fn set_fault(&mut self, path: &str, fault: Option<Fault>) {
    self.files.entry(path.to_string()).or_default().lock().fault = fault;
  }

  /// Simulates a process crash followed by a restart: unsynced writes are lost, locks are
  /// released and faults are cleared.
  pub fn crash(&mut self) {
    for file in self.files.values() {
      let mut file = file.lock();
      file.data = file.durable.clone();
      file.locked = false;
      file.fault = None;
    }
  }

  /// Overwrites bytes of the durable image directly, bypassing any fault. Used to model torn or
  /// corrupted sectors.
  pub fn corrupt(&mut self, path: &str, offset: u64, bytes: &[u8]) {
    let mut guard = self.files.entry(path.to_string()).or_default().lock();
    let file = &mut *guard;
    let offset = offset as usize;
    for image in [&mut file.data, &mut file.durable] {
      if image.len() < offset + bytes.len() {
        image.resize(offset + bytes.len(), 0);
      }
      image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
  }
}

impl FileSystem for MemoryFileSystem {
  type Path = str;
  type File = MemoryFile;

  fn open(&mut self, path: &Self::Path) -> io::Result<Self::File> {
    let file = self.files.entry(path.to_string()).or_default();
    Ok(MemoryFile { file: file.clone() })
  }
}

/// In-memory implementation for [`File`]
///
/// Handles opened from the same [`MemoryFileSystem`] path share their contents.
#[derive(Debug)]
pub struct MemoryFile {
  file: sync::Arc<Mutex<MemoryFileData>>,
}

impl File for MemoryFile {
  fn size(&mut self) -> io::Result<u64> {
    Ok(self.file.lock().data.len() as u64)
  }

  fn truncate(&mut self, size: u64) -> io::Result<()> {
    let size = usize::try_from(size).map_err(|x| io::Error::new(io::ErrorKind::InvalidInput, x))?;
    self.file.lock().data.resize(size, 0);
    Ok(())
  }

  fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let file = self.file.lock();
    let offset = offset as usize;
    if offset + buf.len() > file.data.len() {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file"));
    }
    buf.copy_from_slice(&file.data[offset..offset + buf.len()]);
    Ok(())
  }

  fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
    let mut file = self.file.lock();
    match &file.fault {
      Some(Fault::Write) => return Err(injected("write")),
      Some(Fault::WriteRange(range)) if offset < range.end && range.start < offset + buf.len() as u64 => {
        return Err(injected("write"));
      }
      _ => {}
    }
    let offset = offset as usize;
    if offset + buf.len() > file.data.len() {
      file.data.resize(offset + buf.len(), 0);
    }
    file.data[offset..offset + buf.len()].copy_from_slice(buf);
    Ok(())
  }

  fn sync(&mut self) -> io::Result<()> {
    let mut file = self.file.lock();
    if file.fault == Some(Fault::Sync) {
      return Err(injected("sync"));
    }
    file.durable = file.data.clone();
    Ok(())
  }

  fn try_lock(&mut self) -> io::Result<()> {
    let mut file = self.file.lock();
    if file.locked {
      Err(fs2::lock_contended_error())
    } else {
      file.locked = true;
      Ok(())
    }
  }

  fn unlock(&mut self) -> io::Result<()> {
    let mut file = self.file.lock();
    if file.locked {
      file.locked = false;
      Ok(())
    } else {
      Err(io::Error::new(io::ErrorKind::InvalidInput, "file is not locked"))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile;

  fn test_filesystem_open_existing<F: FileSystem>(fs: &mut F, path: &F::Path) {
    let mut file = fs.open(path).unwrap();
    assert_eq!(file.size().unwrap(), 0);
    file.write(0, b"hello").unwrap();

    let mut file = fs.open(path).unwrap();
    assert_eq!(file.size().unwrap(), 5);
    let mut buf = vec![0; 5];
    file.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
  }

  fn test_file_truncate_and_extend<F: File>(file: &mut F) {
    file.write(0, b"hello").unwrap();
    file.truncate(2).unwrap();
    assert_eq!(file.size().unwrap(), 2);
    file.truncate(8).unwrap();
    assert_eq!(file.size().unwrap(), 8);

    let mut buf = vec![0; 2];
    file.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"he");
  }

  fn test_file_read_write<F: File>(file: &mut F) {
    file.write(0, b"hello").unwrap();
    file.write(4, b"world").unwrap();
    assert_eq!(file.size().unwrap(), 9);

    let mut buf = vec![0; 9];
    file.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hellworld");

    let mut buf = vec![0; 5];
    file.read(6, &mut buf).unwrap_err();
    file.sync().unwrap();
  }

  fn test_file_lock_unlock<F: File>(file1: &mut F, file2: &mut F) {
    // No other access is possible once an exclusive lock is created.
    file1.try_lock().unwrap();
    file2.try_lock().unwrap_err();

    // Once the exclusive lock is dropped, the second file is able to create a lock.
    file1.unlock().unwrap();
    file2.try_lock().unwrap();
    file2.unlock().unwrap();
  }

  #[test]
  fn test_standard_filesystem() {
    let mut fs = StandardFileSystem;
    let tempdir = tempfile::tempdir().unwrap();
    test_filesystem_open_existing(&mut fs, &tempdir.path().join("a"));
  }

  #[test]
  fn test_standard_file() {
    let mut fs = StandardFileSystem;
    let tempdir = tempfile::tempdir().unwrap();
    test_file_truncate_and_extend(&mut fs.open(&tempdir.path().join("a")).unwrap());
    test_file_read_write(&mut fs.open(&tempdir.path().join("b")).unwrap());

    let path = tempdir.path().join("c");
    let mut file1 = fs.open(&path).unwrap();
    let mut file2 = fs.open(&path).unwrap();
    test_file_lock_unlock(&mut file1, &mut file2);
  }

  #[test]
  fn test_memory_filesystem() {
    let mut fs = MemoryFileSystem::default();
    test_filesystem_open_existing(&mut fs, "a");
  }

  #[test]
  fn test_memory_file() {
    let mut fs = MemoryFileSystem::default();
    test_file_truncate_and_extend(&mut fs.open("a").unwrap());
    test_file_read_write(&mut fs.open("b").unwrap());

    let mut file1 = fs.open("c").unwrap();
    let mut file2 = fs.open("c").unwrap();
    test_file_lock_unlock(&mut file1, &mut file2);
  }

  #[test]
  fn test_memory_crash_discards_unsynced_writes() {
    let mut fs = MemoryFileSystem::default();
    let mut file = fs.open("file").unwrap();
    file.write(0, b"durable").unwrap();
    file.sync().unwrap();
    file.write(0, b"lost!!!").unwrap();
    file.write(7, b"tail").unwrap();
    file.try_lock().unwrap();

    fs.crash();
    let mut file = fs.open("file").unwrap();
    assert_eq!(file.size().unwrap(), 7);
    let mut buf = vec![0; 7];
    file.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"durable");
    // The crashed process no longer holds its lock.
    file.try_lock().unwrap();
  }

  #[test]
  fn test_memory_faults() {
    let mut fs = MemoryFileSystem::default();
    let mut file = fs.open("file").unwrap();

    fs.set_fault("file", Some(Fault::WriteRange(0..4)));
    file.write(2, b"xx").unwrap_err();
    file.write(4, b"ok").unwrap();

    fs.set_fault("file", Some(Fault::Sync));
    file.sync().unwrap_err();

    fs.set_fault("file", Some(Fault::Write));
    file.write(100, b"no").unwrap_err();

    fs.set_fault("file", None);
    file.write(0, b"fine").unwrap();
    file.sync().unwrap();
  }

  #[test]
  fn test_memory_corrupt_hits_both_images() {
    let mut fs = MemoryFileSystem::default();
    let mut file = fs.open("file").unwrap();
    file.write(0, b"abcdef").unwrap();
    file.sync().unwrap();
    fs.corrupt("file", 2, b"ZZ");
    fs.crash();

    let mut file = fs.open("file").unwrap();
    let mut buf = vec![0; 6];
    file.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"abZZef");
  }
}
