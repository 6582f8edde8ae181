//! File capability consumed by writers, readers and merges
//!
//! Storage backends implement [`FileSystem`]. The engine only needs
//! idempotent directory creation, positional reads, sequential appends,
//! size queries, deletion and atomic rename. [`LocalFileSystem`] is the
//! local-disk backend.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{BundleError, Result};

/// Storage backend
pub trait FileSystem: Send + Sync {
    /// Create `path` and its parents; an existing directory is not an error
    fn create_dir(&self, path: &str) -> Result<()>;

    /// Open `path` for positional reads
    fn open_random_access(&self, path: &str) -> Result<Box<dyn RandomAccessFile>>;

    /// Create (or truncate) `path` for sequential appends
    fn open_writable(&self, path: &str) -> Result<Box<dyn WritableFile>>;

    /// Size of `path` in bytes
    fn file_size(&self, path: &str) -> Result<u64>;

    /// Whether `path` exists
    fn exists(&self, path: &str) -> bool;

    /// Remove `path`
    fn delete_file(&self, path: &str) -> Result<()>;

    /// Atomically rename `src` to `dst`, replacing `dst`
    fn rename(&self, src: &str, dst: &str) -> Result<()>;
}

/// File opened for positional reads
pub trait RandomAccessFile: Send {
    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read; fewer than requested only at end of
    /// file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// File opened for sequential appends
pub trait WritableFile: Send {
    /// Append `data` at the end of the file
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Push appended bytes to the backend
    fn flush(&mut self) -> Result<()>;

    /// Flush, persist and release the file
    fn close(&mut self) -> Result<()>;
}

/// Read exactly `buf.len()` bytes at `offset` or fail with a data-loss error
pub fn read_full(file: &mut dyn RandomAccessFile, offset: u64, buf: &mut [u8]) -> Result<()> {
    let read = file.read_at(offset, buf)?;
    if read == buf.len() {
        Ok(())
    } else {
        Err(BundleError::DataCorruption(format!(
            "requested {} bytes at offset {offset} but read {read} bytes",
            buf.len()
        )))
    }
}

/// Parent directory of a path prefix, if it has one
pub fn dirname(prefix: &str) -> Option<&str> {
    Path::new(prefix)
        .parent()
        .and_then(Path::to_str)
        .filter(|dir| !dir.is_empty())
}

/// Local-disk backend
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Create the local backend
    pub const fn new() -> Self {
        Self
    }
}

impl FileSystem for LocalFileSystem {
    fn create_dir(&self, path: &str) -> Result<()> {
        match std::fs::create_dir_all(path) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn open_random_access(&self, path: &str) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        Ok(Box::new(LocalRandomAccessFile {
            path: PathBuf::from(path),
            file,
        }))
    }

    fn open_writable(&self, path: &str) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(LocalWritableFile { file: Some(file) }))
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        std::fs::rename(src, dst)?;
        Ok(())
    }
}

/// Local file opened for positional reads
struct LocalRandomAccessFile {
    path: PathBuf,
    file: File,
}

impl LocalRandomAccessFile {
    fn read_from(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

impl RandomAccessFile for LocalRandomAccessFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let read = self.read_from(offset, buf)?;
        if read == buf.len() {
            return Ok(read);
        }

        // A writer may still be appending: reopen once and retry the tail
        debug!(
            "Short read of {} ({read}/{} bytes at {offset}), reopening",
            self.path.display(),
            buf.len()
        );
        self.file = File::open(&self.path)?;
        let retried = self.read_from(offset + read as u64, &mut buf[read..])?;
        Ok(read + retried)
    }
}

/// Local file opened for appends
struct LocalWritableFile {
    file: Option<File>,
}

impl LocalWritableFile {
    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(BundleError::BufferClosed)
    }
}

impl WritableFile for LocalWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file()?.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn path_str(dir: &Path, name: &str) -> String {
        dir.join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn test_create_dir_is_idempotent() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let nested = path_str(dir.path(), "a/b/c");
        fs.create_dir(&nested).unwrap();
        fs.create_dir(&nested).unwrap();
        assert!(fs.exists(&nested));
    }

    #[test]
    fn test_append_read_rename_delete() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let src = path_str(dir.path(), "src");
        let dst = path_str(dir.path(), "dst");

        let mut out = fs.open_writable(&src).unwrap();
        out.append(b"hello ").unwrap();
        out.append(b"world").unwrap();
        out.close().unwrap();
        assert!(matches!(out.append(b"!"), Err(BundleError::BufferClosed)));

        fs.rename(&src, &dst).unwrap();
        assert!(!fs.exists(&src));
        assert_eq!(fs.file_size(&dst).unwrap(), 11);

        let mut input = fs.open_random_access(&dst).unwrap();
        let mut buf = [0u8; 5];
        read_full(input.as_mut(), 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let mut long = [0u8; 8];
        assert_eq!(input.read_at(6, &mut long).unwrap(), 5);
        assert!(read_full(input.as_mut(), 6, &mut long).is_err());

        fs.delete_file(&dst).unwrap();
        assert!(fs.delete_file(&dst).is_err());
    }

    #[test]
    fn test_short_read_sees_concurrent_append() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let path = path_str(dir.path(), "growing");

        std::fs::write(&path, b"abc").unwrap();
        let mut input = fs.open_random_access(&path).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"def")
            .unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(input.read_at(0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_dirname() {
        assert_eq!(dirname("/tmp/ckpt/model"), Some("/tmp/ckpt"));
        assert_eq!(dirname("model"), None);
    }
}
