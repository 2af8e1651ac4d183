//! Block devices backing the three page logs.
//!
//! The engine addresses every stream as an array of fixed-size physical
//! pages. A [`PageDevice`] reads and writes whole pages at
//! `page * page_size` and reports a page that was never written as
//! [`io::ErrorKind::UnexpectedEof`].

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Raw page-granular storage.
pub trait PageDevice: fmt::Debug + Send {
    /// Reads physical page `page` into `buf`, which is exactly one page long.
    fn read_page(&mut self, page: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` to physical page `page`.
    fn write_page(&mut self, page: u32, buf: &[u8]) -> io::Result<()>;

    /// Erases physical pages `start..end` before they are reused.
    fn erase(&mut self, start: u32, end: u32) -> io::Result<()> {
        let _ = (start, end);
        Ok(())
    }

    /// Makes previous writes durable.
    fn flush(&mut self) -> io::Result<()>;

    /// Discards every page.
    fn truncate(&mut self) -> io::Result<()>;
}

/// A page device backed by a regular file.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: File,
    sync_on_flush: bool,
}

impl FileDevice {
    /// Opens `path`, creating it if missing. With `reset`, existing contents are discarded.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(reset)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            sync_on_flush: true,
        })
    }

    /// Disables `sync_all` on flush. Writes still reach the OS page cache.
    pub fn without_sync(mut self) -> Self {
        self.sync_on_flush = false;
        self
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageDevice for FileDevice {
    fn read_page(&mut self, page: u32, buf: &mut [u8]) -> io::Result<()> {
        let offset = u64::from(page) * buf.len() as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_page(&mut self, page: u32, buf: &[u8]) -> io::Result<()> {
        let offset = u64::from(page) * buf.len() as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.sync_on_flush {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)
    }
}

/// A page device held entirely in memory.
///
/// Useful for tests and for hosts without a filesystem. The contents can be
/// taken out with [`MemoryDevice::into_inner`] and reopened later with
/// [`MemoryDevice::from_bytes`], which is how a power cycle is simulated.
#[derive(Debug, Default, Clone)]
pub struct MemoryDevice {
    bytes: Vec<u8>,
    erased_pages: u64,
}

impl MemoryDevice {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device holding `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            erased_pages: 0,
        }
    }

    /// Consumes the device and returns its contents.
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of bytes written so far, including gaps.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Total pages passed to [`PageDevice::erase`].
    pub fn erased_pages(&self) -> u64 {
        self.erased_pages
    }
}

impl PageDevice for MemoryDevice {
    fn read_page(&mut self, page: u32, buf: &mut [u8]) -> io::Result<()> {
        let start = page as usize * buf.len();
        let end = start + buf.len();
        let src = self.bytes.get(start..end).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("page {page} is beyond the end of the device"),
            )
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_page(&mut self, page: u32, buf: &[u8]) -> io::Result<()> {
        let start = page as usize * buf.len();
        let end = start + buf.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, start: u32, end: u32) -> io::Result<()> {
        self.erased_pages += u64::from(end.saturating_sub(start));
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.bytes.clear();
        Ok(())
    }
}
