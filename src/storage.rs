use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::{Bitfield, PieceIndex};

/// Byte-addressed access to a torrent's data.
///
/// The torrent core never interprets file boundaries; it reads and writes
/// at absolute offsets and defers the question of which pieces are complete
/// to the backend's oracle.
pub trait Storage: Send + Sync {
  /// Reads into `buf` at the absolute offset. Partial reads are allowed;
  /// a zero return means end of data.
  fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize>;

  /// Writes `buf` at the absolute offset. Must consume the whole buffer
  /// on success.
  fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize>;

  /// Streams `len` bytes starting at `off` into `sink`, returning how
  /// many were copied. Used by hashing so a whole piece never has to be
  /// buffered.
  fn write_section_to(
    &self,
    sink: &mut dyn Write,
    off: u64,
    len: u64,
  ) -> io::Result<u64>;

  /// The authoritative completion oracle. May be expensive.
  fn piece_complete(&self, index: PieceIndex) -> bool;

  /// Invoked once a piece's hash has been verified against the metainfo.
  fn piece_completed(&self, index: PieceIndex) -> io::Result<()>;

  /// Releases backend resources. The default does nothing.
  fn close(&self) {}
}

/// A storage backend keeping everything in one memory buffer.
///
/// Exists for tests and for embedders that want to serve small torrents
/// without touching disk.
pub struct MemoryStorage {
  inner: Mutex<MemoryInner>,
}

struct MemoryInner {
  data: Vec<u8>,
  complete: Bitfield,
}

impl MemoryStorage {
  pub fn new(total_len: u64, piece_count: usize) -> Self {
    let mut complete = Bitfield::new();
    complete.resize(piece_count, false);
    MemoryStorage {
      inner: Mutex::new(MemoryInner {
        data: vec![0; total_len as usize],
        complete,
      }),
    }
  }
}

impl Storage for MemoryStorage {
  fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
    let inner = self.inner.lock();
    let off = off as usize;
    if off >= inner.data.len() {
      return Ok(0);
    }
    let n = std::cmp::min(buf.len(), inner.data.len() - off);
    buf[..n].copy_from_slice(&inner.data[off..off + n]);
    Ok(n)
  }

  fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize> {
    let mut inner = self.inner.lock();
    let off = off as usize;
    if off + buf.len() > inner.data.len() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "write past end of torrent",
      ));
    }
    inner.data[off..off + buf.len()].copy_from_slice(buf);
    Ok(buf.len())
  }

  fn write_section_to(
    &self,
    sink: &mut dyn Write,
    off: u64,
    len: u64,
  ) -> io::Result<u64> {
    let inner = self.inner.lock();
    let off = off as usize;
    if off >= inner.data.len() {
      return Ok(0);
    }
    let n = std::cmp::min(len as usize, inner.data.len() - off);
    sink.write_all(&inner.data[off..off + n])?;
    Ok(n as u64)
  }

  fn piece_complete(&self, index: PieceIndex) -> bool {
    let inner = self.inner.lock();
    inner.complete.get(index).map(|b| *b).unwrap_or(false)
  }

  fn piece_completed(&self, index: PieceIndex) -> io::Result<()> {
    let mut inner = self.inner.lock();
    if index >= inner.complete.len() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "piece index out of range",
      ));
    }
    inner.complete.set(index, true);
    Ok(())
  }
}

/// A storage backend over a single flat file.
///
/// Piece completion lives in memory only; a restarted client is expected to
/// re-hash.
pub struct FileStorage {
  file: Mutex<File>,
  total_len: u64,
  complete: Mutex<Bitfield>,
}

impl FileStorage {
  /// Opens the file in create, read, and write modes and sizes it to the
  /// torrent length.
  pub fn new(
    path: &Path,
    total_len: u64,
    piece_count: usize,
  ) -> io::Result<Self> {
    log::trace!("Opening and creating file {:?}", path);
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .read(true)
      .open(path)
      .map_err(|e| {
        log::warn!("Failed to open file {:?}", path);
        e
      })?;
    file.set_len(total_len)?;
    let mut complete = Bitfield::new();
    complete.resize(piece_count, false);
    Ok(FileStorage {
      file: Mutex::new(file),
      total_len,
      complete: Mutex::new(complete),
    })
  }
}

impl Storage for FileStorage {
  fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
    if off >= self.total_len {
      return Ok(0);
    }
    let mut file = self.file.lock();
    file.seek(SeekFrom::Start(off))?;
    let want = std::cmp::min(buf.len() as u64, self.total_len - off) as usize;
    let mut read = 0;
    while read < want {
      match file.read(&mut buf[read..want]) {
        Ok(0) => break,
        Ok(n) => read += n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e),
      }
    }
    Ok(read)
  }

  fn write_at(&self, buf: &[u8], off: u64) -> io::Result<usize> {
    if off + buf.len() as u64 > self.total_len {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "write past end of torrent",
      ));
    }
    let mut file = self.file.lock();
    file.seek(SeekFrom::Start(off))?;
    file.write_all(buf)?;
    Ok(buf.len())
  }

  fn write_section_to(
    &self,
    sink: &mut dyn Write,
    off: u64,
    len: u64,
  ) -> io::Result<u64> {
    if off >= self.total_len {
      return Ok(0);
    }
    let len = std::cmp::min(len, self.total_len - off);
    let mut file = self.file.lock();
    file.seek(SeekFrom::Start(off))?;
    let mut section = std::io::Read::by_ref(&mut *file).take(len);
    let copied = io::copy(&mut section, sink)?;
    Ok(copied)
  }

  fn piece_complete(&self, index: PieceIndex) -> bool {
    self.complete.lock().get(index).map(|b| *b).unwrap_or(false)
  }

  fn piece_completed(&self, index: PieceIndex) -> io::Result<()> {
    let mut complete = self.complete.lock();
    if index >= complete.len() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "piece index out of range",
      ));
    }
    complete.set(index, true);
    Ok(())
  }
}
