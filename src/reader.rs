//! A seekable, blocking byte stream over a torrent's data.
//!
//! Reads block until the backing bytes are verified (or merely written,
//! in responsive mode), so an application can start consuming a torrent
//! while it downloads. Every in-flight read is registered with the
//! torrent and becomes urgent demand: the scheduler fetches those pieces
//! first, and the readahead window extends the wanted region past the
//! read's end.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TorrentError;
use crate::torrent::{Torrent, TorrentState};

/// The reader state the torrent inspects when computing demand: the
/// in-flight reads and the readahead distance. Has its own locks so
/// registration never contends with the torrent state mutex.
pub(crate) struct ReaderShared {
  reads: Mutex<ReadSet>,
  readahead: AtomicU64,
}

struct ReadSet {
  next_token: u64,
  entries: BTreeMap<u64, (u64, u64)>,
}

impl ReaderShared {
  fn new(readahead: u64) -> Self {
    ReaderShared {
      reads: Mutex::new(ReadSet {
        next_token: 0,
        entries: BTreeMap::new(),
      }),
      readahead: AtomicU64::new(readahead),
    }
  }

  pub(crate) fn readahead(&self) -> u64 {
    self.readahead.load(Ordering::Relaxed)
  }

  /// Snapshot of the in-flight `(offset, len)` pairs.
  pub(crate) fn reads(&self) -> Vec<(u64, u64)> {
    self.reads.lock().entries.values().copied().collect()
  }

  pub(crate) fn insert_read(&self, off: u64, len: u64) -> u64 {
    let mut reads = self.reads.lock();
    let token = reads.next_token;
    reads.next_token += 1;
    reads.entries.insert(token, (off, len));
    token
  }

  pub(crate) fn remove_read(&self, token: u64) {
    self.reads.lock().entries.remove(&token);
  }
}

/// Accesses torrent data as a blocking [`Read`]/[`Seek`] stream.
///
/// Dropping the reader (or calling [`close`](Reader::close)) removes it
/// from the torrent's reader set, with its demand.
pub struct Reader {
  torrent: Torrent,
  id: u64,
  shared: Arc<ReaderShared>,
  responsive: AtomicBool,
  pos: Mutex<u64>,
}

impl Torrent {
  /// Registers a new reader at position zero with the configured default
  /// readahead.
  pub fn new_reader(&self) -> Reader {
    let shared = Arc::new(ReaderShared::new(self.shared.conf.default_readahead));
    let mut state = self.shared.state.lock();
    let id = state.next_reader_id;
    state.next_reader_id += 1;
    state.readers.insert(id, Arc::clone(&shared));
    Reader {
      torrent: self.clone(),
      id,
      shared,
      responsive: AtomicBool::new(false),
      pos: Mutex::new(0),
    }
  }
}

impl Reader {
  /// Don't wait for pieces to complete and be verified. Read calls
  /// return as soon as the relevant chunks are written.
  ///
  /// The bytes handed out may later fail their piece hash and be
  /// re-fetched; only use this when the consumer tolerates bad data,
  /// e.g. media players that resynchronize.
  pub fn set_responsive(&self) {
    self.responsive.store(true, Ordering::Relaxed);
  }

  /// Configures the number of bytes ahead of a read that should also be
  /// prioritized in preparation for further reads.
  pub fn set_readahead(&self, readahead: u64) {
    self.shared.readahead.store(readahead, Ordering::Relaxed);
  }

  #[cfg(test)]
  pub(crate) fn shared(&self) -> &ReaderShared {
    &self.shared
  }

  /// Removes the reader from the torrent's reader set, withdrawing its
  /// demand. Dropping the reader does the same.
  pub fn close(&self) {
    let mut state = self.torrent.shared.state.lock();
    state.readers.remove(&self.id);
  }

  fn readable(&self, state: &TorrentState, off: u64) -> bool {
    if state.closing {
      return true;
    }
    if !state.have_info() {
      return false;
    }
    let Some(req) = state.offset_request(off) else {
      // past the end; the read will observe EOF
      return true;
    };
    if self.responsive.load(Ordering::Relaxed) {
      return state.have_chunk(&req);
    }
    state.piece_complete(req.piece_index)
  }

  /// One blocking read attempt: registers the range as urgent, waits
  /// until it is readable, then reads whatever the storage has.
  fn read_at_once(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
    let token = self.shared.insert_read(off, buf.len() as u64);
    let result = self.read_at_blocking(buf, off);
    self.shared.remove_read(token);
    result
  }

  fn read_at_blocking(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
    loop {
      {
        let mut state = self.torrent.shared.state.lock();
        while !self.readable(&state, off) {
          // make sure the scheduler knows these bytes are wanted now
          self.torrent.priorities_changed_locked(&state);
          self.torrent.shared.event.wait(&mut state);
        }
        if state.closing {
          return Err(TorrentError::Closed.into());
        }
      }
      // the state lock is released during the actual read; pending
      // writes are drained inside
      match self.torrent.read_at(buf, off) {
        // zero without an error only happens at the end of the torrent
        Ok(n) => return Ok(n),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
          // data disappeared in the gap (or never landed); wait again
          continue;
        }
        Err(e) => return Err(e),
      }
    }
  }

  /// Reads into the whole buffer, blocking per missing range, stopping
  /// early only at end of torrent or on a real error. Does not move the
  /// stream position.
  pub fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
      let n1 = self.read_at_once(&mut buf[n..], off + n as u64)?;
      if n1 == 0 {
        break;
      }
      n += n1;
    }
    Ok(n)
  }
}

impl Read for Reader {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let mut pos = self.pos.lock();
    let n = self.read_at_once(buf, *pos)?;
    *pos += n as u64;
    Ok(n)
  }
}

impl Seek for Reader {
  /// Moves the stream position and signals the scheduler so piece
  /// selection reconsiders the new neighborhood. Seeking from the end
  /// requires metadata.
  fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
    let mut pos = self.pos.lock();
    let new_pos = match from {
      SeekFrom::Start(off) => off as i128,
      SeekFrom::Current(delta) => *pos as i128 + delta as i128,
      SeekFrom::End(delta) => {
        let length = self
          .torrent
          .length()
          .ok_or_else(|| io::Error::from(TorrentError::NoMetadata))?;
        length as i128 + delta as i128
      }
    };
    if new_pos < 0 {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "seek before start of torrent",
      ));
    }
    *pos = new_pos as u64;
    drop(pos);
    self.torrent.priorities_changed();
    Ok(new_pos as u64)
  }
}

impl Drop for Reader {
  fn drop(&mut self) {
    self.close();
  }
}
