use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Bitfield, Sha1Hash, BLOCK_LEN};

/// Piece priority describes the importance of obtaining a particular piece.
///
/// Derived from reader demand and the pending set; see
/// [`Torrent::piece_state`](crate::torrent::Torrent::piece_state).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PiecePriority {
  /// Not wanted.
  #[default]
  None,
  /// Wanted.
  Normal,
  /// May be required soon.
  Readahead,
  /// Succeeds a piece where a read occurred.
  Next,
  /// A read occurred in this piece.
  Now,
}

impl PiecePriority {
  /// The single-character rendering used in piece-state runs.
  pub fn status_char(&self) -> &'static str {
    match self {
      PiecePriority::None => "",
      PiecePriority::Normal => ".",
      PiecePriority::Readahead => "R",
      PiecePriority::Next => "N",
      PiecePriority::Now => "!",
    }
  }
}

/// The publicly observable state of a piece, computed on demand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PieceState {
  pub priority: PiecePriority,
  /// The piece is queued for hashing or being hashed right now.
  pub checking: bool,
  /// Some but not all blocks have been written since the last hash.
  pub partial: bool,
  /// The storage oracle reports the piece as complete.
  pub complete: bool,
}

/// Counts storage writes that a pending hash of the piece must observe.
///
/// Each piece owns its own mutex + condvar pair so that hashing one piece
/// does not wake on every write to any other.
#[derive(Debug, Default)]
pub struct WriteBarrier {
  pending: Mutex<usize>,
  no_writes: Condvar,
}

impl WriteBarrier {
  /// Registers a write the next hash attempt must wait for. Call before
  /// issuing the write to storage.
  pub fn begin_write(&self) {
    *self.pending.lock() += 1;
  }

  /// Marks a registered write as durably visible, waking waiters when the
  /// count reaches zero.
  pub fn finish_write(&self) {
    let mut pending = self.pending.lock();
    debug_assert!(*pending > 0);
    *pending -= 1;
    if *pending == 0 {
      self.no_writes.notify_all();
    }
  }

  /// Blocks until every registered write has finished.
  pub fn wait_no_writes(&self) {
    let mut pending = self.pending.lock();
    while *pending != 0 {
      self.no_writes.wait(&mut pending);
    }
  }

  #[cfg(test)]
  pub(crate) fn pending_count(&self) -> usize {
    *self.pending.lock()
  }
}

/// One entry per piece index of the torrent.
///
/// The dirty-block map is a request-scheduling hint only; whether a piece is
/// complete is decided by the storage oracle.
pub struct Piece {
  /// The completed piece SHA-1 hash, from the metainfo "pieces" field.
  pub hash: Sha1Hash,
  /// Blocks dirtied since the last piece hash, grown lazily up to the
  /// highest written block index. An unwritten tail block is pending.
  pub(crate) dirty_blocks: Bitfield,
  pub(crate) hashing: bool,
  pub(crate) queued_for_hash: bool,
  pub(crate) ever_hashed: bool,
  /// The last state published to subscribers, used to suppress no-op
  /// piece-state events.
  pub(crate) public_state: PieceState,
  /// Shared with in-flight write and hash attempts, which must not hold
  /// the torrent state lock while blocking on it.
  pub(crate) writes: Arc<WriteBarrier>,
}

impl Piece {
  pub fn new(hash: Sha1Hash) -> Self {
    Piece {
      hash,
      dirty_blocks: Bitfield::new(),
      hashing: false,
      queued_for_hash: false,
      ever_hashed: false,
      public_state: PieceState::default(),
      writes: Arc::new(WriteBarrier::default()),
    }
  }

  /// The piece is queued for hashing or being hashed right now.
  pub fn is_checking(&self) -> bool {
    self.hashing || self.queued_for_hash
  }

  /// Whether any hash attempt ever ran to the end on this piece.
  pub fn ever_hashed(&self) -> bool {
    self.ever_hashed
  }

  /// Whether the block at `index` still needs to be requested.
  ///
  /// Nothing is pending while the piece is checking; requesting into a
  /// piece that is about to be verified would only produce unwanted
  /// chunks.
  pub fn pending_block_index(&self, index: usize) -> bool {
    if self.is_checking() {
      return false;
    }
    if index >= self.dirty_blocks.len() {
      // never written
      return true;
    }
    !self.dirty_blocks[index]
  }

  /// Whether the block spanning `(offset, len)` within the piece still
  /// needs to be requested.
  pub fn pending_block(&self, offset: u32) -> bool {
    self.pending_block_index((offset / BLOCK_LEN) as usize)
  }

  /// Marks the block at `index` as written since the last hash, growing
  /// the map as needed. Idempotent.
  pub fn unpend_block_index(&mut self, index: usize) {
    if self.dirty_blocks.len() <= index {
      self.dirty_blocks.resize(index + 1, false);
    }
    self.dirty_blocks.set(index, true);
  }

  /// Forgets all dirty blocks, making every block pending again. Used
  /// after a failed hash check.
  pub fn pend_all_blocks(&mut self) {
    self.dirty_blocks.clear();
  }

  pub fn num_dirty_blocks(&self) -> usize {
    self.dirty_blocks.count_ones()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use pretty_assertions::assert_eq;

  use super::*;

  const HASH: Sha1Hash = [0xab; 20];

  #[test]
  fn test_unpend_is_idempotent_and_lazy() {
    let mut p = Piece::new(HASH);
    assert_eq!(p.dirty_blocks.len(), 0);
    assert!(p.pending_block_index(0));
    assert!(p.pending_block_index(7));

    p.unpend_block_index(2);
    // the map grew only as far as needed
    assert_eq!(p.dirty_blocks.len(), 3);
    assert!(p.pending_block_index(0));
    assert!(p.pending_block_index(1));
    assert!(!p.pending_block_index(2));
    assert!(p.pending_block_index(3));
    assert_eq!(p.num_dirty_blocks(), 1);

    p.unpend_block_index(2);
    p.unpend_block_index(2);
    assert_eq!(p.num_dirty_blocks(), 1);

    p.unpend_block_index(0);
    assert_eq!(p.num_dirty_blocks(), 2);

    p.pend_all_blocks();
    assert_eq!(p.num_dirty_blocks(), 0);
    assert!(p.pending_block_index(2));
  }

  #[test]
  fn test_nothing_pending_while_checking() {
    let mut p = Piece::new(HASH);
    p.unpend_block_index(0);
    assert!(p.pending_block_index(1));

    p.queued_for_hash = true;
    assert!(!p.pending_block_index(1));
    assert!(!p.pending_block(BLOCK_LEN));

    p.queued_for_hash = false;
    p.hashing = true;
    assert!(!p.pending_block_index(1));

    p.hashing = false;
    assert!(p.pending_block_index(1));
  }

  #[test]
  fn test_pending_block_maps_offset_to_index() {
    let mut p = Piece::new(HASH);
    p.unpend_block_index(1);
    assert!(p.pending_block(0));
    assert!(!p.pending_block(BLOCK_LEN));
    assert!(!p.pending_block(BLOCK_LEN + 5));
  }

  #[test]
  fn test_write_barrier_blocks_until_drained() {
    let barrier = Arc::new(WriteBarrier::default());
    barrier.begin_write();
    barrier.begin_write();

    let waiter = {
      let barrier = Arc::clone(&barrier);
      std::thread::spawn(move || {
        barrier.wait_no_writes();
      })
    };

    barrier.finish_write();
    assert_eq!(barrier.pending_count(), 1);
    // one write still outstanding, the waiter must still be blocked
    std::thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished());

    barrier.finish_write();
    waiter.join().unwrap();
    assert_eq!(barrier.pending_count(), 0);

    // an empty barrier never blocks
    barrier.wait_no_writes();
  }
}
