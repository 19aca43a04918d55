//! Maintains the state of one torrent within a client: piece and chunk
//! accounting, metadata acquisition, reader-driven demand, and connection
//! bookkeeping.
//!
//! All torrent fields live behind one state mutex paired with one event
//! condvar; readers block on the condvar and every piece completion
//! broadcasts on it. The only other blocking points are the per-piece
//! write barriers and storage IO, neither of which is entered with the
//! state lock held.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use url::Url;

pub mod conns;
pub mod metadata;
pub mod stats;

pub use conns::{Conn, ConnCommand, ConnId, Peer, PeerSource};
pub use metadata::{ExtensionMessage, MetadataMsgKind};
pub use stats::TorrentStats;

use crate::blockinfo::{
  block_count, block_for_offset, block_index_spec, region_pieces, BlockInfo,
};
use crate::conf::{HashErrorPolicy, TorrentConf};
use crate::error::torrent::Result;
use crate::error::TorrentError;
use crate::feed::PieceStateFeed;
use crate::metainfo::Info;
use crate::piece::{Piece, PiecePriority, PieceState};
use crate::reader::ReaderShared;
use crate::sched::Scheduler;
use crate::storage::Storage;
use crate::{Bitfield, InfoHash, PieceIndex, Sha1Hash, BLOCK_LEN};

/// One run of consecutive pieces sharing the same state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PieceStateRun {
  pub state: PieceState,
  pub len: usize,
}

impl PieceStateRun {
  /// Produces the small status rendering of a run:
  /// `<count><priority-char><H?><P?><C?>`.
  pub fn status_chars(&self) -> String {
    let mut out = format!("{}", self.len);
    out.push_str(self.state.priority.status_char());
    if self.state.checking {
      out.push('H');
    }
    if self.state.partial {
      out.push('P');
    }
    if self.state.complete {
      out.push('C');
    }
    out
  }
}

pub(crate) struct Shared {
  pub(crate) state: Mutex<TorrentState>,
  /// Broadcast on every piece completion and on close; the condvar every
  /// blocked reader waits on.
  pub(crate) event: Condvar,
  pub(crate) sched: Arc<dyn Scheduler>,
  pub(crate) conf: TorrentConf,
}

pub(crate) struct TorrentState {
  pub(crate) info_hash: InfoHash,
  pub(crate) display_name: Option<String>,
  /// The info dict. None if we don't have it (yet).
  pub(crate) info: Option<Info>,
  /// One entry per piece, allocated and sealed when the info dict
  /// arrives.
  pub(crate) pieces: Vec<Piece>,
  /// Piece indices explicitly requested by the application, distinct
  /// from reader-driven demand.
  pub(crate) pending_pieces: HashSet<PieceIndex>,
  pub(crate) metadata: Option<metadata::MetadataBuf>,
  pub(crate) readers: BTreeMap<u64, Arc<ReaderShared>>,
  pub(crate) next_reader_id: u64,
  /// Active peer connections, running message stream loops.
  pub(crate) conns: Vec<Conn>,
  pub(crate) next_conn_id: ConnId,
  /// Addresses with a dial in flight. Half-open until all handshakes
  /// complete, and never overlapping with `conns`.
  pub(crate) half_open: HashSet<SocketAddr>,
  /// Reserve of peers to connect to. May overlap with active
  /// connections so reconnects to well-known peers are encouraged.
  pub(crate) peers: HashMap<(IpAddr, u16), Peer>,
  /// Tracker URLs mirrored from the announce-list, tier by tier.
  pub(crate) trackers: Vec<Vec<Url>>,
  pub(crate) feed: PieceStateFeed,
  pub(crate) storage: Option<Arc<dyn Storage>>,
  pub(crate) closing: bool,
  /// Set when no more network activity is desired; announcing and peer
  /// traffic stop but local reads may still drain.
  pub(crate) ceasing_networking: bool,
  pub(crate) stats: TorrentStats,
  /// Free list of request-order permutations recycled from closed
  /// connections.
  pub(crate) request_order_pool: Vec<Vec<PieceIndex>>,
}

impl TorrentState {
  pub(crate) fn have_info(&self) -> bool {
    self.info.is_some()
  }

  pub(crate) fn num_pieces(&self) -> usize {
    self.info.as_ref().map(|i| i.num_pieces()).unwrap_or(0)
  }

  pub(crate) fn length(&self) -> u64 {
    self.info.as_ref().map(|i| i.total_len).unwrap_or(0)
  }

  pub(crate) fn usual_piece_size(&self) -> u32 {
    self.info.as_ref().map(|i| i.piece_len).unwrap_or(0)
  }

  /// The length of the given piece; only the last piece may be short.
  pub(crate) fn piece_length(&self, piece: PieceIndex) -> u32 {
    let Some(info) = &self.info else { return 0 };
    if piece + 1 == info.num_pieces() {
      let rem = info.total_len % info.piece_len as u64;
      if rem != 0 {
        return rem as u32;
      }
    }
    info.piece_len
  }

  /// The working name: the info name, a display name given such as by
  /// the dn value in a magnet link, or the hex info hash.
  pub(crate) fn name(&self) -> String {
    if let Some(info) = &self.info {
      return info.name.clone();
    }
    if let Some(name) = &self.display_name {
      return name.clone();
    }
    hex::encode(self.info_hash)
  }

  /// Out-of-range indices read as complete so requests past the end are
  /// never scheduled.
  pub(crate) fn piece_complete(&self, piece: PieceIndex) -> bool {
    if piece >= self.num_pieces() {
      return true;
    }
    match &self.storage {
      Some(storage) => storage.piece_complete(piece),
      None => false,
    }
  }

  pub(crate) fn piece_num_chunks(&self, piece: PieceIndex) -> usize {
    block_count(self.piece_length(piece))
  }

  fn num_pending_chunks(&self, piece: PieceIndex) -> usize {
    self.piece_num_chunks(piece) - self.pieces[piece].num_dirty_blocks()
  }

  fn piece_num_pending_bytes(&self, piece: PieceIndex) -> u64 {
    if self.piece_complete(piece) {
      return 0;
    }
    let piece_len = self.piece_length(piece);
    let mut bytes = piece_len as u64;
    for index in self.pieces[piece].dirty_blocks.iter_ones() {
      bytes -= block_index_spec(index, piece_len).1 as u64;
    }
    bytes
  }

  fn piece_partially_downloaded(&self, piece: PieceIndex) -> bool {
    let pending = self.piece_num_pending_bytes(piece);
    pending != 0 && pending != self.piece_length(piece) as u64
  }

  /// The request containing the absolute offset, if any.
  pub(crate) fn offset_request(&self, off: u64) -> Option<BlockInfo> {
    let info = self.info.as_ref()?;
    block_for_offset(info.total_len, info.piece_len, off)
  }

  pub(crate) fn request_offset(&self, block: &BlockInfo) -> u64 {
    block.torrent_offset(self.usual_piece_size())
  }

  pub(crate) fn have_chunk(&self, block: &BlockInfo) -> bool {
    if !self.have_info() {
      return false;
    }
    if self.piece_complete(block.piece_index) {
      return true;
    }
    let Some(piece) = self.pieces.get(block.piece_index) else {
      return false;
    };
    if piece.is_checking() {
      return false;
    }
    !piece.pending_block(block.offset)
  }

  pub(crate) fn want_piece(&self, index: PieceIndex) -> bool {
    if !self.have_info() || index >= self.pieces.len() {
      return false;
    }
    if self.pieces[index].is_checking() {
      return false;
    }
    if self.pending_pieces.contains(&index) {
      return true;
    }
    if self.piece_complete(index) {
      return false;
    }
    self.reader_wants_piece(index)
  }

  fn reader_wants_piece(&self, index: PieceIndex) -> bool {
    let piece_len = self.usual_piece_size();
    let num_pieces = self.num_pieces();
    for reader in self.readers.values() {
      let readahead = reader.readahead();
      for (off, len) in reader.reads() {
        let (begin, end) =
          region_pieces(off, len + readahead, piece_len, num_pieces);
        if begin <= index && index < end {
          return true;
        }
      }
    }
    false
  }

  /// The urgency of a piece as implied by in-flight reads and the
  /// pending set.
  fn demand_priority(&self, index: PieceIndex) -> PiecePriority {
    let piece_len = self.usual_piece_size();
    let num_pieces = self.num_pieces();
    let mut best = PiecePriority::None;
    for reader in self.readers.values() {
      let readahead = reader.readahead();
      for (off, len) in reader.reads() {
        let begin = (off / piece_len as u64) as PieceIndex;
        if index == begin {
          return PiecePriority::Now;
        }
        let (_, read_end) = region_pieces(off, len, piece_len, num_pieces);
        let (_, ahead_end) =
          region_pieces(off, len + readahead, piece_len, num_pieces);
        if index > begin && index < read_end {
          best = std::cmp::max(best, PiecePriority::Next);
        } else if index >= read_end && index < ahead_end {
          best = std::cmp::max(best, PiecePriority::Readahead);
        }
      }
    }
    if best == PiecePriority::None && self.pending_pieces.contains(&index) {
      best = PiecePriority::Normal;
    }
    best
  }

  pub(crate) fn piece_state(&self, index: PieceIndex) -> PieceState {
    let complete = self.piece_complete(index);
    let Some(piece) = self.pieces.get(index) else {
      return PieceState {
        complete,
        ..PieceState::default()
      };
    };
    PieceState {
      priority: if complete {
        PiecePriority::None
      } else {
        self.demand_priority(index)
      },
      checking: piece.is_checking(),
      partial: !complete && self.piece_partially_downloaded(index),
      complete,
    }
  }

  /// Publishes the piece's state iff it differs from the last published
  /// one, then updates the cache.
  pub(crate) fn publish_piece_change(&mut self, index: PieceIndex) {
    let cur = self.piece_state(index);
    let Some(piece) = self.pieces.get_mut(index) else {
      return;
    };
    if cur != piece.public_state {
      piece.public_state = cur;
      self.feed.publish(index);
    }
  }

  pub(crate) fn conn_mut(&mut self, id: ConnId) -> Option<&mut Conn> {
    self.conns.iter_mut().find(|c| c.id == id)
  }

  /// A request-order permutation, from the free list when possible.
  pub(crate) fn take_request_order(
    &mut self,
    num_pieces: usize,
  ) -> Vec<PieceIndex> {
    if let Some(perm) = self.request_order_pool.pop() {
      debug_assert_eq!(perm.len(), num_pieces);
      self.stats.piece_priorities_reused += 1;
      return perm;
    }
    self.stats.piece_priorities_new += 1;
    let mut perm: Vec<PieceIndex> = (0..num_pieces).collect();
    perm.shuffle(&mut rand::thread_rng());
    perm
  }
}

/// A cheaply clonable handle on one torrent's state.
#[derive(Clone)]
pub struct Torrent {
  pub(crate) shared: Arc<Shared>,
}

impl Torrent {
  pub fn new(
    info_hash: InfoHash,
    conf: TorrentConf,
    sched: Arc<dyn Scheduler>,
  ) -> Self {
    Torrent {
      shared: Arc::new(Shared {
        state: Mutex::new(TorrentState {
          info_hash,
          display_name: None,
          info: None,
          pieces: Vec::new(),
          pending_pieces: HashSet::new(),
          metadata: None,
          readers: BTreeMap::new(),
          next_reader_id: 0,
          conns: Vec::new(),
          next_conn_id: 0,
          half_open: HashSet::new(),
          peers: HashMap::new(),
          trackers: Vec::new(),
          feed: PieceStateFeed::default(),
          storage: None,
          closing: false,
          ceasing_networking: false,
          stats: TorrentStats::default(),
          request_order_pool: Vec::new(),
        }),
        event: Condvar::new(),
        sched,
        conf,
      }),
    }
  }

  pub fn info_hash(&self) -> InfoHash {
    self.shared.state.lock().info_hash
  }

  pub fn set_display_name(&self, name: impl Into<String>) {
    self.shared.state.lock().display_name = Some(name.into());
  }

  pub fn name(&self) -> String {
    self.shared.state.lock().name()
  }

  /// Installs the storage backend, closing any previous one.
  pub fn set_storage(&self, storage: Arc<dyn Storage>) {
    let mut state = self.shared.state.lock();
    if let Some(old) = state.storage.take() {
      old.close();
    }
    state.storage = Some(storage);
  }

  pub fn set_trackers(&self, trackers: Vec<Vec<Url>>) {
    self.shared.state.lock().trackers = trackers;
  }

  /// The announce-list reconstructed from the tracker tiers.
  pub fn announce_list(&self) -> Vec<Vec<String>> {
    let state = self.shared.state.lock();
    state
      .trackers
      .iter()
      .map(|tier| tier.iter().map(|t| t.to_string()).collect())
      .collect()
  }

  pub fn subscribe_piece_changes(&self) -> Receiver<PieceIndex> {
    self.shared.state.lock().feed.subscribe()
  }

  pub fn have_info(&self) -> bool {
    self.shared.state.lock().have_info()
  }

  /// Total length of the torrent in bytes; None before metadata.
  pub fn length(&self) -> Option<u64> {
    let state = self.shared.state.lock();
    state.info.as_ref().map(|i| i.total_len)
  }

  pub fn num_pieces(&self) -> usize {
    self.shared.state.lock().num_pieces()
  }

  pub fn piece_length(&self, piece: PieceIndex) -> Option<u32> {
    let state = self.shared.state.lock();
    if !state.have_info() || piece >= state.num_pieces() {
      return None;
    }
    Some(state.piece_length(piece))
  }

  pub fn usual_piece_size(&self) -> u32 {
    self.shared.state.lock().usual_piece_size()
  }

  pub fn last_piece_size(&self) -> u32 {
    let state = self.shared.state.lock();
    match state.num_pieces() {
      0 => 0,
      n => state.piece_length(n - 1),
    }
  }

  pub fn piece_complete(&self, piece: PieceIndex) -> bool {
    self.shared.state.lock().piece_complete(piece)
  }

  pub fn have_piece(&self, piece: PieceIndex) -> bool {
    let state = self.shared.state.lock();
    state.have_info() && state.piece_complete(piece)
  }

  pub fn have_all_pieces(&self) -> bool {
    let state = self.shared.state.lock();
    if !state.have_info() {
      return false;
    }
    (0..state.num_pieces()).all(|i| state.piece_complete(i))
  }

  pub fn have_any_pieces(&self) -> bool {
    let state = self.shared.state.lock();
    (0..state.num_pieces()).any(|i| state.piece_complete(i))
  }

  pub fn num_pieces_completed(&self) -> usize {
    let state = self.shared.state.lock();
    (0..state.num_pieces())
      .filter(|i| state.piece_complete(*i))
      .count()
  }

  /// One bit of completion per piece.
  pub fn bitfield(&self) -> Bitfield {
    let state = self.shared.state.lock();
    (0..state.num_pieces())
      .map(|i| state.piece_complete(i))
      .collect()
  }

  /// Bytes still missing across all pieces; None before metadata.
  pub fn bytes_left(&self) -> Option<u64> {
    let state = self.shared.state.lock();
    if !state.have_info() {
      return None;
    }
    Some(
      (0..state.num_pieces())
        .map(|i| state.piece_num_pending_bytes(i))
        .sum(),
    )
  }

  pub fn piece_num_pending_bytes(&self, piece: PieceIndex) -> u64 {
    self.shared.state.lock().piece_num_pending_bytes(piece)
  }

  pub fn piece_num_chunks(&self, piece: PieceIndex) -> usize {
    self.shared.state.lock().piece_num_chunks(piece)
  }

  pub fn num_pending_chunks(&self, piece: PieceIndex) -> usize {
    self.shared.state.lock().num_pending_chunks(piece)
  }

  /// Whether the networking layer should acquire this piece at all.
  pub fn want_piece(&self, piece: PieceIndex) -> bool {
    self.shared.state.lock().want_piece(piece)
  }

  /// Whether the chunk is worth requesting right now.
  pub fn want_chunk(&self, block: &BlockInfo) -> bool {
    let state = self.shared.state.lock();
    if !state.want_piece(block.piece_index) {
      return false;
    }
    state.pieces[block.piece_index].pending_block(block.offset)
  }

  pub fn have_chunk(&self, block: &BlockInfo) -> bool {
    self.shared.state.lock().have_chunk(block)
  }

  /// Enforces the request validity rule: aligned begin, at most one
  /// block long, inside the piece, and short only at the piece boundary.
  pub fn valid_outgoing_request(&self, block: &BlockInfo) -> bool {
    let state = self.shared.state.lock();
    if block.piece_index >= state.num_pieces() {
      return false;
    }
    if block.offset % BLOCK_LEN != 0 {
      return false;
    }
    if block.len > BLOCK_LEN {
      return false;
    }
    let piece_len = state.piece_length(block.piece_index);
    if block.offset + block.len > piece_len {
      return false;
    }
    block.len == BLOCK_LEN || block.offset + block.len == piece_len
  }

  /// The request containing the absolute byte offset, if the torrent has
  /// metadata and the offset is in range.
  pub fn offset_request(&self, off: u64) -> Option<BlockInfo> {
    self.shared.state.lock().offset_request(off)
  }

  pub fn request_offset(&self, block: &BlockInfo) -> u64 {
    self.shared.state.lock().request_offset(block)
  }

  /// The chunks of the piece still worth requesting.
  pub fn pending_chunks(&self, piece: PieceIndex) -> Vec<BlockInfo> {
    let state = self.shared.state.lock();
    if piece >= state.pieces.len() {
      return Vec::new();
    }
    let piece_len = state.piece_length(piece);
    (0..state.piece_num_chunks(piece))
      .filter(|i| state.pieces[piece].pending_block_index(*i))
      .map(|i| {
        let (offset, len) = block_index_spec(i, piece_len);
        BlockInfo {
          piece_index: piece,
          offset,
          len,
        }
      })
      .collect()
  }

  /// Pending chunks in random order, so simultaneous peers spread over
  /// the piece instead of racing for its head.
  pub fn pending_chunks_shuffled(&self, piece: PieceIndex) -> Vec<BlockInfo> {
    let mut chunks = self.pending_chunks(piece);
    chunks.shuffle(&mut rand::thread_rng());
    chunks
  }

  /// Adds the piece to the explicit demand set and notifies the
  /// scheduler. A no-op for pieces we already have.
  pub fn pend_piece(&self, piece: PieceIndex) {
    let mut state = self.shared.state.lock();
    if state.have_info() && state.piece_complete(piece) {
      return;
    }
    state.pending_pieces.insert(piece);
    state.publish_piece_change(piece);
    self.shared.sched.missing_piece(piece);
  }

  pub fn pending_pieces(&self) -> BTreeSet<PieceIndex> {
    self
      .shared
      .state
      .lock()
      .pending_pieces
      .iter()
      .copied()
      .collect()
  }

  /// Re-marks every chunk of the piece as pending.
  pub fn pend_all_chunks(&self, piece: PieceIndex) {
    let mut state = self.shared.state.lock();
    if let Some(p) = state.pieces.get_mut(piece) {
      p.pend_all_blocks();
      state.publish_piece_change(piece);
    }
  }

  /// Writes a chunk's bytes into storage at the piece-relative offset,
  /// verifying the full length went in. This is only the storage leg of
  /// the deposit; [`receive_chunk`](Self::receive_chunk) is the full
  /// operation the networking layer calls.
  pub fn write_chunk(
    &self,
    piece: PieceIndex,
    begin: u32,
    data: &[u8],
  ) -> Result<()> {
    let (storage, off) = {
      let state = self.shared.state.lock();
      let info = state.info.as_ref().ok_or(TorrentError::NoMetadata)?;
      let storage = state.storage.clone().ok_or(TorrentError::NoStorage)?;
      let off = piece as u64 * info.piece_len as u64 + begin as u64;
      (storage, off)
    };
    let written = storage.write_at(data, off)?;
    if written != data.len() {
      return Err(TorrentError::ShortWrite {
        written,
        expected: data.len(),
      });
    }
    Ok(())
  }

  /// Deposits a chunk received from a peer: validates the request, marks
  /// the chunk dirty, raises the piece's write barrier around the
  /// storage write, and queues a hash check when the piece has no chunk
  /// left to fetch.
  ///
  /// Returns whether a hash check was queued. The data slice is only
  /// borrowed for the duration of the call.
  pub fn receive_chunk(&self, block: &BlockInfo, data: &[u8]) -> Result<bool> {
    if data.len() != block.len as usize {
      return Err(TorrentError::InvalidRequest(*block));
    }
    if !self.valid_outgoing_request(block) {
      return Err(TorrentError::InvalidRequest(*block));
    }

    let barrier = {
      let mut state = self.shared.state.lock();
      if state.closing {
        return Err(TorrentError::Closed);
      }
      let index = block.index_in_piece();
      let piece = &mut state.pieces[block.piece_index];
      piece.unpend_block_index(index);
      let barrier = Arc::clone(&piece.writes);
      barrier.begin_write();
      state.publish_piece_change(block.piece_index);
      barrier
    };

    // the state lock is not held across storage IO; the barrier alone
    // orders this write against the next hash attempt
    let result = self.write_chunk(block.piece_index, block.offset, data);
    barrier.finish_write();

    let mut state = self.shared.state.lock();
    if let Err(e) = result {
      // the bytes never landed, so the chunk is still wanted
      let index = block.index_in_piece();
      let piece = &mut state.pieces[block.piece_index];
      piece.dirty_blocks.set(index, false);
      state.publish_piece_change(block.piece_index);
      return Err(e);
    }

    let piece = &state.pieces[block.piece_index];
    let all_dirty =
      piece.num_dirty_blocks() == state.piece_num_chunks(block.piece_index);
    if all_dirty && !piece.is_checking() {
      drop(state);
      return Ok(self.queue_piece_check(block.piece_index));
    }
    Ok(false)
  }

  /// Flags the piece for hashing. Returns false when it already is.
  pub fn queue_piece_check(&self, piece: PieceIndex) -> bool {
    let mut state = self.shared.state.lock();
    let Some(p) = state.pieces.get_mut(piece) else {
      return false;
    };
    if p.is_checking() {
      return false;
    }
    p.queued_for_hash = true;
    state.publish_piece_change(piece);
    true
  }

  /// Runs one queued hash check: waits out pending writes, streams the
  /// piece through SHA-1 via the storage backend, and applies the
  /// verdict. Returns whether the piece verified.
  ///
  /// A match hands the piece to the storage completion hook and
  /// completes it; a mismatch re-pends every chunk. A storage error is
  /// surfaced or swallowed into a zeroed digest according to
  /// [`HashErrorPolicy`].
  pub fn verify_piece(&self, piece: PieceIndex) -> Result<bool> {
    let (barrier, storage, off, len, expected) = {
      let mut state = self.shared.state.lock();
      if piece >= state.pieces.len() {
        return Err(TorrentError::InvalidPieceIndex(piece));
      }
      let storage = state.storage.clone().ok_or(TorrentError::NoStorage)?;
      let off = piece as u64 * state.usual_piece_size() as u64;
      let len = state.piece_length(piece) as u64;
      let p = &mut state.pieces[piece];
      p.queued_for_hash = false;
      p.hashing = true;
      let barrier = Arc::clone(&p.writes);
      let expected = p.hash;
      state.publish_piece_change(piece);
      (barrier, storage, off, len, expected)
    };

    // every signaled chunk write is durably visible once the barrier
    // drains; only then is the section read coherent
    barrier.wait_no_writes();

    let sum = match self.hash_section(storage.as_ref(), off, len) {
      Ok(sum) => sum,
      Err(e) => match self.shared.conf.hash_on_read_error {
        HashErrorPolicy::ZeroHash => {
          log::warn!("error hashing piece {}: {}", piece, e);
          [0u8; 20]
        }
        HashErrorPolicy::Surface => {
          let mut state = self.shared.state.lock();
          let p = &mut state.pieces[piece];
          p.hashing = false;
          state.publish_piece_change(piece);
          return Err(e);
        }
      },
    };

    let correct = sum == expected;
    if correct {
      if let Err(e) = storage.piece_completed(piece) {
        log::warn!("storage rejected completed piece {}: {}", piece, e);
      }
    }

    let mut state = self.shared.state.lock();
    {
      let p = &mut state.pieces[piece];
      p.hashing = false;
      p.ever_hashed = true;
    }
    if correct {
      self.completed_piece_locked(&mut state, piece);
    } else {
      log::warn!("piece {} failed hash check", piece);
      state.pieces[piece].pend_all_blocks();
      state.publish_piece_change(piece);
    }
    Ok(correct)
  }

  /// Streams `len` bytes at `off` through SHA-1. Short sections are IO
  /// errors; the caller decides what a failed read means.
  fn hash_section(
    &self,
    storage: &dyn Storage,
    off: u64,
    len: u64,
  ) -> Result<Sha1Hash> {
    struct HashWriter<'a>(&'a mut Sha1);
    impl Write for HashWriter<'_> {
      fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
      }
      fn flush(&mut self) -> io::Result<()> {
        Ok(())
      }
    }

    let mut hasher = Sha1::new();
    let n = storage.write_section_to(&mut HashWriter(&mut hasher), off, len)?;
    if n != len {
      return Err(TorrentError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("hashed {} of {} bytes", n, len),
      )));
    }
    let mut sum = [0u8; 20];
    sum.copy_from_slice(&hasher.finalize());
    Ok(sum)
  }

  /// Marks a piece as verified-complete: drops it from the pending set,
  /// publishes the change, wakes every blocked reader, queues `Have` to
  /// each connection, withdraws in-flight requests for the piece and
  /// removes it from each connection's request order.
  pub fn completed_piece(&self, piece: PieceIndex) {
    let mut state = self.shared.state.lock();
    self.completed_piece_locked(&mut state, piece);
  }

  fn completed_piece_locked(&self, state: &mut TorrentState, piece: PieceIndex) {
    state.pending_pieces.remove(&piece);
    state.publish_piece_change(piece);
    // the same condvar every reader waits on: each of them re-evaluates
    // its readable predicate at least once
    self.shared.event.notify_all();
    for conn in &mut state.conns {
      conn.outbox.push(ConnCommand::Have(piece));
      let cancelled: Vec<BlockInfo> = conn
        .requests
        .iter()
        .filter(|r| r.piece_index == piece)
        .copied()
        .collect();
      for block in cancelled {
        conn.requests.remove(&block);
        conn.outbox.push(ConnCommand::Cancel(block));
      }
      if let Some(order) = &mut conn.request_order {
        order.delete_piece(piece);
      }
      self.shared.sched.rekindle_upload(conn.id);
    }
  }

  /// Re-evaluates demand after a reader moved or a piece was pended.
  pub fn priorities_changed(&self) {
    let state = self.shared.state.lock();
    self.priorities_changed_locked(&state);
  }

  pub(crate) fn priorities_changed_locked(&self, state: &TorrentState) {
    self.shared.sched.open_new_conns();
    for conn in &state.conns {
      self.shared.sched.replenish_requests(conn.id);
    }
  }

  /// Reads whatever is available, first waiting out pending writes on
  /// every overlapping piece. Maps an early end of data to
  /// `UnexpectedEof` so callers can distinguish "not yet" from "done".
  pub(crate) fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
    let (barriers, storage, length) = {
      let state = self.shared.state.lock();
      let storage = state
        .storage
        .clone()
        .ok_or_else(|| io::Error::from(TorrentError::NoStorage))?;
      let (begin, end) = region_pieces(
        off,
        buf.len() as u64,
        state.usual_piece_size().max(1),
        state.num_pieces(),
      );
      let barriers: Vec<_> = (begin..end)
        .filter_map(|i| state.pieces.get(i).map(|p| Arc::clone(&p.writes)))
        .collect();
      (barriers, storage, state.length())
    };
    for barrier in barriers {
      barrier.wait_no_writes();
    }
    let n = storage.read_at(buf, off)?;
    if n == 0 && !buf.is_empty() && off < length {
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "torrent data not yet available",
      ));
    }
    Ok(n)
  }

  /// For every in-flight read, the per-chunk requests whose bytes are
  /// still missing: the list a scheduler must satisfy first.
  pub fn reader_blocking_requests(&self) -> Vec<BlockInfo> {
    let state = self.shared.state.lock();
    let mut out = Vec::new();
    for reader in state.readers.values() {
      for (mut off, mut len) in reader.reads() {
        while len > 0 {
          let Some(req) = state.offset_request(off) else {
            break;
          };
          if !state.have_chunk(&req) {
            out.push(req);
          }
          let next_off = state.request_offset(&req) + req.len as u64;
          len = len.saturating_sub(next_off - off);
          off = next_off;
        }
      }
    }
    out
  }

  pub fn readers_blocked_on_reads(&self) -> bool {
    !self.reader_blocking_requests().is_empty()
  }

  /// Pieces some reader wants (readahead included) but we don't have.
  pub fn reader_missing_pieces(&self) -> BTreeSet<PieceIndex> {
    let state = self.shared.state.lock();
    let mut out = BTreeSet::new();
    let piece_len = state.usual_piece_size();
    if piece_len == 0 {
      return out;
    }
    let num_pieces = state.num_pieces();
    for reader in state.readers.values() {
      let readahead = reader.readahead();
      for (off, len) in reader.reads() {
        let (begin, end) =
          region_pieces(off, len + readahead, piece_len, num_pieces);
        for i in begin..end {
          if !state.piece_complete(i) {
            out.insert(i);
          }
        }
      }
    }
    out
  }

  pub fn piece_state(&self, piece: PieceIndex) -> PieceState {
    self.shared.state.lock().piece_state(piece)
  }

  /// Run-length encodes the state of every piece in index order.
  pub fn piece_state_runs(&self) -> Vec<PieceStateRun> {
    let state = self.shared.state.lock();
    let mut runs: Vec<PieceStateRun> = Vec::new();
    for index in 0..state.num_pieces() {
      let piece_state = state.piece_state(index);
      match runs.last_mut() {
        Some(run) if run.state == piece_state => run.len += 1,
        _ => runs.push(PieceStateRun {
          state: piece_state,
          len: 1,
        }),
      }
    }
    runs
  }

  /// Renders the torrent's status for a text endpoint.
  pub fn write_status(&self, w: &mut dyn Write) -> io::Result<()> {
    {
      let state = self.shared.state.lock();
      writeln!(w, "Infohash: {}", hex::encode(state.info_hash))?;
      writeln!(
        w,
        "Metadata length: {}",
        state.metadata.as_ref().map(|m| m.buf.len()).unwrap_or(0)
      )?;
      if !state.have_info() {
        write!(w, "Metadata have: ")?;
        if let Some(metadata) = &state.metadata {
          for have in metadata.have.iter() {
            write!(w, "{}", if *have { 'H' } else { '.' })?;
          }
        }
        writeln!(w)?;
        writeln!(w, "Piece length: ?")?;
      } else {
        writeln!(w, "Piece length: {}", state.usual_piece_size())?;
        writeln!(w, "Num Pieces: {}", state.num_pieces())?;
      }
    }
    if self.have_info() {
      write!(w, "Piece States:")?;
      for run in self.piece_state_runs() {
        write!(w, " {}", run.status_chars())?;
      }
      writeln!(w)?;
    }
    write!(w, "Urgent:")?;
    for req in self.reader_blocking_requests() {
      write!(w, " {}", req)?;
    }
    writeln!(w)?;
    {
      let state = self.shared.state.lock();
      write!(w, "Trackers: ")?;
      for tier in &state.trackers {
        for tracker in tier {
          write!(w, "{:?} ", tracker.as_str())?;
        }
      }
      writeln!(w)?;
      writeln!(w, "Pending peers: {}", state.peers.len())?;
      writeln!(w, "Half open: {}", state.half_open.len())?;
      writeln!(w, "Active peers: {}", state.conns.len())?;
    }
    let order = self.worst_conns_order();
    let state = self.shared.state.lock();
    for (i, id) in order.iter().enumerate() {
      if let Some(conn) = state.conns.iter().find(|c| c.id == *id) {
        writeln!(
          w,
          "{:2}. {} unwanted:{} useful:{} reqs:{} age:{}s",
          i + 1,
          conn.addr,
          conn.unwanted_chunks_received,
          conn.useful_chunks_received,
          conn.requests.len(),
          conn.completed_handshake.elapsed().as_secs(),
        )?;
      }
    }
    Ok(())
  }

  /// Stops announcing and peer traffic. Idempotent: connections are
  /// closed only once.
  pub fn cease_networking(&self) {
    let mut state = self.shared.state.lock();
    if state.ceasing_networking {
      return;
    }
    state.ceasing_networking = true;
    state.half_open.clear();
    for conn in &mut state.conns {
      if !conn.closing {
        conn.closing = true;
        conn.outbox.push(ConnCommand::Close);
      }
    }
  }

  /// Shuts the torrent down: quiesces networking, closes storage and the
  /// piece-state feed, then shuts the closing gate and wakes every
  /// blocked reader so they fail with a torrent-closed error.
  pub fn close(&self) {
    if self.is_closed() {
      return;
    }
    self.cease_networking();
    let mut state = self.shared.state.lock();
    if state.closing {
      return;
    }
    if let Some(storage) = &state.storage {
      storage.close();
    }
    state.feed.close();
    state.closing = true;
    drop(state);
    self.shared.event.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closing
  }
}

#[cfg(test)]
mod tests {
  use std::net::{Ipv4Addr, SocketAddr};

  use pretty_assertions::assert_eq;
  use sha1::{Digest, Sha1};

  use super::*;
  use crate::metainfo::{info_hash, test_info_bytes};
  use crate::sched::NullScheduler;
  use crate::storage::MemoryStorage;

  fn piece_hashes(content: &[u8], piece_len: u32) -> Vec<Sha1Hash> {
    content
      .chunks(piece_len as usize)
      .map(|piece| {
        let digest = Sha1::digest(piece);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
      })
      .collect()
  }

  fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
  }

  /// A torrent with metadata set and an empty in-memory storage.
  fn test_torrent(content: &[u8], piece_len: u32) -> Torrent {
    let hashes = piece_hashes(content, piece_len);
    let bytes = test_info_bytes(
      "test.bin",
      piece_len,
      content.len() as u64,
      Some(&hashes),
    );
    let t = Torrent::new(
      info_hash(&bytes),
      TorrentConf::default(),
      Arc::new(NullScheduler),
    );
    t.set_storage(Arc::new(MemoryStorage::new(
      content.len() as u64,
      hashes.len(),
    )));
    t.set_info_bytes(bytes).unwrap();
    t
  }

  fn deliver_piece(t: &Torrent, content: &[u8], piece: PieceIndex) {
    let piece_len = t.piece_length(piece).unwrap();
    let start = piece as usize * t.usual_piece_size() as usize;
    for block in t.pending_chunks(piece) {
      let begin = start + block.offset as usize;
      let queued = t
        .receive_chunk(&block, &content[begin..begin + block.len as usize])
        .unwrap();
      let last = block.offset + block.len == piece_len;
      assert_eq!(queued, last);
    }
  }

  #[test]
  fn test_write_then_hash() {
    let content = content(16384 + 1000);
    let t = test_torrent(&content, 16384);
    assert_eq!(t.num_pieces(), 2);
    assert_eq!(t.bytes_left(), Some(17384));

    deliver_piece(&t, &content, 0);
    assert!(!t.piece_complete(0));
    assert_eq!(t.piece_num_pending_bytes(0), 16384);

    assert!(t.verify_piece(0).unwrap());
    assert!(t.piece_complete(0));
    // pending bytes drop to zero only once the oracle reports complete
    assert_eq!(t.piece_num_pending_bytes(0), 0);
    assert_eq!(t.bytes_left(), Some(1000));

    deliver_piece(&t, &content, 1);
    assert!(t.verify_piece(1).unwrap());
    assert!(t.have_all_pieces());
    assert_eq!(t.bytes_left(), Some(0));
    assert_eq!(t.bitfield().count_ones(), 2);
  }

  #[test]
  fn test_hash_mismatch_repends_chunks() {
    let content = content(16384 * 2);
    let t = test_torrent(&content, 16384);

    let block = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: 16384,
    };
    // deliver garbage instead of the real bytes
    assert!(t.receive_chunk(&block, &[0x5a; 16384]).unwrap());
    assert!(!t.verify_piece(0).unwrap());
    assert!(!t.piece_complete(0));
    // the chunk is wanted again
    assert_eq!(t.pending_chunks(0), vec![block]);
    assert_eq!(t.piece_num_pending_bytes(0), 16384);
  }

  #[test]
  fn test_checking_piece_wants_no_chunks() {
    let content = content(16384 * 2);
    let t = test_torrent(&content, 16384);

    let block = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: 16384,
    };
    t.pend_piece(0);
    assert!(t.want_piece(0));
    assert!(t.want_chunk(&block));

    t.receive_chunk(&block, &content[..16384]).unwrap();
    // now queued for hash
    assert!(!t.want_piece(0));
    assert!(!t.want_chunk(&block));
    assert!(!t.have_chunk(&block));
    assert_eq!(t.pending_chunks(0), Vec::new());

    t.verify_piece(0).unwrap();
    assert!(t.have_chunk(&block));
    // complete now, so no longer wanted and gone from the pending set
    assert!(!t.want_piece(0));
    assert!(t.pending_pieces().is_empty());
  }

  #[test]
  fn test_valid_outgoing_request() {
    let content = content(32768 + 10000);
    let t = test_torrent(&content, 32768);

    let ok = |piece_index, offset, len| {
      t.valid_outgoing_request(&BlockInfo {
        piece_index,
        offset,
        len,
      })
    };

    assert!(ok(0, 0, BLOCK_LEN));
    assert!(ok(0, BLOCK_LEN, BLOCK_LEN));
    // misaligned begin
    assert!(!ok(0, 1, BLOCK_LEN));
    // too long
    assert!(!ok(0, 0, BLOCK_LEN + 1));
    // short but not at the piece boundary
    assert!(!ok(0, 0, 100));
    // the tail piece is 10000 bytes: one short chunk
    assert!(ok(1, 0, 10000));
    assert!(!ok(1, 0, BLOCK_LEN));
    // past the last piece
    assert!(!ok(2, 0, BLOCK_LEN));
  }

  #[test]
  fn test_offset_request_round_trip() {
    let content = content(100_000);
    let t = test_torrent(&content, 32768);

    let req = t.offset_request(40_000).unwrap();
    assert_eq!(
      req,
      BlockInfo {
        piece_index: 1,
        offset: 0,
        len: BLOCK_LEN,
      }
    );
    assert_eq!(t.request_offset(&req), 32768);
    assert_eq!(t.offset_request(t.request_offset(&req)), Some(req));

    assert_eq!(t.offset_request(100_000), None);
  }

  #[test]
  fn test_reader_demand_drives_want_piece() {
    let content = content(32768 * 4);
    let t = test_torrent(&content, 32768);

    // reader A reads at offset 0 with no readahead, reader B at piece 2
    // with one piece of readahead
    let a = t.new_reader();
    let b = t.new_reader();
    a.set_readahead(0);
    b.set_readahead(32768);
    a.shared().insert_read(0, 1);
    b.shared().insert_read(2 * 32768, 1);

    assert!(t.want_piece(0));
    assert!(!t.want_piece(1));
    assert!(t.want_piece(2));
    assert!(t.want_piece(3));

    // explicit pending overrides reader silence
    t.pend_piece(1);
    assert!(t.want_piece(1));

    // priorities follow the reads
    assert_eq!(t.piece_state(0).priority, PiecePriority::Now);
    assert_eq!(t.piece_state(1).priority, PiecePriority::Normal);
    assert_eq!(t.piece_state(2).priority, PiecePriority::Now);
    assert_eq!(t.piece_state(3).priority, PiecePriority::Readahead);
  }

  #[test]
  fn test_reader_blocking_requests_walk_missing_chunks() {
    let content = content(32768 * 2);
    let t = test_torrent(&content, 32768);

    let r = t.new_reader();
    r.shared().insert_read(0, 32768 + 1);

    let urgent = t.reader_blocking_requests();
    assert_eq!(
      urgent,
      vec![
        BlockInfo {
          piece_index: 0,
          offset: 0,
          len: BLOCK_LEN
        },
        BlockInfo {
          piece_index: 0,
          offset: BLOCK_LEN,
          len: BLOCK_LEN
        },
        BlockInfo {
          piece_index: 1,
          offset: 0,
          len: BLOCK_LEN
        },
      ]
    );
    assert!(t.readers_blocked_on_reads());
    assert_eq!(
      t.reader_missing_pieces().into_iter().collect::<Vec<_>>(),
      vec![0, 1]
    );

    // delivering the first chunk shrinks the urgent list
    let first = urgent[0];
    t.receive_chunk(&first, &content[..BLOCK_LEN as usize])
      .unwrap();
    let urgent = t.reader_blocking_requests();
    assert_eq!(urgent.len(), 2);
    assert_eq!(urgent[0].offset, BLOCK_LEN);
  }

  #[test]
  fn test_completed_piece_updates_connections() {
    let content = content(32768 * 2);
    let t = test_torrent(&content, 32768);
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 6881);
    let conn = t.add_connection(addr).unwrap();

    let block = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: BLOCK_LEN,
    };
    t.record_request(conn, block);
    t.pend_piece(0);

    t.completed_piece(0);

    assert!(t.pending_pieces().is_empty());
    let outbox = t.drain_outbox(conn);
    assert!(outbox.contains(&ConnCommand::Have(0)));
    assert!(outbox.contains(&ConnCommand::Cancel(block)));
    // the request order no longer offers piece 0
    {
      let state = t.shared.state.lock();
      let order = state.conns[0].request_order.as_ref().unwrap();
      assert!(!order.contains(0));
      assert!(order.contains(1));
    }
    // and the wanted view of the order follows demand
    assert_eq!(t.conn_request_order(conn), Vec::new());
    t.pend_piece(1);
    assert_eq!(t.conn_request_order(conn), vec![1]);
  }

  #[test]
  fn test_piece_state_runs() {
    let content = content(32768 * 4);
    let t = test_torrent(&content, 32768);

    // complete the first two pieces through the oracle
    {
      let state = t.shared.state.lock();
      let storage = state.storage.clone().unwrap();
      storage.piece_completed(0).unwrap();
      storage.piece_completed(1).unwrap();
    }
    // make the last piece partial
    let block = BlockInfo {
      piece_index: 3,
      offset: 0,
      len: BLOCK_LEN,
    };
    t.receive_chunk(&block, &content[3 * 32768..][..BLOCK_LEN as usize])
      .unwrap();

    let runs = t.piece_state_runs();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].len, 2);
    assert!(runs[0].state.complete);
    assert_eq!(runs[0].status_chars(), "2C");
    assert_eq!(runs[1].len, 1);
    assert_eq!(runs[1].status_chars(), "1");
    assert_eq!(runs[2].len, 1);
    assert!(runs[2].state.partial);
    assert_eq!(runs[2].status_chars(), "1P");
  }

  #[test]
  fn test_piece_change_published_only_on_change() {
    let content = content(32768 * 2);
    let t = test_torrent(&content, 32768);
    let events = t.subscribe_piece_changes();

    assert!(t.queue_piece_check(0));
    assert_eq!(events.try_recv(), Ok(0));

    // re-queueing changes nothing and publishes nothing
    assert!(!t.queue_piece_check(0));
    assert!(events.try_recv().is_err());

    // a direct publish with an unchanged state is suppressed
    t.shared.state.lock().publish_piece_change(0);
    assert!(events.try_recv().is_err());
  }

  #[test]
  fn test_short_write_surfaces_and_repends() {
    struct ShortStorage;
    impl Storage for ShortStorage {
      fn read_at(&self, _buf: &mut [u8], _off: u64) -> io::Result<usize> {
        Ok(0)
      }
      fn write_at(&self, buf: &[u8], _off: u64) -> io::Result<usize> {
        Ok(buf.len() / 2)
      }
      fn write_section_to(
        &self,
        _sink: &mut dyn Write,
        _off: u64,
        _len: u64,
      ) -> io::Result<u64> {
        Ok(0)
      }
      fn piece_complete(&self, _index: PieceIndex) -> bool {
        false
      }
      fn piece_completed(&self, _index: PieceIndex) -> io::Result<()> {
        Ok(())
      }
    }

    let content = content(32768);
    let hashes = piece_hashes(&content, 32768);
    let bytes = test_info_bytes("short.bin", 32768, 32768, Some(&hashes));
    let t = Torrent::new(
      info_hash(&bytes),
      TorrentConf::default(),
      Arc::new(NullScheduler),
    );
    t.set_storage(Arc::new(ShortStorage));
    t.set_info_bytes(bytes).unwrap();

    let block = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: BLOCK_LEN,
    };
    let err = t.receive_chunk(&block, &content[..BLOCK_LEN as usize]);
    assert!(matches!(err, Err(TorrentError::ShortWrite { .. })));
    // the failed chunk is pending again
    assert!(t.pending_chunks(0).contains(&block));
  }

  #[test]
  fn test_cease_networking_is_idempotent() {
    let content = content(32768);
    let t = test_torrent(&content, 32768);
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 6881);
    let conn = t.add_connection(addr).unwrap();

    t.cease_networking();
    t.cease_networking();
    let closes = t
      .drain_outbox(conn)
      .into_iter()
      .filter(|c| *c == ConnCommand::Close)
      .count();
    assert_eq!(closes, 1);

    // no new dials or connections while quiescing
    assert!(!t.add_half_open(addr));
    assert!(t.add_connection(addr).is_err());
  }

  #[test]
  fn test_close_sequence() {
    let content = content(32768);
    let t = test_torrent(&content, 32768);
    let events = t.subscribe_piece_changes();

    assert!(!t.is_closed());
    t.close();
    assert!(t.is_closed());
    // the feed disconnected its subscribers
    assert!(matches!(
      events.try_recv(),
      Err(std::sync::mpsc::TryRecvError::Disconnected)
    ));
    // closing again is a no-op
    t.close();
    // depositing chunks now fails
    let block = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: BLOCK_LEN,
    };
    assert!(matches!(
      t.receive_chunk(&block, &content[..BLOCK_LEN as usize]),
      Err(TorrentError::Closed)
    ));
  }

  #[test]
  fn test_write_status_renders() {
    let content = content(32768 * 2);
    let t = test_torrent(&content, 32768);
    t.set_trackers(vec![vec![Url::parse(
      "http://tracker.example/announce",
    )
    .unwrap()]]);

    let mut out = Vec::new();
    t.write_status(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Infohash: "));
    assert!(text.contains("Piece length: 32768"));
    assert!(text.contains("Num Pieces: 2"));
    assert!(text.contains("Piece States: 2"));
    assert!(text.contains("tracker.example"));
    assert!(text.contains("Active peers: 0"));
  }

  #[test]
  fn test_status_before_metadata() {
    let t = Torrent::new(
      [0x33; 20],
      TorrentConf::default(),
      Arc::new(NullScheduler),
    );
    t.set_metadata_size(20_000);
    t.save_metadata_piece(0, &[0; 16384]);

    let mut out = Vec::new();
    t.write_status(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Metadata length: 20000"));
    assert!(text.contains("Metadata have: H."));
    assert!(text.contains("Piece length: ?"));
  }
}
