//! BEP 9 info-dictionary assembly and serving.
//!
//! Before the info dict is known the torrent runs in metadata-only mode:
//! peers announce the metadata size, we allocate a buffer and a have-map in
//! 16 KiB units, and fill it piece by piece. Once every piece is present
//! the buffer is parsed, validated against the info hash and handed to
//! [`set_info_bytes`](super::Torrent::set_info_bytes); afterwards the raw
//! bytes are retained for serving and metainfo re-emission.

use serde_derive::Serialize;

use crate::error::torrent::Result;
use crate::error::TorrentError;
use crate::metainfo::{self, Info, MetaInfo};
use crate::piece::Piece;
use crate::torrent::conns::ConnCommand;
use crate::torrent::Torrent;
use crate::{Bitfield, METADATA_PIECE_LEN, METADATA_SIZE_CAP};

/// The bencoded info dict in flight or at rest, with a have-map in
/// [`METADATA_PIECE_LEN`] units.
pub(crate) struct MetadataBuf {
  pub(crate) buf: Vec<u8>,
  pub(crate) have: Bitfield,
}

impl MetadataBuf {
  /// An empty buffer awaiting `size` bytes.
  fn sized(size: usize) -> Self {
    let mut have = Bitfield::new();
    have.resize(piece_count_for(size), false);
    MetadataBuf {
      buf: vec![0; size],
      have,
    }
  }

  /// A buffer that already holds the complete info dict.
  pub(crate) fn complete(bytes: Vec<u8>) -> Self {
    let mut have = Bitfield::new();
    have.resize(piece_count_for(bytes.len()), true);
    MetadataBuf { buf: bytes, have }
  }

  fn piece_count(&self) -> usize {
    self.have.len()
  }

  fn have_all(&self) -> bool {
    self.have.all()
  }

  /// The expected length of one metadata piece; the last one may be
  /// short.
  fn piece_len(&self, piece: usize) -> usize {
    debug_assert!(piece < self.piece_count());
    if piece == self.piece_count() - 1 {
      self.buf.len() - piece * METADATA_PIECE_LEN
    } else {
      METADATA_PIECE_LEN
    }
  }
}

fn piece_count_for(size: usize) -> usize {
  (size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN
}

/// BEP 9 message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataMsgKind {
  Request = 0,
  Data = 1,
  Reject = 2,
}

/// An extended message ready for the wire: the negotiated `ut_metadata`
/// id plus the bencoded payload (with raw piece bytes appended for data
/// messages).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionMessage {
  pub ext_id: u8,
  pub payload: Vec<u8>,
}

/// The fixed-shape BEP 9 dictionary. Field order matches the canonical
/// bencode key order.
#[derive(Serialize)]
struct MetadataDict {
  msg_type: u8,
  piece: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  total_size: Option<usize>,
}

impl Torrent {
  /// Whether we know how large the info dict is. A zero-length buffer
  /// never exists, so buffer presence is the single source of truth.
  pub fn metadata_size_known(&self) -> bool {
    self.shared.state.lock().metadata.is_some()
  }

  pub fn metadata_size(&self) -> usize {
    self
      .shared
      .state
      .lock()
      .metadata
      .as_ref()
      .map(|m| m.buf.len())
      .unwrap_or(0)
  }

  pub fn metadata_piece_count(&self) -> usize {
    self
      .shared
      .state
      .lock()
      .metadata
      .as_ref()
      .map(|m| m.piece_count())
      .unwrap_or(0)
  }

  /// Reacts to a peer announcing the metadata size.
  pub fn set_metadata_size(&self, size: usize) {
    let mut state = self.shared.state.lock();
    if state.info.is_some() {
      // We already know the correct metadata size.
      return;
    }
    if size == 0 || size > METADATA_SIZE_CAP {
      log::warn!("received bad metadata size: {}", size);
      return;
    }
    if let Some(metadata) = &state.metadata {
      if metadata.buf.len() == size {
        return;
      }
    }
    state.metadata = Some(MetadataBuf::sized(size));
    for conn in &mut state.conns {
      conn.outbox.push(ConnCommand::RequestMetadata);
    }
    let ids: Vec<_> = state.conns.iter().map(|c| c.id).collect();
    for id in ids {
      self.shared.sched.request_metadata(id);
    }
  }

  /// Deposits one received metadata piece. Ignored once the info dict is
  /// known or when the index is outside the have-map.
  pub fn save_metadata_piece(&self, piece: usize, data: &[u8]) {
    let mut state = self.shared.state.lock();
    if state.info.is_some() {
      return;
    }
    let name = state.name();
    let Some(metadata) = &mut state.metadata else {
      log::warn!("{}: ignoring metadata piece {} without a size", name, piece);
      return;
    };
    if piece >= metadata.piece_count() {
      log::warn!("{}: ignoring metadata piece {}", name, piece);
      return;
    }
    let expected = metadata.piece_len(piece);
    if data.len() != expected {
      log::warn!(
        "{}: metadata piece {} has {} bytes, expected {}",
        name,
        piece,
        data.len(),
        expected
      );
    }
    let off = piece * METADATA_PIECE_LEN;
    let n = std::cmp::min(data.len(), metadata.buf.len() - off);
    metadata.buf[off..off + n].copy_from_slice(&data[..n]);
    metadata.have.set(piece, true);
  }

  pub fn have_metadata_piece(&self, piece: usize) -> bool {
    let state = self.shared.state.lock();
    match &state.metadata {
      Some(m) if state.info.is_some() => piece * METADATA_PIECE_LEN < m.buf.len(),
      Some(m) => m.have.get(piece).map(|b| *b).unwrap_or(false),
      None => false,
    }
  }

  pub fn have_all_metadata_pieces(&self) -> bool {
    let state = self.shared.state.lock();
    if state.info.is_some() {
      return true;
    }
    match &state.metadata {
      Some(m) => m.have_all(),
      None => false,
    }
  }

  /// The bytes of one metadata piece for serving to a peer, if present.
  pub fn metadata_piece_data(&self, piece: usize) -> Option<Vec<u8>> {
    let state = self.shared.state.lock();
    let metadata = state.metadata.as_ref()?;
    if piece >= metadata.piece_count() {
      return None;
    }
    if state.info.is_none() && !metadata.have[piece] {
      return None;
    }
    let off = piece * METADATA_PIECE_LEN;
    let len = metadata.piece_len(piece);
    Some(metadata.buf[off..off + len].to_vec())
  }

  /// Called when the complete info dict becomes available, either from
  /// assembled BEP 9 pieces or from a metainfo file.
  ///
  /// Allocates the sealed pieces vector, resets the pending set and
  /// re-initializes every connection's request order, closing connections
  /// whose advertised bitfield contradicts the new piece count.
  pub fn set_info_bytes(&self, bytes: Vec<u8>) -> Result<()> {
    let mut state = self.shared.state.lock();
    if state.info.is_some() {
      return Ok(());
    }
    if metainfo::info_hash(&bytes) != state.info_hash {
      return Err(TorrentError::BadInfoHash);
    }
    let info = Info::from_bytes(&bytes).map_err(|e| {
      log::warn!("bad info: {}", e);
      TorrentError::BadMetadata(e)
    })?;

    let num_pieces = info.num_pieces();
    state.pieces = info.piece_hashes.iter().map(|h| Piece::new(*h)).collect();
    state.pending_pieces.clear();
    state.metadata = Some(MetadataBuf::complete(bytes));
    state.info = Some(info);
    // permutations of a different piece count are useless now
    state.request_order_pool.clear();

    for at in 0..state.conns.len() {
      let order = state.take_request_order(num_pieces);
      let conn = &mut state.conns[at];
      conn.request_order = Some(super::conns::RequestOrder::new(order));
      if !conn.peer_pieces.is_empty() && conn.peer_pieces.len() != num_pieces {
        log::warn!(
          "closing connection {}: bitfield of {} pieces, torrent has {}",
          conn.addr,
          conn.peer_pieces.len(),
          num_pieces
        );
        conn.closing = true;
        conn.outbox.push(ConnCommand::Close);
      }
    }
    drop(state);
    self.shared.event.notify_all();
    Ok(())
  }

  /// Forgets everything learned about the metadata. Used when a trusted
  /// source contradicts what we cached.
  pub fn invalidate_metadata(&self) {
    let mut state = self.shared.state.lock();
    state.metadata = None;
    state.info = None;
    state.pieces.clear();
    state.pending_pieces.clear();
  }

  /// Builds an outbound BEP 9 message under the peer's negotiated
  /// `ut_metadata` extended id.
  pub fn metadata_extension_message(
    &self,
    ext_id: u8,
    kind: MetadataMsgKind,
    piece: usize,
    data: Option<&[u8]>,
  ) -> Result<ExtensionMessage> {
    let dict = MetadataDict {
      msg_type: kind as u8,
      piece,
      total_size: data.map(|_| self.metadata_size()),
    };
    // this dictionary has a fixed shape, so a marshal failure is an
    // internal error rather than something the caller did
    let mut payload = serde_bencode::to_bytes(&dict)
      .map_err(|e| TorrentError::Bencode(e.to_string()))?;
    if let Some(data) = data {
      payload.extend_from_slice(data);
    }
    Ok(ExtensionMessage { ext_id, payload })
  }

  /// A run-time generated metainfo document with the stored info bytes
  /// and the announce-list as currently known.
  pub fn meta_info(&self) -> Result<MetaInfo> {
    let state = self.shared.state.lock();
    if state.info.is_none() {
      return Err(TorrentError::NoMetadata);
    }
    let bytes = state
      .metadata
      .as_ref()
      .map(|m| m.buf.clone())
      .ok_or(TorrentError::NoMetadata)?;
    Ok(MetaInfo::new(bytes, &state.trackers))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;

  use super::*;
  use crate::conf::TorrentConf;
  use crate::metainfo::test_info_bytes;
  use crate::sched::NullScheduler;

  fn test_torrent() -> Torrent {
    Torrent::new([0x22; 20], TorrentConf::default(), Arc::new(NullScheduler))
  }

  fn torrent_for(info_bytes: &[u8]) -> Torrent {
    Torrent::new(
      metainfo::info_hash(info_bytes),
      TorrentConf::default(),
      Arc::new(NullScheduler),
    )
  }

  #[test]
  fn test_metadata_acquisition() {
    let t = test_torrent();
    assert!(!t.metadata_size_known());
    assert!(!t.have_all_metadata_pieces());

    t.set_metadata_size(20_000);
    assert!(t.metadata_size_known());
    assert_eq!(t.metadata_size(), 20_000);
    assert_eq!(t.metadata_piece_count(), 2);

    t.save_metadata_piece(0, &[1; METADATA_PIECE_LEN]);
    assert!(t.have_metadata_piece(0));
    assert!(!t.have_metadata_piece(1));
    assert!(!t.have_all_metadata_pieces());

    // the second piece carries the remaining 20000 - 16384 = 3616 bytes
    t.save_metadata_piece(1, &[2; 3616]);
    assert!(t.have_all_metadata_pieces());

    let piece = t.metadata_piece_data(1).unwrap();
    assert_eq!(piece.len(), 3616);
    assert!(piece.iter().all(|&b| b == 2));
  }

  #[test]
  fn test_set_metadata_size_rejects_out_of_range() {
    let t = test_torrent();
    t.set_metadata_size(0);
    assert!(!t.metadata_size_known());
    t.set_metadata_size(METADATA_SIZE_CAP + 1);
    assert!(!t.metadata_size_known());
  }

  #[test]
  fn test_set_metadata_size_same_size_keeps_progress() {
    let t = test_torrent();
    t.set_metadata_size(20_000);
    t.save_metadata_piece(0, &[1; METADATA_PIECE_LEN]);

    // an identical announcement must not reallocate
    t.set_metadata_size(20_000);
    assert!(t.have_metadata_piece(0));

    // a different one starts over
    t.set_metadata_size(30_000);
    assert!(!t.have_metadata_piece(0));
    assert_eq!(t.metadata_piece_count(), 2);
  }

  #[test]
  fn test_save_metadata_piece_ignores_out_of_range() {
    let t = test_torrent();
    t.set_metadata_size(20_000);
    t.save_metadata_piece(2, &[0; 16]);
    assert!(!t.have_metadata_piece(2));
    assert!(!t.have_all_metadata_pieces());
  }

  #[test]
  fn test_assembled_metadata_becomes_info() {
    let info_bytes = test_info_bytes("meta.bin", 16384, 40_000, None);
    let t = torrent_for(&info_bytes);

    t.set_metadata_size(info_bytes.len());
    let mut off = 0;
    let mut piece = 0;
    while off < info_bytes.len() {
      let end = std::cmp::min(off + METADATA_PIECE_LEN, info_bytes.len());
      t.save_metadata_piece(piece, &info_bytes[off..end]);
      off = end;
      piece += 1;
    }
    assert!(t.have_all_metadata_pieces());

    let assembled: Vec<u8> = (0..t.metadata_piece_count())
      .flat_map(|i| t.metadata_piece_data(i).unwrap())
      .collect();
    assert_eq!(assembled, info_bytes);

    t.set_info_bytes(assembled).unwrap();
    assert!(t.have_info());
    assert_eq!(t.num_pieces(), 3);

    // ignored now that the info dict is parsed
    t.set_metadata_size(5);
    assert_eq!(t.metadata_size(), info_bytes.len());
    t.save_metadata_piece(0, &[0xff; 16]);
    assert_eq!(t.metadata_piece_data(0).unwrap()[..4], info_bytes[..4]);

    // metadata pieces are served from the retained buffer
    assert!(t.have_metadata_piece(0));
    assert!(t.have_all_metadata_pieces());
  }

  #[test]
  fn test_set_info_bytes_rejects_wrong_hash() {
    let info_bytes = test_info_bytes("meta.bin", 16384, 40_000, None);
    let t = test_torrent();
    assert!(matches!(
      t.set_info_bytes(info_bytes),
      Err(TorrentError::BadInfoHash)
    ));
    assert!(!t.have_info());
  }

  #[test]
  fn test_invalidate_metadata() {
    let info_bytes = test_info_bytes("meta.bin", 16384, 40_000, None);
    let t = torrent_for(&info_bytes);
    t.set_info_bytes(info_bytes).unwrap();
    assert!(t.have_info());

    t.invalidate_metadata();
    assert!(!t.have_info());
    assert!(!t.metadata_size_known());
    assert_eq!(t.num_pieces(), 0);
  }

  #[test]
  fn test_metadata_extension_message() {
    let t = test_torrent();
    t.set_metadata_size(20_000);

    // a request carries no payload and no total_size
    let msg = t
      .metadata_extension_message(3, MetadataMsgKind::Request, 1, None)
      .unwrap();
    assert_eq!(msg.ext_id, 3);
    assert_eq!(msg.payload, b"d8:msg_typei0e5:piecei1ee");

    // a data message carries total_size and the raw piece bytes
    let msg = t
      .metadata_extension_message(3, MetadataMsgKind::Data, 0, Some(b"abcd"))
      .unwrap();
    assert_eq!(
      msg.payload,
      b"d8:msg_typei1e5:piecei0e10:total_sizei20000eeabcd".to_vec()
    );

    let msg = t
      .metadata_extension_message(3, MetadataMsgKind::Reject, 2, None)
      .unwrap();
    assert_eq!(msg.payload, b"d8:msg_typei2e5:piecei2ee");
  }

  #[test]
  fn test_meta_info_requires_info() {
    let t = test_torrent();
    assert!(matches!(t.meta_info(), Err(TorrentError::NoMetadata)));

    let info_bytes = test_info_bytes("meta.bin", 16384, 40_000, None);
    let t = torrent_for(&info_bytes);
    t.set_info_bytes(info_bytes.clone()).unwrap();
    let meta = t.meta_info().unwrap();
    assert_eq!(meta.info_bytes, info_bytes);
    let out = meta.to_bytes().unwrap();
    assert!(out.windows(info_bytes.len()).any(|w| w == &info_bytes[..]));
  }
}
