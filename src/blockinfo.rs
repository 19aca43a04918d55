use std::fmt;

use crate::{PieceIndex, BLOCK_LEN};

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a content. Downloading torrents happen at this block level
/// granularity.
///
/// This triple is also what goes out on the wire in a request message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
  /// The index of the piece of which this is a block.
  pub piece_index: PieceIndex,
  /// The zero-based byte offset into the piece.
  pub offset: u32,
  /// The block's length in bytes.
  /// Always 16 KiB (0x4000 bytes) or less, for now.
  pub len: u32,
}

impl BlockInfo {
  /// Returns the index of the block within its piece, assuming the default
  /// block length of 16 KiB.
  pub fn index_in_piece(&self) -> usize {
    // we need to use "lower than or equal" as this may be the last block
    // in which case it may be shorter than the default block length.
    debug_assert!(self.len <= BLOCK_LEN);
    debug_assert!(self.len > 0);
    (self.offset / BLOCK_LEN) as usize
  }

  /// The absolute offset of the block's first byte within the torrent.
  pub fn torrent_offset(&self, piece_len: u32) -> u64 {
    self.piece_index as u64 * piece_len as u64 + self.offset as u64
  }
}

impl fmt::Display for BlockInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "(piece: {} offset: {} len: {})",
      self.piece_index, self.offset, self.len
    )
  }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the last
/// returned value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed
/// the piece length.
pub fn block_len(piece_len: u32, block_index: usize) -> u32 {
  let block_index = block_index as u32;
  let block_offset = block_index * BLOCK_LEN;
  assert!(piece_len > block_offset);
  std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the block at the index in a piece of the given length, that is,
/// its `(offset, len)` pair within the piece.
///
/// Only the last block of a piece may be short; all others are exactly
/// [`BLOCK_LEN`] long.
pub fn block_index_spec(block_index: usize, piece_len: u32) -> (u32, u32) {
  (block_index as u32 * BLOCK_LEN, block_len(piece_len, block_index))
}

/// Returns the number of blocks in a piece of the given length.
pub fn block_count(piece_len: u32) -> usize {
  // all but the last piece are a multiple of the block length, but the last
  // piece may be shorter so we need to account for this by rounding up
  // before dividing to get the number of blocks in piece.
  (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the `begin..end` range of piece indices overlapping the byte
/// region `[off, off + len)`, clamped to the torrent's piece count.
pub fn region_pieces(
  off: u64,
  len: u64,
  piece_len: u32,
  piece_count: usize,
) -> (PieceIndex, PieceIndex) {
  debug_assert!(piece_len > 0);
  let piece_len = piece_len as u64;
  let begin = (off / piece_len) as PieceIndex;
  let end = std::cmp::min(
    piece_count,
    ((off + len + piece_len - 1) / piece_len) as PieceIndex,
  );
  (begin, std::cmp::max(begin, end).min(piece_count))
}

/// Returns the unique block whose byte range contains the absolute torrent
/// offset `off`, or `None` when `off` is at or past the end of the torrent.
pub fn block_for_offset(
  total_len: u64,
  piece_len: u32,
  off: u64,
) -> Option<BlockInfo> {
  if off >= total_len || piece_len == 0 {
    return None;
  }
  let piece_index = (off / piece_len as u64) as PieceIndex;
  let within_piece = (off % piece_len as u64) as u32;
  let offset = within_piece - within_piece % BLOCK_LEN;

  // the piece holding the final bytes of the torrent may be short, and so
  // may its final block
  let piece_start = piece_index as u64 * piece_len as u64;
  let this_piece_len =
    std::cmp::min(piece_len as u64, total_len - piece_start) as u32;
  let len = std::cmp::min(BLOCK_LEN, this_piece_len - offset);

  Some(BlockInfo {
    piece_index,
    offset,
    len,
  })
}

/// The inverse of [`block_for_offset`]: the absolute offset of a block's
/// first byte.
pub fn block_offset(piece_len: u32, block: &BlockInfo) -> u64 {
  block.torrent_offset(piece_len)
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  // An arbitrary piece length that is an exact multiple of the canonical
  // block length (16 KiB).
  const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

  // An arbitrary piece length that is _not_ a multiple of the canonical
  // block length and the amount with which it overlaps the nearest exact
  // multiple value.
  const OVERLAP: u32 = 234;
  const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

  #[test]
  fn test_block_len() {
    assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
    assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

    assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
    assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
    assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
  }

  #[test]
  #[should_panic]
  fn test_block_len_invalid_index_panic() {
    block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
  }

  #[test]
  fn test_block_count() {
    assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);

    assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
  }

  #[test]
  fn test_block_index_spec() {
    // a 32768-byte piece splits into two full blocks
    assert_eq!(block_index_spec(0, 32768), (0, BLOCK_LEN));
    assert_eq!(block_index_spec(1, 32768), (BLOCK_LEN, BLOCK_LEN));

    // a 10000-byte tail piece is a single short block
    assert_eq!(block_index_spec(0, 10000), (0, 10000));
  }

  #[test]
  fn test_region_pieces() {
    let piece_len = 10;
    let piece_count = 3;

    assert_eq!(region_pieces(0, 5, piece_len, piece_count), (0, 1));
    assert_eq!(region_pieces(0, 10, piece_len, piece_count), (0, 1));
    assert_eq!(region_pieces(0, 11, piece_len, piece_count), (0, 2));
    assert_eq!(region_pieces(5, 6, piece_len, piece_count), (0, 2));
    assert_eq!(region_pieces(10, 1, piece_len, piece_count), (1, 2));
    assert_eq!(region_pieces(20, 1000, piece_len, piece_count), (2, 3));
    assert_eq!(region_pieces(0, 0, piece_len, piece_count), (0, 0));

    // a region past the last piece stays clamped and empty
    assert_eq!(region_pieces(30, 1, piece_len, piece_count), (3, 3));
  }

  #[test]
  fn test_block_for_offset() {
    let total_len = 100_000;
    let piece_len = 32768;

    // byte 40000 lands in piece 1's first block, 7232 bytes in
    assert_eq!(
      block_for_offset(total_len, piece_len, 40_000),
      Some(BlockInfo {
        piece_index: 1,
        offset: 0,
        len: BLOCK_LEN,
      })
    );

    // the very first byte
    assert_eq!(
      block_for_offset(total_len, piece_len, 0),
      Some(BlockInfo {
        piece_index: 0,
        offset: 0,
        len: BLOCK_LEN,
      })
    );

    // four pieces in total; the tail piece is 100000 - 3*32768 = 1696
    // bytes, a single short block
    assert_eq!(
      block_for_offset(total_len, piece_len, total_len - 1),
      Some(BlockInfo {
        piece_index: 3,
        offset: 0,
        len: 1696,
      })
    );

    // at or past the end there is no block
    assert_eq!(block_for_offset(total_len, piece_len, total_len), None);
    assert_eq!(block_for_offset(total_len, piece_len, total_len + 5), None);
  }

  #[test]
  fn test_block_offset_round_trip() {
    let total_len = 100_000;
    let piece_len = 32768;

    for off in [0u64, 1, 16384, 32767, 32768, 40_000, 98_304, 99_999] {
      let block = block_for_offset(total_len, piece_len, off).unwrap();
      let back = block_offset(piece_len, &block);
      // the block starts at or before the offset and covers it
      assert!(back <= off);
      assert!(off < back + block.len as u64);
      // and maps back to itself
      assert_eq!(block_for_offset(total_len, piece_len, back), Some(block));
    }
  }
}
