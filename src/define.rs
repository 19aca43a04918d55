/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The 20-byte identifier of a torrent, immutable for its whole life.
///
/// It is the SHA-1 digest of the bencoded info dictionary.
pub type InfoHash = Sha1Hash;

/// The peer ID is an arbitrary 20 byte string.
///
/// [`Guidelines for choosing a peer ID`](http://bittorrent.org/beps/bep_0020.html).
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector where the first element represents the first
/// piece, the second element the second piece, and so on. A truthy value
/// means the piece is present, a falsy value means it is not.
///
/// The same representation is reused for the per-piece dirty-chunk map and
/// for the BEP 9 metadata have-map.
pub type Bitfield = bitvec::prelude::BitVec;

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The size of one BEP 9 metadata piece. Like blocks, the last piece of the
/// info dictionary may be shorter.
pub const METADATA_PIECE_LEN: usize = 0x4000;

/// Announced metadata sizes above this are rejected outright.
pub const METADATA_SIZE_CAP: usize = 10_000_000;

/// The length of one entry in the metainfo "pieces" hash table.
pub const PIECE_HASH_LEN: usize = 20;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;
