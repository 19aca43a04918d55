use crate::blockinfo::BlockInfo;
use crate::error::MetainfoError;

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
  #[error("torrent closed")]
  /// The torrent's closing gate was shut while the operation was in
  /// progress or before it started.
  Closed,

  #[error("torrent has no metadata")]
  /// The operation needs the info dictionary, which has not been
  /// acquired yet.
  NoMetadata,

  #[error("torrent has no storage backend")]
  /// The operation touches torrent data but no storage was installed.
  NoStorage,

  #[error("invalid request {0}")]
  /// The request does not satisfy the outgoing-request validity rule.
  InvalidRequest(BlockInfo),

  #[error("invalid piece index {0}")]
  /// The piece index does not exist in this torrent.
  InvalidPieceIndex(usize),

  #[error("unknown connection {0}")]
  /// The connection id does not correspond to a live connection.
  UnknownConnection(u64),

  #[error("info bytes do not match the torrent's info hash")]
  /// A metadata source delivered an info dictionary whose digest is not
  /// this torrent's identity.
  BadInfoHash,

  #[error("short write: {written} of {expected} bytes")]
  /// The storage backend reported success but consumed fewer bytes
  /// than it was given.
  ShortWrite { written: usize, expected: usize },

  #[error("bad metadata: {0}")]
  /// The assembled metadata buffer did not parse or validate as an
  /// info dictionary.
  BadMetadata(#[from] MetainfoError),

  #[error("bencode error: {0}")]
  /// Marshalling a fixed-shape dictionary failed. Surfaced instead of
  /// panicking so long-running processes survive it.
  Bencode(String),

  #[error("{0}")]
  /// An IO error from the storage backend.
  Io(#[from] std::io::Error),
}

impl From<TorrentError> for std::io::Error {
  fn from(value: TorrentError) -> Self {
    match value {
      TorrentError::Io(e) => e,
      other => std::io::Error::other(other),
    }
  }
}
