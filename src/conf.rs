//! This module defines types used to configure a torrent and its parts.

use std::time::Duration;

/// What a hash attempt should do when the storage backend fails mid-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashErrorPolicy {
  /// Return a zeroed digest so the check fails and the piece is
  /// re-fetched. The error is only logged.
  #[default]
  ZeroHash,
  /// Bubble the storage error up to the caller of the verify call.
  /// The piece stays dirty either way.
  Surface,
}

/// Configuration for a torrent.
///
/// The enclosing client will have a default instance of this applied to all
/// torrents by default, but individual torrents may override it.
#[derive(Debug, Clone)]
pub struct TorrentConf {
  /// The number of sockets the client aims to keep open per torrent.
  /// Feeds the worst-connection eviction rule: age-based eviction only
  /// starts once at least `(sockets_per_torrent + 1) / 2` candidates
  /// remain.
  pub sockets_per_torrent: usize,

  /// High-water mark for the peer reserve. Peers learned beyond this
  /// are dropped silently.
  pub peers_high_water: usize,

  /// Default readahead distance, in bytes, applied to new readers.
  pub default_readahead: u64,

  /// Connections younger than this are never evicted on age alone.
  pub min_conn_age_for_eviction: Duration,

  /// How a hash attempt reacts to a storage read error.
  pub hash_on_read_error: HashErrorPolicy,
}

impl Default for TorrentConf {
  fn default() -> Self {
    TorrentConf {
      // Mirrors the widely used per-torrent connection budget; small
      // enough not to overwhelm the host.
      sockets_per_torrent: 40,
      // Anything beyond this many known peers stops being useful and
      // only costs memory.
      peers_high_water: 500,
      // One piece of a typical torrent; readers usually override this.
      default_readahead: 0x40000,
      // Give connections one minute to prove themselves.
      min_conn_age_for_eviction: Duration::from_secs(60),
      hash_on_read_error: HashErrorPolicy::default(),
    }
  }
}
