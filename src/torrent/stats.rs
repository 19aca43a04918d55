//! Counters the torrent keeps about its own bookkeeping.

use std::collections::HashMap;

use crate::torrent::conns::PeerSource;
use crate::torrent::Torrent;

/// Accumulated under the state lock; cheap to clone out as a snapshot.
#[derive(Clone, Debug, Default)]
pub struct TorrentStats {
  /// Request-order permutations served from the free list.
  pub piece_priorities_reused: u64,
  /// Request-order permutations generated fresh.
  pub piece_priorities_new: u64,
  /// Peers accepted into the reserve, keyed by where we learned of them.
  pub peers_added_by_source: HashMap<PeerSource, u64>,
}

impl Torrent {
  pub fn stats(&self) -> TorrentStats {
    self.shared.state.lock().stats.clone()
  }
}
