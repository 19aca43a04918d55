//! The hooks a torrent uses to nudge the enclosing client's scheduler.
//!
//! The client owns the sockets and the cross-torrent request scheduler;
//! the torrent only signals that its demand changed. Every hook is
//! invoked with the torrent's state lock held, so implementations must
//! not call back into the torrent from inside a hook; note what happened
//! and act after the call unwinds.

use crate::torrent::ConnId;
use crate::PieceIndex;

pub trait Scheduler: Send + Sync {
  /// The torrent could use more connections: demand changed or the peer
  /// reserve gained an entry worth dialing.
  fn open_new_conns(&self) {}

  /// A piece was explicitly pended and needs a source.
  fn missing_piece(&self, _piece: PieceIndex) {}

  /// The given connection should request metadata pieces.
  fn request_metadata(&self, _conn: ConnId) {}

  /// The given connection should reconsider what to request next.
  fn replenish_requests(&self, _conn: ConnId) {}

  /// A piece completed; the connection may now be served uploads for it.
  fn rekindle_upload(&self, _conn: ConnId) {}
}

/// A scheduler that ignores every signal. Useful for tests and for
/// torrents driven purely by local reads.
pub struct NullScheduler;

impl Scheduler for NullScheduler {}
