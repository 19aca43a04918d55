//! Publishes piece-state changes to subscribers.
//!
//! Subscribers receive only the index of the piece that changed and must
//! re-query [`piece_state`](crate::torrent::Torrent::piece_state)
//! themselves; states may have changed again by the time the event is
//! handled.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::PieceIndex;

/// A fan-out of piece indices to any number of subscribers.
///
/// Guarded by the torrent's state lock like the rest of the torrent
/// fields, so it needs no lock of its own.
#[derive(Default)]
pub struct PieceStateFeed {
  subscribers: Vec<Sender<PieceIndex>>,
  closed: bool,
}

impl PieceStateFeed {
  /// Registers a subscriber. A feed that has been shut down hands back a
  /// receiver that reports disconnection immediately.
  pub fn subscribe(&mut self) -> Receiver<PieceIndex> {
    let (tx, rx) = channel();
    if !self.closed {
      self.subscribers.push(tx);
    }
    rx
  }

  /// Sends the index to every live subscriber, forgetting the ones whose
  /// receiving end has gone away.
  pub fn publish(&mut self, piece: PieceIndex) {
    self.subscribers.retain(|tx| tx.send(piece).is_ok());
  }

  /// Disconnects all subscribers. Idempotent.
  pub fn close(&mut self) {
    self.subscribers.clear();
    self.closed = true;
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }
}
