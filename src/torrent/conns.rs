//! Active/half-open/reserve peer bookkeeping and the worst-connection
//! eviction rule.
//!
//! The torrent owns only the accounting side of a connection: counters,
//! the in-flight request set, the per-connection request order and an
//! outbox of control commands. The sockets and the wire codec live in the
//! networking layer, which drains the outbox.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::blockinfo::BlockInfo;
use crate::error::torrent::Result;
use crate::error::TorrentError;
use crate::torrent::Torrent;
use crate::{Bitfield, PeerId, PieceIndex};

/// Identifies one connection within its torrent for the life of the
/// connection. Never reused.
pub type ConnId = u64;

/// Where we learned about a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSource {
  Tracker,
  Dht,
  Pex,
  Incoming,
}

/// An entry of the peer reserve.
#[derive(Clone, Debug)]
pub struct Peer {
  pub id: Option<PeerId>,
  pub ip: IpAddr,
  pub port: u16,
  pub source: PeerSource,
  /// Peer is known to support encryption.
  pub supports_encryption: bool,
}

/// Control commands queued for the networking layer to send or act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnCommand {
  /// Announce a freshly verified piece.
  Have(PieceIndex),
  /// Withdraw an in-flight request.
  Cancel(BlockInfo),
  /// Ask the peer for the metadata pieces we are missing.
  RequestMetadata,
  /// Tear the connection down.
  Close,
}

/// The random piece order a connection requests in, seeded fresh per
/// connection so the first peer is not penalized by everyone asking for
/// the same pieces.
pub(crate) struct RequestOrder {
  order: Vec<PieceIndex>,
  deleted: HashSet<PieceIndex>,
}

impl RequestOrder {
  pub(crate) fn new(order: Vec<PieceIndex>) -> Self {
    RequestOrder {
      order,
      deleted: HashSet::new(),
    }
  }

  pub(crate) fn delete_piece(&mut self, piece: PieceIndex) {
    if self.contains(piece) {
      self.deleted.insert(piece);
    }
  }

  pub(crate) fn contains(&self, piece: PieceIndex) -> bool {
    !self.deleted.contains(&piece) && self.order.contains(&piece)
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.order.len() == self.deleted.len()
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = PieceIndex> + '_ {
    self
      .order
      .iter()
      .copied()
      .filter(move |piece| !self.deleted.contains(piece))
  }

  /// Recovers the full permutation for the free list.
  pub(crate) fn into_permutation(self) -> Vec<PieceIndex> {
    self.order
  }
}

/// Per-connection bookkeeping owned by the torrent.
pub struct Conn {
  pub id: ConnId,
  pub addr: SocketAddr,
  pub peer_id: Option<PeerId>,
  /// Set once the connection is being torn down; such connections are
  /// skipped by the eviction heap and never double-closed.
  pub(crate) closing: bool,
  /// Chunks received that no request of ours asked for.
  pub unwanted_chunks_received: u64,
  /// Chunks received that satisfied one of our requests.
  pub useful_chunks_received: u64,
  pub(crate) completed_handshake: Instant,
  /// Our outstanding requests on this connection.
  pub(crate) requests: HashSet<BlockInfo>,
  /// The peer's advertised pieces. Empty until a bitfield arrives.
  pub(crate) peer_pieces: Bitfield,
  pub(crate) request_order: Option<RequestOrder>,
  pub(crate) outbox: Vec<ConnCommand>,
}

impl Conn {
  fn new(id: ConnId, addr: SocketAddr) -> Self {
    Conn {
      id,
      addr,
      peer_id: None,
      closing: false,
      unwanted_chunks_received: 0,
      useful_chunks_received: 0,
      completed_handshake: Instant::now(),
      requests: HashSet::new(),
      peer_pieces: Bitfield::new(),
      request_order: None,
      outbox: Vec::new(),
    }
  }

  /// Orders worse connections first: higher unwanted:useful ratio, ties
  /// broken toward older connections. Compared with +1 smoothing and
  /// cross-multiplied to stay in integers.
  fn worse_than(&self, other: &Conn) -> bool {
    let lhs =
      (self.unwanted_chunks_received + 1) as u128 * (other.useful_chunks_received + 1) as u128;
    let rhs =
      (other.unwanted_chunks_received + 1) as u128 * (self.useful_chunks_received + 1) as u128;
    if lhs != rhs {
      return lhs > rhs;
    }
    self.completed_handshake < other.completed_handshake
  }
}

impl Torrent {
  /// There's a connection to or a dial in flight for that address already.
  pub fn addr_active(&self, addr: SocketAddr) -> bool {
    let state = self.shared.state.lock();
    if state.half_open.contains(&addr) {
      return true;
    }
    state.conns.iter().any(|c| c.addr == addr)
  }

  /// Records an in-flight outbound dial. Returns false when the address
  /// is already half-open or connected.
  pub fn add_half_open(&self, addr: SocketAddr) -> bool {
    if self.addr_active(addr) {
      return false;
    }
    let mut state = self.shared.state.lock();
    if state.ceasing_networking {
      return false;
    }
    state.half_open.insert(addr)
  }

  /// Forgets a dial that failed before completing its handshakes.
  pub fn abort_half_open(&self, addr: SocketAddr) {
    self.shared.state.lock().half_open.remove(&addr);
  }

  /// Registers a fully handshaked connection, leaving the half-open set.
  ///
  /// An address is never simultaneously half-open and connected.
  pub fn add_connection(&self, addr: SocketAddr) -> Result<ConnId> {
    let mut state = self.shared.state.lock();
    if state.closing || state.ceasing_networking {
      return Err(TorrentError::Closed);
    }
    state.half_open.remove(&addr);

    let id = state.next_conn_id;
    state.next_conn_id += 1;
    let mut conn = Conn::new(id, addr);
    if state.info.is_some() {
      let num_pieces = state.num_pieces();
      let order = state.take_request_order(num_pieces);
      conn.request_order = Some(RequestOrder::new(order));
    }
    state.conns.push(conn);
    Ok(id)
  }

  /// Removes a connection, recycling its request order.
  pub fn drop_connection(&self, id: ConnId) {
    let mut state = self.shared.state.lock();
    if let Some(at) = state.conns.iter().position(|c| c.id == id) {
      let conn = state.conns.swap_remove(at);
      if let Some(order) = conn.request_order {
        let perm = order.into_permutation();
        state.request_order_pool.push(perm);
      }
    }
  }

  /// Records the peer's advertised bitfield, enforcing the piece count
  /// when metadata is already present.
  pub fn set_peer_bitfield(&self, id: ConnId, pieces: Bitfield) -> Result<()> {
    let mut state = self.shared.state.lock();
    let num_pieces = state.info.as_ref().map(|info| info.num_pieces());
    let conn = state
      .conn_mut(id)
      .ok_or(TorrentError::UnknownConnection(id))?;
    if let Some(num_pieces) = num_pieces {
      if pieces.len() != num_pieces {
        conn.closing = true;
        conn.outbox.push(ConnCommand::Close);
        log::warn!(
          "closing connection {}: bitfield of {} pieces, torrent has {}",
          conn.addr,
          pieces.len(),
          num_pieces
        );
        return Err(TorrentError::Closed);
      }
    }
    conn.peer_pieces = pieces;
    Ok(())
  }

  /// A chunk arrived that satisfied one of our requests.
  pub fn record_useful_chunk(&self, id: ConnId) {
    let mut state = self.shared.state.lock();
    if let Some(conn) = state.conn_mut(id) {
      conn.useful_chunks_received += 1;
    }
  }

  /// A chunk arrived that nothing asked for.
  pub fn record_unwanted_chunk(&self, id: ConnId) {
    let mut state = self.shared.state.lock();
    if let Some(conn) = state.conn_mut(id) {
      conn.unwanted_chunks_received += 1;
    }
  }

  /// Notes an outstanding request on the connection, so that a completed
  /// piece can cancel it.
  pub fn record_request(&self, id: ConnId, block: BlockInfo) {
    let mut state = self.shared.state.lock();
    if let Some(conn) = state.conn_mut(id) {
      conn.requests.insert(block);
    }
  }

  /// Hands the queued control commands to the networking layer.
  pub fn drain_outbox(&self, id: ConnId) -> Vec<ConnCommand> {
    let mut state = self.shared.state.lock();
    match state.conn_mut(id) {
      Some(conn) => std::mem::take(&mut conn.outbox),
      None => Vec::new(),
    }
  }

  /// Whether the connection still has pieces worth requesting.
  pub fn conn_has_wanted_pieces(&self, id: ConnId) -> bool {
    let state = self.shared.state.lock();
    state
      .conns
      .iter()
      .find(|c| c.id == id)
      .and_then(|c| c.request_order.as_ref())
      .map(|order| !order.is_empty())
      .unwrap_or(false)
  }

  /// The pieces the connection should request next, in its personal
  /// random order, restricted to pieces the torrent currently wants.
  pub fn conn_request_order(&self, id: ConnId) -> Vec<PieceIndex> {
    let state = self.shared.state.lock();
    let Some(order) = state
      .conns
      .iter()
      .find(|c| c.id == id)
      .and_then(|c| c.request_order.as_ref())
    else {
      return Vec::new();
    };
    order.iter().filter(|piece| state.want_piece(*piece)).collect()
  }

  /// Adds a peer to the reserve. Peers beyond the high-water mark are
  /// dropped silently. The reserve may overlap with active connections so
  /// reconnects to well-known peers are encouraged.
  pub fn add_peer(&self, peer: Peer) {
    let mut state = self.shared.state.lock();
    if state.peers.len() >= self.shared.conf.peers_high_water {
      return;
    }
    let key = (peer.ip, peer.port);
    if state.peers.contains_key(&key) {
      return;
    }
    let source = peer.source;
    state.peers.insert(key, peer);
    *state.stats.peers_added_by_source.entry(source).or_insert(0) += 1;
    self.shared.sched.open_new_conns();
  }

  pub fn known_peer_count(&self) -> usize {
    self.shared.state.lock().peers.len()
  }

  pub fn half_open_count(&self) -> usize {
    self.shared.state.lock().half_open.len()
  }

  pub fn conn_count(&self) -> usize {
    self.shared.state.lock().conns.len()
  }

  /// Snapshot of non-closing connections ordered worst first.
  pub(crate) fn worst_conns_order(&self) -> Vec<ConnId> {
    let state = self.shared.state.lock();
    let mut ids: Vec<&Conn> =
      state.conns.iter().filter(|c| !c.closing).collect();
    ids.sort_by(|a, b| {
      if a.worse_than(b) {
        std::cmp::Ordering::Less
      } else if b.worse_than(a) {
        std::cmp::Ordering::Greater
      } else {
        std::cmp::Ordering::Equal
      }
    });
    ids.into_iter().map(|c| c.id).collect()
  }

  /// The connection to evict to make room for a new peer, if any
  /// deserves it. Callers must not evict when this returns `None`.
  pub fn worst_bad_conn(&self) -> Option<ConnId> {
    let order = self.worst_conns_order();
    let state = self.shared.state.lock();
    let min_age = self.shared.conf.min_conn_age_for_eviction;
    let keep_threshold = (self.shared.conf.sockets_per_torrent + 1) / 2;

    for (popped, id) in order.iter().enumerate() {
      let conn = state.conns.iter().find(|c| c.id == *id)?;
      if conn.unwanted_chunks_received >= 6
        && conn.unwanted_chunks_received > conn.useful_chunks_received
      {
        return Some(conn.id);
      }
      let remaining = order.len() - popped - 1;
      if remaining >= keep_threshold {
        // Give connections one minute to prove themselves.
        if conn.completed_handshake.elapsed() >= min_age {
          return Some(conn.id);
        }
      }
    }
    None
  }
}
