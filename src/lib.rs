//! The per-swarm core of a BitTorrent client.
//!
//! One [`Torrent`](torrent::Torrent) tracks which pieces and sub-piece
//! blocks are on disk, assembles the info dictionary over BEP 9, keeps
//! the peer bookkeeping the request scheduler needs, and serves blocking
//! seekable [`Reader`](reader::Reader)s whose outstanding reads drive
//! piece priorities. The wire codec, tracker client, DHT and the on-disk
//! backend live outside, behind the [`Storage`](storage::Storage) and
//! [`Scheduler`](sched::Scheduler) interfaces.

pub mod blockinfo;
pub mod conf;
pub mod error;
pub mod feed;
pub mod metainfo;
pub mod piece;
pub mod reader;
pub mod sched;
pub mod storage;
pub mod torrent;

mod define;
pub use define::*;
