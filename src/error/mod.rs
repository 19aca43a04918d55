//! Set of module Error
pub mod metainfo;
pub mod torrent;

pub use metainfo::MetainfoError;
pub use torrent::{Result as TorrentResult, TorrentError};
