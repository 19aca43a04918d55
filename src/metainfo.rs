use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use url::Url;

use crate::error::metainfo::{MetainfoError, Result};
use crate::{InfoHash, Sha1Hash, PIECE_HASH_LEN};

/// Where one file's bytes live within the torrent's flat byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
  pub path: PathBuf,
  pub len: u64,
  pub torrent_offset: u64,
}

/// The parsed and validated info dictionary.
///
/// Present only once metadata acquisition completes; before that the
/// torrent operates in metadata-only mode.
#[derive(Clone)]
pub struct Info {
  /// torrent name, the form for download path.
  pub name: String,
  /// the length of the pieces
  pub piece_len: u32,
  /// Total length of the torrent in bytes. Stored because it's not O(1)
  /// to get this from the file list.
  pub total_len: u64,
  /// A list of files ordered as in the files dictionary, carrying their
  /// offsets into the torrent.
  pub files: Vec<FileInfo>,
  /// One expected SHA-1 digest per piece.
  pub piece_hashes: Vec<Sha1Hash>,
}

impl fmt::Debug for Info {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Info")
      .field("name", &self.name)
      .field("piece_len", &self.piece_len)
      .field("total_len", &self.total_len)
      .field("files", &self.files)
      .field("pieces", &"<pieces...>")
      .finish()
  }
}

/// The SHA-1 digest of the verbatim bencoded info dictionary.
pub fn info_hash(info_bytes: &[u8]) -> InfoHash {
  let digest = Sha1::digest(info_bytes);
  let mut hash = [0; 20];
  hash.copy_from_slice(&digest);
  hash
}

impl Info {
  /// Parses a raw bencoded info dictionary into an [`Info`] instance or
  /// returns an error about the invalid format or syntax.
  ///
  /// Here are some rules:
  /// - the bencode format and syntax should be correct.
  /// - the length of pieces should be a multiple of 20.
  /// - cannot contain both `length` (single file) and `files` (multi files).
  /// - file lengths must not be 0 and paths must be relative and non-empty.
  /// - the piece table must cover the total length exactly.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    // parse the buffer and then do verification
    let info: raw::Info = serde_bencode::from_bytes(bytes)?;

    // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
    // must be a multiple of 20
    if info.pieces.is_empty() || info.pieces.len() % PIECE_HASH_LEN != 0 {
      return Err(MetainfoError::InvalidPieces);
    }

    if info.piece_len == 0 {
      log::warn!("Piece length is 0");
      return Err(MetainfoError::InvalidMetainfo);
    }

    // verify download structure and build up files metadata
    let mut files = Vec::new();
    if let Some(len) = info.len {
      if info.files.is_some() {
        log::warn!("Metainfo cannot contain both `length` and `files`");
        return Err(MetainfoError::InvalidMetainfo);
      }
      if len == 0 {
        log::warn!("File length is 0");
        return Err(MetainfoError::InvalidMetainfo);
      }

      // the path of this file is just the torrent name
      files.push(FileInfo {
        path: info.name.clone().into(),
        len,
        torrent_offset: 0,
      });
    } else if let Some(raw_files) = &info.files {
      if raw_files.is_empty() {
        log::warn!("Metainfo files must not be empty");
        return Err(MetainfoError::InvalidMetainfo);
      }

      files.reserve_exact(raw_files.len());

      // the offset of series of files
      let mut torrent_offset = 0;
      for file in raw_files.iter() {
        // verify the file length is non-zero
        if file.len == 0 {
          log::warn!("File {:?} length is 0", file.path);
          return Err(MetainfoError::InvalidMetainfo);
        }

        // verify that the path is not empty
        let path: PathBuf = file.path.iter().collect();
        if path.as_os_str().is_empty() {
          log::warn!("Path in metainfo is empty");
          return Err(MetainfoError::InvalidMetainfo);
        }

        // verify that the path is not absolute
        if path.is_absolute() {
          log::warn!("Path {:?} is absolute", path);
          return Err(MetainfoError::InvalidMetainfo);
        }

        // verify that the path is not the root
        if path == Path::new("/") {
          log::warn!("Path {:?} is root", path);
          return Err(MetainfoError::InvalidMetainfo);
        }

        // file is now verified, we can collect it
        files.push(FileInfo {
          path,
          torrent_offset,
          len: file.len,
        });

        // advance offset for next file
        torrent_offset += file.len;
      }
    } else {
      log::warn!("No `length` or `files` key present in metainfo");
      return Err(MetainfoError::InvalidMetainfo);
    }

    let total_len = files.iter().map(|f| f.len).sum::<u64>();

    // extract the per-piece hashes
    let piece_hashes = info
      .pieces
      .chunks_exact(PIECE_HASH_LEN)
      .map(|chunk| {
        let mut hash = [0; 20];
        hash.copy_from_slice(chunk);
        hash
      })
      .collect::<Vec<Sha1Hash>>();

    // the piece table must cover the content exactly
    let expected =
      ((total_len + info.piece_len as u64 - 1) / info.piece_len as u64) as usize;
    if piece_hashes.len() != expected {
      log::warn!(
        "Metainfo has {} piece hashes for {} pieces of content",
        piece_hashes.len(),
        expected
      );
      return Err(MetainfoError::InvalidPieces);
    }

    Ok(Info {
      name: info.name,
      piece_len: info.piece_len,
      total_len,
      files,
      piece_hashes,
    })
  }

  pub fn num_pieces(&self) -> usize {
    self.piece_hashes.len()
  }

  /// Return true if the download is multi file
  pub fn is_archive(&self) -> bool {
    self.files.len() > 1
  }
}

/// A run-time generated metainfo document: the stored info bytes verbatim
/// plus the announce-list as currently known to the client.
#[derive(Debug, Clone)]
pub struct MetaInfo {
  /// The bencoded bytes of the info dict, spliced into the output
  /// untouched so the info hash survives the round trip.
  pub info_bytes: Vec<u8>,
  pub creation_date: i64,
  pub comment: String,
  pub created_by: String,
  pub announce_list: Vec<Vec<String>>,
}

impl MetaInfo {
  pub fn new(info_bytes: Vec<u8>, trackers: &[Vec<Url>]) -> Self {
    let creation_date = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0);
    MetaInfo {
      info_bytes,
      creation_date,
      comment: "dynamic metainfo from client".to_string(),
      created_by: "bt-swarm".to_string(),
      announce_list: trackers
        .iter()
        .map(|tier| tier.iter().map(|url| url.to_string()).collect())
        .collect(),
    }
  }

  /// Emits the bencoded document. Keys are written in their canonical
  /// sort order and the info dictionary is copied in verbatim.
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    fn keyed(out: &mut Vec<u8>, key: &str, value: Vec<u8>) {
      out.extend_from_slice(format!("{}:{}", key.len(), key).as_bytes());
      out.extend_from_slice(&value);
    }

    let mut out = Vec::with_capacity(self.info_bytes.len() + 256);
    out.push(b'd');
    if !self.announce_list.is_empty() {
      keyed(
        &mut out,
        "announce-list",
        serde_bencode::to_bytes(&self.announce_list)?,
      );
    }
    keyed(&mut out, "comment", serde_bencode::to_bytes(&self.comment)?);
    keyed(
      &mut out,
      "created by",
      serde_bencode::to_bytes(&self.created_by)?,
    );
    keyed(
      &mut out,
      "creation date",
      serde_bencode::to_bytes(&self.creation_date)?,
    );
    keyed(&mut out, "info", self.info_bytes.clone());
    out.push(b'e');
    Ok(out)
  }
}

mod raw {
  //! Only for the `bencode` crate to deserialize into, converted into the
  //! validated [`Info`](super::Info) afterwards.
  use serde_derive::{Deserialize, Serialize};

  /// Details of field meanings in
  /// [.torrent file](https://en.wikipedia.org/wiki/Torrent_file)
  #[derive(Debug, Serialize, Deserialize)]
  pub struct Info {
    /// suggested filename where the file is to be saved (if one file)/
    /// suggested directory name where the files are to be saved (if
    /// multiple files)
    pub name: String,
    #[serde(with = "serde_bytes")]
    /// a hash list, i.e., a concatenation of each piece's SHA-1 hash. As
    /// SHA-1 returns a 160-bit hash, pieces will be a string whose length
    /// is a multiple of 20 bytes.
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    /// number of bytes per piece, except possibly the last one
    pub piece_len: u32,
    #[serde(rename = "length")]
    /// size of the file in bytes (only when one file is being shared)
    pub len: Option<u64>,
    /// a list of dictionaries each corresponding to a file (only when
    /// multiple files are being shared)
    pub files: Option<Vec<File>>,
    /// not used field but kept in here for encoding back a valid info
    /// dict for hashing
    pub private: Option<u8>,
  }

  #[derive(Debug, Serialize, Deserialize)]
  pub struct File {
    /// a list of strings corresponding to subdirectory names, the last of
    /// which is the actual file name
    pub path: Vec<String>,
    #[serde(rename = "length")]
    /// size of the file in bytes
    pub len: u64,
  }
}

/// Builds a valid single-file bencoded info dictionary, with zeroed piece
/// hashes unless given.
#[cfg(test)]
pub(crate) fn test_info_bytes(
  name: &str,
  piece_len: u32,
  total_len: u64,
  piece_hashes: Option<&[Sha1Hash]>,
) -> Vec<u8> {
  let num_pieces =
    ((total_len + piece_len as u64 - 1) / piece_len as u64) as usize;
  let pieces: Vec<u8> = match piece_hashes {
    Some(hashes) => {
      assert_eq!(hashes.len(), num_pieces);
      hashes.iter().flatten().copied().collect()
    }
    None => vec![0; num_pieces * PIECE_HASH_LEN],
  };
  let mut out = Vec::new();
  // keys in bencode sort order: length, name, piece length, pieces
  out.push(b'd');
  out.extend_from_slice(format!("6:lengthi{}e", total_len).as_bytes());
  out.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
  out.extend_from_slice(format!("12:piece lengthi{}e", piece_len).as_bytes());
  out.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
  out.extend_from_slice(&pieces);
  out.push(b'e');
  out
}
