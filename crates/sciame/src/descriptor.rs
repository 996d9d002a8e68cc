//! The immutable metadata of a torrent.
//!
//! Parsing `.torrent` files is the job of the caller, this module only
//! validates the values it receives.
use crate::{
    error::Error,
    torrent::InfoHash,
    wire::{BlockInfo, BLOCK_LEN},
};

/// A file of a torrent, in the order they appear in the torrent data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the download directory.
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    pub name: String,
    pub info_hash: InfoHash,
    /// SHA-1 of each piece, in order.
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: u32,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
}

impl TorrentDescriptor {
    /// Check that the values describe a torrent that can be downloaded.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |s: &str| Err(Error::DescriptorInvalid(s.to_owned()));

        if self.piece_length == 0 {
            return invalid("piece length is zero");
        }
        if self.total_length == 0 {
            return invalid("total length is zero");
        }

        let expected = self.total_length.div_ceil(self.piece_length as u64);
        if self.piece_hashes.len() as u64 != expected {
            return Err(Error::DescriptorInvalid(format!(
                "{} piece hashes for {} pieces",
                self.piece_hashes.len(),
                expected
            )));
        }

        if !self.files.is_empty() {
            let sum: u64 = self.files.iter().map(|f| f.length).sum();
            if sum != self.total_length {
                return Err(Error::DescriptorInvalid(format!(
                    "files have {sum} bytes but the torrent has {}",
                    self.total_length
                )));
            }
        }

        for file in &self.files {
            if file.path.is_empty() {
                return invalid("file with an empty path");
            }
            if file
                .path
                .iter()
                .any(|c| c.is_empty() || c == "." || c == ".." || c.contains('/'))
            {
                return Err(Error::DescriptorInvalid(format!(
                    "invalid file path {:?}",
                    file.path
                )));
            }
        }

        Ok(())
    }

    pub fn pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece at `index`, the last piece might be smaller.
    pub fn piece_size(&self, index: usize) -> u32 {
        let pieces = self.pieces();
        if index + 1 == pieces {
            let remainder = self.total_length % self.piece_length as u64;
            if remainder != 0 {
                return remainder as u32;
            }
        }
        self.piece_length
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index)
    }

    /// Number of blocks of the piece at `index`.
    pub fn blocks_in_piece(&self, index: usize) -> usize {
        self.piece_size(index).div_ceil(BLOCK_LEN) as usize
    }

    /// All the blocks of the piece at `index`, the last one might be smaller
    /// than [`BLOCK_LEN`].
    pub fn block_infos(&self, index: usize) -> Vec<BlockInfo> {
        let size = self.piece_size(index);

        (0..size)
            .step_by(BLOCK_LEN as usize)
            .map(|begin| {
                BlockInfo::new()
                    .index(index as u32)
                    .begin(begin)
                    .len(BLOCK_LEN.min(size - begin))
            })
            .collect()
    }

    /// A block is valid when it falls inside of one piece. It doesn't need to
    /// be aligned to [`BLOCK_LEN`], since remote peers may ask for any slice.
    pub fn is_valid_block(&self, info: &BlockInfo) -> bool {
        let index = info.index as usize;
        if index >= self.pieces() || info.len == 0 || info.len > BLOCK_LEN {
            return false;
        }
        info.begin as u64 + info.len as u64 <= self.piece_size(index) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(total_length: u64, piece_length: u32) -> TorrentDescriptor {
        let pieces = total_length.div_ceil(piece_length as u64) as usize;
        TorrentDescriptor {
            name: "debian.iso".to_owned(),
            info_hash: InfoHash([1; 20]),
            piece_hashes: vec![[0; 20]; pieces],
            piece_length,
            total_length,
            files: vec![FileEntry {
                path: vec!["debian.iso".to_owned()],
                length: total_length,
            }],
        }
    }

    #[test]
    fn piece_size() {
        let d = descriptor(3 * BLOCK_LEN as u64 + 10, 2 * BLOCK_LEN);
        assert_eq!(d.pieces(), 2);
        assert_eq!(d.piece_size(0), 2 * BLOCK_LEN);
        assert_eq!(d.piece_size(1), BLOCK_LEN + 10);

        let d = descriptor(4 * BLOCK_LEN as u64, 2 * BLOCK_LEN);
        assert_eq!(d.piece_size(1), 2 * BLOCK_LEN);
    }

    #[test]
    fn block_infos() {
        let d = descriptor(3 * BLOCK_LEN as u64 + 10, 2 * BLOCK_LEN);

        let blocks = d.block_infos(1);
        assert_eq!(d.blocks_in_piece(1), 2);
        assert_eq!(
            blocks,
            vec![
                BlockInfo { index: 1, begin: 0, len: BLOCK_LEN },
                BlockInfo { index: 1, begin: BLOCK_LEN, len: 10 },
            ]
        );
    }

    #[test]
    fn valid_blocks() {
        let d = descriptor(3 * BLOCK_LEN as u64 + 10, 2 * BLOCK_LEN);

        assert!(d.is_valid_block(&BlockInfo::new().index(1).begin(BLOCK_LEN).len(10)));
        assert!(d.is_valid_block(&BlockInfo::new().index(0).begin(100).len(200)));
        assert!(!d.is_valid_block(&BlockInfo::new().index(1).begin(BLOCK_LEN).len(11)));
        assert!(!d.is_valid_block(&BlockInfo::new().index(2)));
        assert!(!d.is_valid_block(&BlockInfo::new().len(0)));
        assert!(!d.is_valid_block(&BlockInfo::new().len(BLOCK_LEN + 1)));
    }

    #[test]
    fn validate() {
        assert!(descriptor(100, 30).validate().is_ok());

        let mut d = descriptor(100, 30);
        d.piece_hashes.pop();
        assert!(matches!(d.validate(), Err(Error::DescriptorInvalid(_))));

        let mut d = descriptor(100, 30);
        d.piece_length = 0;
        assert!(d.validate().is_err());

        let mut d = descriptor(100, 30);
        d.files[0].length = 99;
        assert!(d.validate().is_err());

        let mut d = descriptor(100, 30);
        d.files[0].path = vec!["..".to_owned(), "etc".to_owned()];
        assert!(d.validate().is_err());

        let mut d = descriptor(100, 30);
        d.files.clear();
        assert!(d.validate().is_ok());
    }
}
