//! The peer wire protocol: the handshake and the messages exchanged between
//! peers after it.
mod codec;
mod handshake_codec;

pub use codec::*;
pub use handshake_codec::*;

use bytes::{BufMut, BytesMut};
use tokio::io;

/// Size of the blocks we request. Larger requests are dropped by many
/// clients, the last block of a piece may be shorter.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol identifier sent in the handshake.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// Frames larger than this are treated as a protocol violation.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Data of a piece at an offset, carried by the `piece` message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    pub index: usize,
    /// Offset in bytes from the start of the piece.
    pub begin: u32,
    pub block: Vec<u8>,
}

impl Block {
    /// Write `<index><begin><data>` into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        let index = u32::try_from(self.index)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        buf.put_u32(index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
        Ok(())
    }
}

/// Position of a [`Block`], carried by the `request` and `cancel`
/// messages.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    pub index: u32,
    /// Offset in bytes from the start of the piece.
    pub begin: u32,
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            index: block.index as u32,
            begin: block.begin,
            len: block.block.len() as u32,
        }
    }
}

/// Requests are grouped by piece.
impl From<&BlockInfo> for usize {
    fn from(info: &BlockInfo) -> Self {
        info.index as usize
    }
}

impl BlockInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn begin(mut self, begin: u32) -> Self {
        self.begin = begin;
        self
    }

    pub fn len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Write `<index><begin><length>` into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}
