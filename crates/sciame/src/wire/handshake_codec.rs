//! The handshake opens every connection and has its own layout, so it gets
//! its own codec. After one handshake each way the connection switches to
//! [`super::MessageCodec`], keeping the read and write buffers, since the
//! remote may send its first messages in the same segment.

use std::io;

use bytes::{Buf, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};

use super::PSTR;
use crate::{error::Error, peer::PeerId, torrent::InfoHash};

/// Size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeCodec;

fn invalid_data(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let bytes = handshake.serialize().map_err(invalid_data)?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the length byte can be rejected before the rest arrives
        if buf[0] as usize != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let handshake =
            Handshake::deserialize(&buf[..HANDSHAKE_LEN]).map_err(invalid_data)?;
        buf.advance(HANDSHAKE_LEN);

        Ok(Some(handshake))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. No
/// extensions are supported so the reserved field is 8 zero bytes.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Validate the handshake a remote peer sent in response to `ours`.
    pub fn validate(&self, ours: &Self) -> Result<(), Error> {
        if self.pstr_len != 19 || self.pstr != PSTR {
            return Err(Error::HandshakeInvalid);
        }
        if self.info_hash != ours.info_hash {
            return Err(Error::InfoHashMismatch);
        }
        // we connected to ourselves
        if self.peer_id == ours.peer_id {
            return Err(Error::HandshakeInvalid);
        }
        Ok(())
    }
}
