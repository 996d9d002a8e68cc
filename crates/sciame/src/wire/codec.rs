use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo, MAX_MESSAGE_SIZE};
use crate::{bitfield::Bitfield, error::Error};

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

/// Fail with a protocol error if a message doesn't have the payload size of
/// its kind.
fn expect_len(id: MessageId, got: usize, want: usize) -> Result<(), Error> {
    if got != want {
        return Err(Error::MessageMalformed(format!(
            "{id:?} with a payload of {got} bytes, expected {want}"
        )));
    }
    Ok(())
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                let piece: u32 = piece.try_into().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block_info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                block.encode(buf)?;
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block_info.encode(buf);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // frames with unknown ids are skipped, and the next frame might be
        // already in the buffer.
        loop {
            // the message length header must be present at the minimum,
            // otherwise we can't determine the message type
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at length prefix without consuming
            let size =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if size > MAX_MESSAGE_SIZE {
                return Err(Error::MessageTooLarge(size));
            }

            // incomplete message, wait for the rest of the frame without
            // advancing the cursor.
            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let mut payload = buf.split_to(size);
            let msg_id = payload.get_u8();

            let Ok(msg_id) = MessageId::try_from(msg_id) else {
                warn!("unknown message_id {msg_id:?}, skipping {size} bytes");
                continue;
            };

            let payload_len = payload.len();

            let msg = match msg_id {
                // <len=0001><id=0>
                MessageId::Choke => {
                    expect_len(msg_id, payload_len, 0)?;
                    Message::Choke
                }
                // <len=0001><id=1>
                MessageId::Unchoke => {
                    expect_len(msg_id, payload_len, 0)?;
                    Message::Unchoke
                }
                // <len=0001><id=2>
                MessageId::Interested => {
                    expect_len(msg_id, payload_len, 0)?;
                    Message::Interested
                }
                // <len=0001><id=3>
                MessageId::NotInterested => {
                    expect_len(msg_id, payload_len, 0)?;
                    Message::NotInterested
                }
                // <len=0005><id=4><piece index>
                MessageId::Have => {
                    expect_len(msg_id, payload_len, 4)?;
                    Message::Have(payload.get_u32() as usize)
                }
                // <len=0001+X><id=5><bitfield>
                MessageId::Bitfield => {
                    Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
                }
                // <len=0013><id=6><index><begin><length>
                MessageId::Request => {
                    expect_len(msg_id, payload_len, 12)?;
                    Message::Request(
                        BlockInfo::new()
                            .index(payload.get_u32())
                            .begin(payload.get_u32())
                            .len(payload.get_u32()),
                    )
                }
                // <len=0009+X><id=7><index><begin><block>
                MessageId::Piece => {
                    if payload_len < 8 {
                        return Err(Error::MessageMalformed(format!(
                            "Piece with a payload of {payload_len} bytes"
                        )));
                    }
                    let index = payload.get_u32() as usize;
                    let begin = payload.get_u32();
                    Message::Piece(Block { index, begin, block: payload.to_vec() })
                }
                // <len=0013><id=8><index><begin><length>
                MessageId::Cancel => {
                    expect_len(msg_id, payload_len, 12)?;
                    Message::Cancel(
                        BlockInfo::new()
                            .index(payload.get_u32())
                            .begin(payload.get_u32())
                            .len(payload.get_u32()),
                    )
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BLOCK_LEN;
    use bitvec::{bitvec, prelude::Msb0};

    #[test]
    fn fragmented_piece() {
        let mut codec = MessageCodec;
        let mut buffer = BytesMut::new();

        let data = vec![0xAA; BLOCK_LEN as usize];

        // 1 (msg_id) + 4 (index) + 4 (begin) + 16384 (block)
        let total_length = 9 + BLOCK_LEN;

        let mut content = Vec::with_capacity(total_length as usize);
        content.push(MessageId::Piece as u8);
        content.extend_from_slice(&3u32.to_be_bytes());
        content.extend_from_slice(&BLOCK_LEN.to_be_bytes());
        content.extend_from_slice(&data);

        // simulate TCP fragmentation
        buffer.extend_from_slice(&total_length.to_be_bytes());
        buffer.extend_from_slice(&content[..5_000]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&content[5_000..12_000]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&content[12_000..]);

        let keepalive = [0x00, 0x00, 0x00, 0x00];
        let interested = [0x00, 0x00, 0x00, 0x01, 0x02];
        buffer.extend_from_slice(&keepalive);
        buffer.extend_from_slice(&interested);

        let msg = codec.decode(&mut buffer).unwrap().unwrap();
        match msg {
            Message::Piece(block) => {
                assert_eq!(block.index, 3);
                assert_eq!(block.begin, BLOCK_LEN);
                assert_eq!(block.block, data);
            }
            _ => panic!("Wrong message type"),
        }

        let msg = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(msg, Message::KeepAlive);

        let msg = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(msg, Message::Interested);

        assert!(buffer.is_empty());
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn unknown_id_is_skipped() {
        let mut buf = BytesMut::new();
        // port message (id 9) with a 2 byte payload, followed by an unchoke
        buf.extend_from_slice(&[0, 0, 0, 3, 9, 0x1a, 0xe1]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);

        let msg = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Unchoke);
        assert!(buf.is_empty());
    }

    #[test]
    fn wrong_payload_size() {
        // have with 2 bytes
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 3, 4, 0, 1]);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(Error::MessageMalformed(_))
        ));

        // choke with payload
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 2, 0, 7]);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(Error::MessageMalformed(_))
        ));
    }

    #[test]
    fn too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        buf.put_u8(MessageId::Piece as u8);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(Error::MessageTooLarge(_))
        ));
    }

    #[test]
    fn bitfield() {
        let mut original = bitvec![u8, Msb0; 0; 10];
        original.set(0, true);
        original.set(9, true);

        let mut buf = BytesMut::new();
        MessageCodec
            .encode(Message::Bitfield(original.clone()), &mut buf)
            .unwrap();

        // len
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);
        // msg_id
        assert_eq!(buf[4], MessageId::Bitfield as u8);
        assert_eq!(&buf[5..], &[0b1000_0000, 0b0100_0000]);

        let msg = MessageCodec.decode(&mut buf).unwrap().unwrap();
        let Message::Bitfield(decoded) = msg else { panic!() };

        // the wire always carries whole bytes
        assert_eq!(decoded.len(), 16);
        assert_eq!(decoded[..10], original[..]);
    }

    #[test]
    fn have() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Have(258), &mut buf).unwrap();
        assert_eq!(buf.to_vec(), vec![0, 0, 0, 5, 4, 0, 0, 1, 2]);

        let msg = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Have(258));
    }

    #[test]
    fn request() {
        let mut buf = BytesMut::new();
        let msg = Message::Request(BlockInfo::default());
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();

        // size of buf
        assert_eq!(buf.len(), 17);

        let mut peek = &buf[..];
        // len
        assert_eq!(peek.get_u32(), 13);
        // id
        assert_eq!(peek.get_u8(), MessageId::Request as u8);
        // index
        assert_eq!(peek.get_u32(), 0);
        // begin
        assert_eq!(peek.get_u32(), 0);
        // len of block
        assert_eq!(peek.get_u32(), BLOCK_LEN);

        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn piece() {
        let mut buf = BytesMut::new();
        let msg = Message::Piece(Block { index: 1, begin: 0, block: vec![7] });
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();

        // len
        assert_eq!(&buf[..4], &(9u32 + 1).to_be_bytes());
        // id
        assert_eq!(buf[4], MessageId::Piece as u8);

        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn cancel() {
        let mut buf = BytesMut::new();
        let info = BlockInfo::new().index(2).begin(BLOCK_LEN).len(100);
        MessageCodec.encode(Message::Cancel(info.clone()), &mut buf).unwrap();

        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Cancel(info));
    }
}

// Client connections start out as "choked" and "not interested".
// In other words:
//
// am_choking = 1
// am_interested = 0
// peer_choking = 1
// peer_interested = 0
//
// A block is downloaded by the client,
// when the client is interested in a peer,
// and that peer is not choking the client.
//
// A block is uploaded by a client,
// when the client is not choking a peer,
// and that peer is interested in the client.
//
// c <-handshake-> p
// c <-(optional) bitfield-> p
// c -interested-> p
// c <-unchoke- p
// c -request-> p
// c <-piece- p
