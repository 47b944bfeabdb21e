use bytes::{BufMut, Bytes, BytesMut};

const TAG_PACKET: u8 = 0;
const TAG_PING: u8 = 1;
const TAG_PONG: u8 = 2;

/// One data-channel message. Liveness probes share the channel with tunnel
/// packets, so every message starts with a tag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Packet(Bytes),
    Ping(u64),
    Pong(u64),
}

impl Frame {
    pub(crate) fn encode(&self) -> Bytes {
        match self {
            Frame::Packet(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(TAG_PACKET);
                buf.extend_from_slice(data);
                buf.freeze()
            }
            Frame::Ping(nonce) => control(TAG_PING, *nonce),
            Frame::Pong(nonce) => control(TAG_PONG, *nonce),
        }
    }

    pub(crate) fn decode(data: &Bytes) -> Option<Self> {
        let (&tag, rest) = data.split_first()?;
        match tag {
            TAG_PACKET => Some(Frame::Packet(data.slice(1..))),
            TAG_PING => Some(Frame::Ping(nonce(rest)?)),
            TAG_PONG => Some(Frame::Pong(nonce(rest)?)),
            _ => None,
        }
    }
}

fn control(tag: u8, nonce: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(tag);
    buf.put_u64(nonce);
    buf.freeze()
}

fn nonce(rest: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(rest.try_into().ok()?))
}
