use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";

pub(crate) const FRAME_TYPE_RESPONSE: u32 = 0;
pub(crate) const FRAME_TYPE_ERROR: u32 = 1;
pub(crate) const FRAME_TYPE_MESSAGE: u32 = 2;

const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// One message handed out by nsqd.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    /// Nanoseconds since epoch, set by nsqd
    pub timestamp: i64,
    /// 1 on first delivery
    pub attempts: u16,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Delivery),
}

/// `[size: u32][frame type: u32][data]`, size covers type and data.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Frame> {
    let size = reader.read_u32().await?;
    if !(4..=MAX_FRAME_SIZE).contains(&size) {
        bail!("invalid frame size {}", size);
    }
    let frame_type = reader.read_u32().await?;
    let mut data = vec![0u8; size as usize - 4];
    reader.read_exact(&mut data).await?;
    parse_frame(frame_type, Bytes::from(data))
}

pub fn parse_frame(frame_type: u32, data: Bytes) -> anyhow::Result<Frame> {
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => {
            if data.len() < MESSAGE_HEADER_LEN {
                bail!("message frame too short: {} bytes", data.len());
            }
            let mut timestamp = [0u8; 8];
            timestamp.copy_from_slice(&data[..8]);
            let attempts = u16::from_be_bytes([data[8], data[9]]);
            let mut id = [0u8; 16];
            id.copy_from_slice(&data[10..26]);
            Ok(Frame::Message(Delivery {
                id: MessageId(id),
                timestamp: i64::from_be_bytes(timestamp),
                attempts,
                body: data.slice(MESSAGE_HEADER_LEN..),
            }))
        }
        other => bail!("unknown frame type {}", other),
    }
}

pub fn sub(topic: &str, channel: &str) -> Bytes {
    Bytes::from(format!("SUB {} {}\n", topic, channel))
}

pub fn rdy(count: u32) -> Bytes {
    Bytes::from(format!("RDY {}\n", count))
}

pub fn fin(id: &MessageId) -> Bytes {
    let mut out = BytesMut::with_capacity(21);
    out.put_slice(b"FIN ");
    out.put_slice(&id.0);
    out.put_u8(b'\n');
    out.freeze()
}

/// Resets the message's in-flight timeout on nsqd.
pub fn touch(id: &MessageId) -> Bytes {
    let mut out = BytesMut::with_capacity(23);
    out.put_slice(b"TOUCH ");
    out.put_slice(&id.0);
    out.put_u8(b'\n');
    out.freeze()
}

pub fn req(id: &MessageId, delay: Duration) -> Bytes {
    let mut out = BytesMut::with_capacity(32);
    out.put_slice(b"REQ ");
    out.put_slice(&id.0);
    out.put_slice(format!(" {}\n", delay.as_millis()).as_bytes());
    out.freeze()
}

pub fn nop() -> Bytes {
    Bytes::from_static(b"NOP\n")
}

pub fn publish(topic: &str, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(topic.len() + body.len() + 9);
    out.put_slice(b"PUB ");
    out.put_slice(topic.as_bytes());
    out.put_u8(b'\n');
    out.put_u32(body.len() as u32);
    out.put_slice(body);
    out.freeze()
}

/// Server side of the framing, used by the fake nsqd in tests.
#[cfg(test)]
pub(crate) fn encode_frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    out.extend_from_slice(&(data.len() as u32 + 4).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
pub(crate) fn encode_message(id: &[u8; 16], attempts: u16, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(body.len() + MESSAGE_HEADER_LEN);
    data.extend_from_slice(&1_500_000_000_000_000_000i64.to_be_bytes());
    data.extend_from_slice(&attempts.to_be_bytes());
    data.extend_from_slice(id);
    data.extend_from_slice(body);
    encode_frame(FRAME_TYPE_MESSAGE, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_message_frame() {
        let bytes = encode_message(b"0a1b2c3d4e5f6789", 3, b"\x30\x03\x00\x01t");
        let mut reader = &bytes[..];
        match read_frame(&mut reader).await.unwrap() {
            Frame::Message(d) => {
                assert_eq!(d.attempts, 3);
                assert_eq!(d.id.to_string(), "0a1b2c3d4e5f6789");
                assert_eq!(d.timestamp, 1_500_000_000_000_000_000);
                assert_eq!(&d.body[..], b"\x30\x03\x00\x01t");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_response_and_error_frames() {
        let mut bytes = encode_frame(FRAME_TYPE_RESPONSE, HEARTBEAT);
        bytes.extend(encode_frame(FRAME_TYPE_ERROR, b"E_FIN_FAILED FIN failed"));

        let mut reader = &bytes[..];
        assert!(matches!(read_frame(&mut reader).await.unwrap(), Frame::Response(d) if d == HEARTBEAT));
        assert!(matches!(read_frame(&mut reader).await.unwrap(), Frame::Error(_)));
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_frames() {
        let mut reader = &[0u8, 0, 0, 2][..];
        assert!(read_frame(&mut reader).await.is_err());
        assert!(parse_frame(FRAME_TYPE_MESSAGE, Bytes::from_static(b"short")).is_err());
        assert!(parse_frame(7, Bytes::new()).is_err());
    }

    #[test]
    fn test_commands() {
        let id = MessageId(*b"0a1b2c3d4e5f6789");
        assert_eq!(&fin(&id)[..], b"FIN 0a1b2c3d4e5f6789\n");
        assert_eq!(&req(&id, Duration::from_secs(5))[..], b"REQ 0a1b2c3d4e5f6789 5000\n");
        assert_eq!(&touch(&id)[..], b"TOUCH 0a1b2c3d4e5f6789\n");
        assert_eq!(&sub("translateBefore", "channelA")[..], b"SUB translateBefore channelA\n");
        assert_eq!(&rdy(1)[..], b"RDY 1\n");
        assert_eq!(&publish("translateAfter", b"abc")[..], b"PUB translateAfter\n\x00\x00\x00\x03abc");
    }
}
