//! MQTT 3.1.1 PUBLISH frames.
//!
//! The broker bridges client publishes onto the queue as raw MQTT packets, so
//! every queue message body is exactly one encoded PUBLISH. Only this packet
//! type is understood; anything else is rejected before the payload is looked at.

use crate::error::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PUBLISH: u8 = 3;

const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, RelayError> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(RelayError::Decode(format!("invalid QoS {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos` is above `AtMostOnce`
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl PublishPacket {
    #[cfg(test)]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    /// Same header and topic, different body.
    pub fn with_payload(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..self.clone()
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, RelayError> {
        let mut buf = frame;
        if !buf.has_remaining() {
            return Err(RelayError::Decode("empty frame".into()));
        }

        let header = buf.get_u8();
        let kind = header >> 4;
        if kind != PUBLISH {
            return Err(RelayError::UnexpectedPacketType(kind));
        }
        let dup = header & 0b1000 != 0;
        let qos = QoS::from_bits((header >> 1) & 0b11)?;
        let retain = header & 0b0001 != 0;

        let remaining = read_remaining_length(&mut buf)?;
        if buf.remaining() < remaining {
            return Err(RelayError::Decode(format!(
                "truncated frame: {} of {} bytes",
                buf.remaining(),
                remaining
            )));
        }
        if buf.remaining() > remaining {
            return Err(RelayError::Decode(format!(
                "{} trailing bytes after packet",
                buf.remaining() - remaining
            )));
        }

        if buf.remaining() < 2 {
            return Err(RelayError::Decode("missing topic length".into()));
        }
        let topic_len = buf.get_u16() as usize;
        if buf.remaining() < topic_len {
            return Err(RelayError::Decode("truncated topic".into()));
        }
        let topic = std::str::from_utf8(&buf[..topic_len])
            .map_err(|e| RelayError::Decode(format!("topic is not UTF-8: {}", e)))?
            .to_string();
        buf.advance(topic_len);
        if topic.contains(['+', '#']) {
            return Err(RelayError::Decode(format!("wildcard in topic {:?}", topic)));
        }

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(RelayError::Decode("missing packet identifier".into()));
            }
            match buf.get_u16() {
                0 => return Err(RelayError::Decode("packet identifier 0".into())),
                id => Some(id),
            }
        };

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    pub fn encode(&self) -> Result<Bytes, RelayError> {
        if self.topic.len() > u16::MAX as usize {
            return Err(RelayError::Payload("topic longer than 65535 bytes".into()));
        }
        if (self.qos == QoS::AtMostOnce) != self.packet_id.is_none() {
            return Err(RelayError::Payload(format!(
                "packet identifier {:?} does not match {:?}",
                self.packet_id, self.qos
            )));
        }

        let remaining = 2 + self.topic.len() + self.packet_id.map_or(0, |_| 2) + self.payload.len();
        if remaining > MAX_REMAINING_LENGTH {
            return Err(RelayError::Payload(format!("packet too large: {} bytes", remaining)));
        }

        let mut header = PUBLISH << 4 | (self.qos as u8) << 1;
        if self.dup {
            header |= 0b1000;
        }
        if self.retain {
            header |= 0b0001;
        }

        let mut out = BytesMut::with_capacity(remaining + 5);
        out.put_u8(header);
        write_remaining_length(&mut out, remaining);
        out.put_u16(self.topic.len() as u16);
        out.put_slice(self.topic.as_bytes());
        if let Some(id) = self.packet_id {
            out.put_u16(id);
        }
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }
}

fn read_remaining_length(buf: &mut &[u8]) -> Result<usize, RelayError> {
    let mut value = 0usize;
    for shift in [0, 7, 14, 21] {
        if !buf.has_remaining() {
            return Err(RelayError::Decode("truncated remaining length".into()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RelayError::Decode("remaining length longer than 4 bytes".into()))
}

fn write_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}
