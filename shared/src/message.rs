/*!
Transport messages and their wire codec.

The scan controller's serial bridge frames every message as

```text
0xA5 0x5A | kind: u8 | len: u16 LE | payload: len bytes | checksum: u8
```

where the checksum is the XOR of the kind byte, both length bytes and the
payload. Bytes preceding a sync marker are skipped.
*/

use crate::protocol::{MAX_WIRE_PAYLOAD, SYNC_MARKER, WIRE_HEADER_BYTES};
use crate::session::RawLine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

/// Message kinds as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    ConnectAck = 0x01,
    FrameStart = 0x02,
    DataLine = 0x03,
    EndOfFrame = 0x04,
    DeviceError = 0x05,
}

impl MessageKind {
    /// Parse a kind byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ConnectAck),
            0x02 => Some(Self::FrameStart),
            0x03 => Some(Self::DataLine),
            0x04 => Some(Self::EndOfFrame),
            0x05 => Some(Self::DeviceError),
            _ => None,
        }
    }
}

/// A parsed message from the acquisition device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Device acknowledged the connection handshake
    ConnectAck,
    /// A new frame starts
    FrameStart,
    /// One line of interleaved samples
    DataLine(RawLine),
    /// The current frame is complete
    EndOfFrame,
    /// Device or link failure reported in-band
    Error(String),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ConnectAck => MessageKind::ConnectAck,
            Message::FrameStart => MessageKind::FrameStart,
            Message::DataLine(_) => MessageKind::DataLine,
            Message::EndOfFrame => MessageKind::EndOfFrame,
            Message::Error(_) => MessageKind::DeviceError,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Message::ConnectAck => "ConnectAck",
            Message::FrameStart => "FrameStart",
            Message::DataLine(_) => "DataLine",
            Message::EndOfFrame => "EndOfFrame",
            Message::Error(_) => "Error",
        }
    }

    /// Serialize the message into its wire form
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut payload = BytesMut::new();
        match self {
            Message::DataLine(line) => {
                let index = u16::try_from(line.index)
                    .map_err(|_| WireError::LineIndexOverflow(line.index))?;
                payload.reserve(2 + line.words.len() * 2);
                payload.put_u16_le(index);
                for &word in &line.words {
                    payload.put_u16_le(word);
                }
            }
            Message::Error(reason) => payload.put_slice(reason.as_bytes()),
            Message::ConnectAck | Message::FrameStart | Message::EndOfFrame => {}
        }

        if payload.len() > MAX_WIRE_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let kind = self.kind() as u8;
        let len = (payload.len() as u16).to_le_bytes();
        let checksum = checksum(kind, len, &payload);

        let mut frame = BytesMut::with_capacity(WIRE_HEADER_BYTES + payload.len() + 1);
        frame.put_slice(&SYNC_MARKER);
        frame.put_u8(kind);
        frame.put_slice(&len);
        frame.put_slice(&payload);
        frame.put_u8(checksum);
        Ok(frame.freeze())
    }
}

/// Errors raised while decoding or encoding wire messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("Malformed {kind:?} payload: {reason}")]
    MalformedPayload { kind: MessageKind, reason: String },

    #[error("Line index {0} does not fit the 16-bit wire field")]
    LineIndexOverflow(u32),

    #[error("Payload of {0} bytes exceeds the wire limit")]
    PayloadTooLarge(usize),
}

fn checksum(kind: u8, len: [u8; 2], payload: &[u8]) -> u8 {
    payload.iter().fold(kind ^ len[0] ^ len[1], |acc, &b| acc ^ b)
}

fn parse_payload(kind: MessageKind, mut payload: Bytes) -> Result<Message, WireError> {
    match kind {
        MessageKind::ConnectAck => Ok(Message::ConnectAck),
        MessageKind::FrameStart => Ok(Message::FrameStart),
        MessageKind::EndOfFrame => Ok(Message::EndOfFrame),
        MessageKind::DeviceError => Ok(Message::Error(String::from_utf8_lossy(&payload).into_owned())),
        MessageKind::DataLine => {
            if payload.len() < 2 || payload.len() % 2 != 0 {
                return Err(WireError::MalformedPayload {
                    kind,
                    reason: format!("{} bytes is not a line index plus whole words", payload.len()),
                });
            }
            let index = u32::from(payload.get_u16_le());
            let mut words = Vec::with_capacity(payload.len() / 2);
            while payload.has_remaining() {
                words.push(payload.get_u16_le());
            }
            Ok(Message::DataLine(RawLine::new(index, words)))
        }
    }
}

/// Incremental decoder turning an arbitrary byte stream into messages
#[derive(Debug, Default)]
pub struct WireDecoder {
    buffer: BytesMut,
    skipped_bytes: u64,
    messages_decoded: u64,
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// (messages decoded, bytes skipped while hunting for a sync marker)
    pub fn stats(&self) -> (u64, u64) {
        (self.messages_decoded, self.skipped_bytes)
    }

    fn skip(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let preview = &self.buffer[..count.min(16)];
        debug!("Skipping {} bytes before sync marker: {}", count, hex::encode(preview));
        self.buffer.advance(count);
        self.skipped_bytes += count as u64;
    }

    /// Decode the next complete message, if one is buffered.
    ///
    /// A corrupt message is consumed and reported once; decoding can continue
    /// with the bytes that follow it.
    pub fn next_message(&mut self) -> Option<Result<Message, WireError>> {
        let start = self.buffer.windows(2).position(|w| w == SYNC_MARKER);
        match start {
            Some(start) => self.skip(start),
            None => {
                // Keep a trailing first marker byte, its partner may still arrive
                let keep = usize::from(self.buffer.last() == Some(&SYNC_MARKER[0]));
                self.skip(self.buffer.len() - keep);
                return None;
            }
        }

        if self.buffer.len() < WIRE_HEADER_BYTES {
            return None;
        }

        let kind_byte = self.buffer[2];
        let len = [self.buffer[3], self.buffer[4]];
        let payload_len = usize::from(u16::from_le_bytes(len));
        let total = WIRE_HEADER_BYTES + payload_len + 1;
        if self.buffer.len() < total {
            return None;
        }

        let mut frame = self.buffer.split_to(total).freeze();
        frame.advance(WIRE_HEADER_BYTES);
        let payload = frame.split_to(payload_len);
        let actual = frame[0];

        let expected = checksum(kind_byte, len, &payload);
        if expected != actual {
            return Some(Err(WireError::Checksum { expected, actual }));
        }

        let Some(kind) = MessageKind::from_u8(kind_byte) else {
            return Some(Err(WireError::UnknownKind(kind_byte)));
        };

        let message = parse_payload(kind, payload);
        if message.is_ok() {
            self.messages_decoded += 1;
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| m.encode().unwrap().to_vec())
            .collect()
    }

    fn drain(decoder: &mut WireDecoder) -> Vec<Result<Message, WireError>> {
        std::iter::from_fn(|| decoder.next_message()).collect()
    }

    #[test]
    fn test_frame_layout() {
        let bytes = Message::DataLine(RawLine::new(2, vec![0x7123])).encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[0xA5, 0x5A, 0x03, 0x04, 0x00, 0x02, 0x00, 0x23, 0x71, 0x03 ^ 0x04 ^ 0x02 ^ 0x23 ^ 0x71]
        );
    }

    #[test]
    fn test_decode_frame_sequence() {
        let messages = vec![
            Message::ConnectAck,
            Message::FrameStart,
            Message::DataLine(RawLine::new(0, vec![0x7001, 0x6002])),
            Message::DataLine(RawLine::new(1, vec![])),
            Message::EndOfFrame,
            Message::Error("lost sync".to_string()),
        ];
        let mut decoder = WireDecoder::new();
        decoder.push(&encoded(&messages));

        let decoded: Vec<Message> = drain(&mut decoder).into_iter().map(Result::unwrap).collect();
        assert_eq!(decoded, messages);
        assert_eq!(decoder.stats(), (6, 0));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut bytes = vec![0x00, 0xA5, 0x13, 0x5A, 0xFF];
        bytes.extend(encoded(&[Message::FrameStart]));

        let mut decoder = WireDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_message(), Some(Ok(Message::FrameStart)));
        assert_eq!(decoder.stats(), (1, 5));
    }

    #[test]
    fn test_message_split_across_pushes() {
        let bytes = encoded(&[Message::DataLine(RawLine::new(9, vec![1, 2, 3]))]);
        let mut decoder = WireDecoder::new();

        for chunk in bytes.chunks(3) {
            assert_eq!(decoder.next_message(), None);
            decoder.push(chunk);
        }
        assert_eq!(
            decoder.next_message(),
            Some(Ok(Message::DataLine(RawLine::new(9, vec![1, 2, 3]))))
        );
    }

    #[test]
    fn test_checksum_mismatch_reported() {
        let mut bytes = encoded(&[Message::EndOfFrame, Message::FrameStart]);
        bytes[5] ^= 0xFF;

        let mut decoder = WireDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(decoder.next_message(), Some(Err(WireError::Checksum { .. }))));
        // The corrupt message is consumed, the next one still decodes
        assert_eq!(decoder.next_message(), Some(Ok(Message::FrameStart)));
    }

    #[test]
    fn test_unknown_kind_and_odd_payload() {
        let unknown = [0xA5, 0x5A, 0x09, 0x00, 0x00, 0x09];
        let odd = [0xA5, 0x5A, 0x03, 0x01, 0x00, 0x07, 0x03 ^ 0x01 ^ 0x07];

        let mut decoder = WireDecoder::new();
        decoder.push(&unknown);
        decoder.push(&odd);
        assert_eq!(decoder.next_message(), Some(Err(WireError::UnknownKind(0x09))));
        assert!(matches!(
            decoder.next_message(),
            Some(Err(WireError::MalformedPayload { kind: MessageKind::DataLine, .. }))
        ));
    }

    #[test]
    fn test_line_index_overflow() {
        let line = Message::DataLine(RawLine::new(70_000, vec![]));
        assert_eq!(line.encode(), Err(WireError::LineIndexOverflow(70_000)));
    }
}
