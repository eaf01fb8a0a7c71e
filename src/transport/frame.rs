//! WebSocket framing.
//!
//! Frame layout (RFC 6455 section 5.2):
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key, if MASK set  |          Payload data         |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! [`FrameReader`] turns a byte stream from the server into complete
//! [`Message`]s, reassembling fragmented data messages and enforcing the
//! protocol rules that apply to server-to-client frames.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away; also reported for an empty close payload.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// No close frame was received; never sent on the wire.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Message too large.
pub const CLOSE_TOO_BIG: u16 = 1009;

const FIN_BIT: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7f;
const LEN_U16: u8 = 126;
const LEN_U64: u8 = 127;

// ============================================================================
// OpCode
// ============================================================================

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text message.
    Text = 0x1,
    /// Binary message.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xa,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xa => Ok(Self::Pong),
            other => Err(Error::protocol(format!("unknown opcode {other:#x}"))),
        }
    }
}

// ============================================================================
// FrameHeader
// ============================================================================

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message.
    pub fin: bool,
    /// Reserved bits, shifted down to `0..=7`.
    pub rsv: u8,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Masking key, present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
    /// Payload length in bytes.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Creates an unfragmented header with no reserved bits.
    #[must_use]
    pub const fn new(opcode: OpCode, mask: Option<[u8; 4]>, payload_len: u64) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            mask,
            payload_len,
        }
    }

    /// Returns the encoded header size.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        let len = match self.payload_len {
            0..=125 => 2,
            126..=0xffff => 4,
            _ => 10,
        };
        if self.mask.is_some() { len + 4 } else { len }
    }

    /// Appends the encoded header to `buf`, using the shortest length form.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut b0 = (self.rsv << 4) & RSV_MASK | self.opcode as u8;
        if self.fin {
            b0 |= FIN_BIT;
        }
        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };

        buf.push(b0);
        match self.payload_len {
            // Bounded by the match arms.
            len @ 0..=125 => buf.push(mask_bit | len as u8),
            len @ 126..=0xffff => {
                buf.push(mask_bit | LEN_U16);
                buf.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                buf.push(mask_bit | LEN_U64);
                buf.extend_from_slice(&len.to_be_bytes());
            }
        }
        if let Some(key) = self.mask {
            buf.extend_from_slice(&key);
        }
    }

    /// Decodes a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the header
    /// and the number of bytes it occupies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for unknown opcodes or a 64-bit length
    /// with the most significant bit set.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let [b0, b1, rest @ ..] = buf else {
            return Ok(None);
        };

        let opcode = OpCode::try_from(b0 & OPCODE_MASK)?;
        let fin = b0 & FIN_BIT != 0;
        let rsv = (b0 & RSV_MASK) >> 4;
        let masked = b1 & MASK_BIT != 0;

        let (payload_len, len_bytes) = match b1 & LEN_MASK {
            LEN_U16 => match rest {
                [a, b, ..] => (u64::from(u16::from_be_bytes([*a, *b])), 2),
                _ => return Ok(None),
            },
            LEN_U64 => {
                let Some(bytes) = rest.get(..8) else {
                    return Ok(None);
                };
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(Error::protocol("payload length has the high bit set"));
                }
                (len, 8)
            }
            len => (u64::from(len), 0),
        };

        let mut consumed = 2 + len_bytes;
        let mask = if masked {
            let Some(key) = buf.get(consumed..consumed + 4) else {
                return Ok(None);
            };
            consumed += 4;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        Ok(Some((
            Self {
                fin,
                rsv,
                opcode,
                mask,
                payload_len,
            },
            consumed,
        )))
    }
}

// ============================================================================
// Masking
// ============================================================================

/// XORs `buf` with the masking key. Applying it twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let word = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    for (byte, key) in chunks.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}

/// Encodes a complete client frame with a fresh random mask.
#[must_use]
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    encode_frame_with_mask(opcode, payload, rand::random())
}

/// Encodes a complete client frame with the given mask.
#[must_use]
pub fn encode_frame_with_mask(opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let header = FrameHeader::new(opcode, Some(mask), payload.len() as u64);
    let mut buf = Vec::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut buf);

    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], mask);
    buf
}

// ============================================================================
// Close Payload
// ============================================================================

/// Encodes a close payload: big-endian code followed by a UTF-8 reason.
///
/// The reason is truncated on a character boundary to fit a control frame.
#[must_use]
pub fn encode_close(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Decodes a close payload. An empty payload means `(1001, "")`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for a one-byte payload or a non-UTF-8 reason.
pub fn decode_close(payload: &[u8]) -> Result<(u16, String)> {
    match payload {
        [] => Ok((CLOSE_GOING_AWAY, String::new())),
        [_] => Err(Error::protocol("close payload is one byte long")),
        [hi, lo, reason @ ..] => {
            let reason = std::str::from_utf8(reason)
                .map_err(|_| Error::protocol("close reason is not valid UTF-8"))?;
            Ok((u16::from_be_bytes([*hi, *lo]), reason.to_string()))
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// A complete message read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Binary data message.
    Binary(Vec<u8>),
    /// Text data message, not validated.
    Text(Vec<u8>),
    /// Ping with its application data.
    Ping(Vec<u8>),
    /// Pong with its application data.
    Pong(Vec<u8>),
    /// Close with status code and reason.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

// ============================================================================
// FrameReader
// ============================================================================

/// Incremental decoder for the server-to-client frame stream.
///
/// Bytes are appended with [`feed`](Self::feed); complete messages are pulled
/// with [`next_message`](Self::next_message). Control frames that arrive
/// between the fragments of a data message are returned immediately while
/// the partial message is kept.
pub struct FrameReader {
    buf: Vec<u8>,
    partial: Option<(OpCode, Vec<u8>)>,
    max_message_size: usize,
}

impl FrameReader {
    /// Creates a reader that rejects messages above `max_message_size` bytes.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            partial: None,
            max_message_size,
        }
    }

    /// Appends received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the number of buffered, undecoded bytes.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete message, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on any framing violation. The reader must
    /// not be used after an error.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            let Some((header, header_len)) = FrameHeader::decode(&self.buf)? else {
                return Ok(None);
            };
            self.check_header(&header)?;

            // check_header bounds the length by max_message_size.
            let payload_len = header.payload_len as usize;
            if self.buf.len() < header_len + payload_len {
                return Ok(None);
            }
            let payload: Vec<u8> = self.buf.drain(..header_len + payload_len).skip(header_len).collect();

            if let Some(message) = self.assemble(header, payload)? {
                return Ok(Some(message));
            }
        }
    }

    fn check_header(&self, header: &FrameHeader) -> Result<()> {
        if header.rsv != 0 {
            return Err(Error::protocol("reserved bits set without an extension"));
        }
        if header.mask.is_some() {
            return Err(Error::protocol("server frame is masked"));
        }
        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::protocol("fragmented control frame"));
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(Error::protocol(format!(
                    "control frame payload of {} bytes",
                    header.payload_len
                )));
            }
            return Ok(());
        }

        let buffered = self.partial.as_ref().map_or(0, |(_, data)| data.len()) as u64;
        if buffered + header.payload_len > self.max_message_size as u64 {
            return Err(Error::protocol(format!(
                "message exceeds {} bytes",
                self.max_message_size
            )));
        }
        Ok(())
    }

    fn assemble(&mut self, header: FrameHeader, payload: Vec<u8>) -> Result<Option<Message>> {
        match header.opcode {
            OpCode::Close => {
                let (code, reason) = decode_close(&payload)?;
                Ok(Some(Message::Close { code, reason }))
            }
            OpCode::Ping => Ok(Some(Message::Ping(payload))),
            OpCode::Pong => Ok(Some(Message::Pong(payload))),
            OpCode::Continuation => {
                let Some((_, data)) = self.partial.as_mut() else {
                    return Err(Error::protocol("continuation frame without a message"));
                };
                data.extend_from_slice(&payload);
                if !header.fin {
                    return Ok(None);
                }
                Ok(self
                    .partial
                    .take()
                    .map(|(opcode, data)| data_message(opcode, data)))
            }
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    return Err(Error::protocol("data frame inside a fragmented message"));
                }
                if header.fin {
                    return Ok(Some(data_message(header.opcode, payload)));
                }
                self.partial = Some((header.opcode, payload));
                Ok(None)
            }
        }
    }
}

fn data_message(opcode: OpCode, data: Vec<u8>) -> Message {
    if opcode == OpCode::Text {
        Message::Text(data)
    } else {
        Message::Binary(data)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Builds an unmasked server frame.
    fn server_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut header = FrameHeader::new(opcode, None, payload.len() as u64);
        header.fin = fin;
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_header_length_forms() {
        for (len, expected) in [(0u64, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let header = FrameHeader::new(OpCode::Binary, None, len);
            let mut buf = Vec::new();
            header.encode(&mut buf);
            assert_eq!(buf.len(), expected, "length {len}");
            assert_eq!(header.encoded_len(), expected);
            assert_eq!(FrameHeader::decode(&buf).expect("decode"), Some((header, expected)));
        }
    }

    #[test]
    fn test_masked_frame_roundtrip() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        for len in [0usize, 125, 126, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame_with_mask(OpCode::Binary, &payload, mask);

            let (header, header_len) = FrameHeader::decode(&frame).expect("decode").expect("complete");
            assert!(header.fin);
            assert_eq!(header.mask, Some(mask));
            assert_eq!(header.payload_len, len as u64);

            let mut body = frame[header_len..].to_vec();
            apply_mask(&mut body, mask);
            assert_eq!(body, payload);
        }
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7: single-frame masked text "Hello".
        let frame = encode_frame_with_mask(OpCode::Text, b"Hello", [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(
            frame,
            [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let frame = encode_frame_with_mask(OpCode::Binary, &[0u8; 300], [1, 2, 3, 4]);
        for cut in 0..8 {
            assert_eq!(FrameHeader::decode(&frame[..cut]).expect("partial"), None);
        }
        assert!(FrameHeader::decode(&frame[..8]).expect("decode").is_some());
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(FrameHeader::decode(&[0x83, 0x00]).is_err());
        assert!(OpCode::try_from(0xb).is_err());
    }

    #[test]
    fn test_close_payload() {
        assert_eq!(decode_close(&[]).expect("empty"), (1001, String::new()));
        assert!(decode_close(&[0x03]).is_err());
        assert!(decode_close(&[0x03, 0xe8, 0xff]).is_err());

        let payload = encode_close(CLOSE_NORMAL, "bye");
        assert_eq!(decode_close(&payload).expect("close"), (1000, "bye".to_string()));

        let long = "é".repeat(100);
        let payload = encode_close(CLOSE_GOING_AWAY, &long);
        assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(decode_close(&payload).is_ok());
    }

    #[test]
    fn test_reader_single_message() {
        let mut reader = FrameReader::new(1024);
        reader.feed(&server_frame(true, OpCode::Binary, b"abc"));
        assert_eq!(
            reader.next_message().expect("ok"),
            Some(Message::Binary(b"abc".to_vec()))
        );
        assert_eq!(reader.next_message().expect("ok"), None);
    }

    #[test]
    fn test_reader_byte_by_byte() {
        let mut bytes = server_frame(true, OpCode::Binary, &[9u8; 200]);
        bytes.extend(server_frame(true, OpCode::Ping, b"hi"));

        let mut reader = FrameReader::new(1024);
        let mut messages = Vec::new();
        for byte in bytes {
            reader.feed(&[byte]);
            while let Some(message) = reader.next_message().expect("ok") {
                messages.push(message);
            }
        }
        assert_eq!(
            messages,
            vec![Message::Binary(vec![9u8; 200]), Message::Ping(b"hi".to_vec())]
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_fragments_with_interleaved_ping() {
        let mut reader = FrameReader::new(1024);
        reader.feed(&server_frame(false, OpCode::Binary, b"he"));
        reader.feed(&server_frame(true, OpCode::Ping, b"p"));
        reader.feed(&server_frame(false, OpCode::Continuation, b"ll"));
        reader.feed(&server_frame(true, OpCode::Continuation, b"o"));

        assert_eq!(
            reader.next_message().expect("ok"),
            Some(Message::Ping(b"p".to_vec()))
        );
        assert_eq!(
            reader.next_message().expect("ok"),
            Some(Message::Binary(b"hello".to_vec()))
        );
    }

    #[test]
    fn test_reader_close() {
        let mut reader = FrameReader::new(1024);
        reader.feed(&server_frame(true, OpCode::Close, &encode_close(1000, "done")));
        assert_eq!(
            reader.next_message().expect("ok"),
            Some(Message::Close {
                code: 1000,
                reason: "done".to_string()
            })
        );
    }

    #[test]
    fn test_reader_protocol_faults() {
        let cases: Vec<Vec<u8>> = vec![
            // reserved bit
            {
                let mut f = server_frame(true, OpCode::Binary, b"x");
                f[0] |= 0x40;
                f
            },
            // masked server frame
            encode_frame_with_mask(OpCode::Binary, b"x", [1, 2, 3, 4]),
            // fragmented control frame
            server_frame(false, OpCode::Ping, b"x"),
            // oversized control frame
            server_frame(true, OpCode::Pong, &[0u8; 126]),
            // continuation with nothing to continue
            server_frame(true, OpCode::Continuation, b"x"),
            // data frame inside a fragmented message
            [
                server_frame(false, OpCode::Binary, b"a"),
                server_frame(true, OpCode::Binary, b"b"),
            ]
            .concat(),
            // message above the limit
            server_frame(true, OpCode::Binary, &[0u8; 64]),
        ];

        for (index, bytes) in cases.into_iter().enumerate() {
            let mut reader = FrameReader::new(32);
            reader.feed(&bytes);
            let result = reader.next_message();
            assert!(
                matches!(result, Err(Error::Protocol { .. })),
                "case {index}: {result:?}"
            );
        }
    }

    #[test]
    fn test_reader_limit_spans_fragments() {
        let mut reader = FrameReader::new(8);
        reader.feed(&server_frame(false, OpCode::Binary, &[0u8; 6]));
        reader.feed(&server_frame(true, OpCode::Continuation, &[0u8; 6]));
        assert!(reader.next_message().is_err());
    }

    proptest! {
        #[test]
        fn test_mask_twice_restores(data in proptest::collection::vec(any::<u8>(), 0..512), mask in any::<[u8; 4]>()) {
            let mut buf = data.clone();
            apply_mask(&mut buf, mask);
            apply_mask(&mut buf, mask);
            prop_assert_eq!(buf, data);
        }

        #[test]
        fn test_mask_matches_bytewise(data in proptest::collection::vec(any::<u8>(), 0..64), mask in any::<[u8; 4]>()) {
            let mut fast = data.clone();
            apply_mask(&mut fast, mask);
            let slow: Vec<u8> = data.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
            prop_assert_eq!(fast, slow);
        }

        #[test]
        fn test_header_encode_decode_agree(
            fin in any::<bool>(),
            opcode in prop_oneof![
                Just(OpCode::Continuation),
                Just(OpCode::Text),
                Just(OpCode::Binary),
                Just(OpCode::Close),
                Just(OpCode::Ping),
                Just(OpCode::Pong),
            ],
            mask in proptest::option::of(any::<[u8; 4]>()),
            payload_len in prop_oneof![0u64..200, 60_000u64..70_000, 0u64..(1 << 40)],
        ) {
            let header = FrameHeader { fin, rsv: 0, opcode, mask, payload_len };
            let mut buf = Vec::new();
            header.encode(&mut buf);
            prop_assert_eq!(buf.len(), header.encoded_len());
            prop_assert_eq!(FrameHeader::decode(&buf).expect("decode"), Some((header, buf.len())));
        }
    }
}
