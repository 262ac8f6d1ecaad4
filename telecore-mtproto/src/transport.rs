//! Sans-IO transport framing.
//!
//! A [`Transport`] turns payloads into framed bytes and back. It never
//! touches a socket: the connection feeds it whatever the stream produced
//! and writes whatever it emits.
//!
//! | Transport         | Init bytes    | Frame                                  |
//! |-------------------|---------------|----------------------------------------|
//! | [`Abridged`]      | `ef`          | `len/4` (1 or 4 bytes) + payload       |
//! | [`Intermediate`]  | `ee ee ee ee` | `len` (LE u32) + payload               |
//! | [`Full`]          | none          | `len` + `seq` + payload + CRC-32       |

use std::fmt;

/// Frames larger than this are treated as corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors from decoding a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix is impossible (too short, misaligned or too large).
    BadLength { len: usize },
    /// A Full-transport frame failed its checksum.
    BadCrc { expected: u32, got: u32 },
    /// A Full-transport frame arrived out of order.
    BadSeq { expected: u32, got: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadLength { len } => write!(f, "bad frame length: {len}"),
            Self::BadCrc { expected, got } => {
                write!(f, "crc mismatch: expected {expected:#010x}, got {got:#010x}")
            }
            Self::BadSeq { expected, got } => {
                write!(f, "frame seq mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// A framing codec for one connection. Create a fresh value per socket.
pub trait Transport: Send + 'static {
    /// Bytes written once, before the first frame.
    fn init_bytes(&self) -> &'static [u8];

    /// Append the framed `payload` to `out`. `quick_ack` asks the server to
    /// acknowledge receipt as soon as the frame arrives.
    fn encode(&mut self, payload: &[u8], quick_ack: bool, out: &mut Vec<u8>);

    /// Remove one complete frame from the front of `input` and return its
    /// payload, or `Ok(None)` when more bytes are needed.
    fn decode(&mut self, input: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError>;

    /// Whether this transport can carry quick acknowledgments.
    fn supports_quick_ack(&self) -> bool {
        false
    }
}

fn take_frame(input: &mut Vec<u8>, header: usize, len: usize) -> Vec<u8> {
    let payload = input[header..header + len].to_vec();
    input.drain(..header + len);
    payload
}

// ─── Abridged ────────────────────────────────────────────────────────────────

/// [MTProto Abridged] framing.
///
/// [MTProto Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
#[derive(Clone, Debug, Default)]
pub struct Abridged;

impl Transport for Abridged {
    fn init_bytes(&self) -> &'static [u8] {
        &[0xef]
    }

    fn encode(&mut self, payload: &[u8], _quick_ack: bool, out: &mut Vec<u8>) {
        let words = payload.len() / 4;
        if words < 0x7f {
            out.push(words as u8);
        } else {
            out.extend([0x7f, words as u8, (words >> 8) as u8, (words >> 16) as u8]);
        }
        out.extend_from_slice(payload);
    }

    fn decode(&mut self, input: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(&first) = input.first() else { return Ok(None) };
        let (header, len) = if first < 0x7f {
            (1, first as usize * 4)
        } else {
            if input.len() < 4 {
                return Ok(None);
            }
            let words = input[1] as usize | (input[2] as usize) << 8 | (input[3] as usize) << 16;
            (4, words * 4)
        };
        if len > MAX_FRAME_LEN {
            return Err(FrameError::BadLength { len });
        }
        if input.len() < header + len {
            return Ok(None);
        }
        Ok(Some(take_frame(input, header, len)))
    }
}

// ─── Intermediate ─────────────────────────────────────────────────────────────

/// [MTProto Intermediate] framing.
///
/// With quick acks enabled, outgoing lengths carry the high bit and the
/// server answers such frames with a bare 4-byte token whose high bit is
/// also set. Those tokens are returned as 4-byte payloads.
///
/// [MTProto Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
#[derive(Clone, Debug, Default)]
pub struct Intermediate {
    quick_ack: bool,
}

impl Intermediate {
    pub fn new(quick_ack: bool) -> Self {
        Self { quick_ack }
    }
}

impl Transport for Intermediate {
    fn init_bytes(&self) -> &'static [u8] {
        &[0xee, 0xee, 0xee, 0xee]
    }

    fn encode(&mut self, payload: &[u8], quick_ack: bool, out: &mut Vec<u8>) {
        let mut len = payload.len() as u32;
        if quick_ack && self.quick_ack {
            len |= 0x8000_0000;
        }
        out.extend(len.to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn decode(&mut self, input: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError> {
        if input.len() < 4 {
            return Ok(None);
        }
        let raw = u32::from_le_bytes([input[0], input[1], input[2], input[3]]);
        if raw & 0x8000_0000 != 0 {
            return Ok(Some(take_frame(input, 0, 4)));
        }
        let len = raw as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::BadLength { len });
        }
        if input.len() < 4 + len {
            return Ok(None);
        }
        Ok(Some(take_frame(input, 4, len)))
    }

    fn supports_quick_ack(&self) -> bool {
        self.quick_ack
    }
}

// ─── Full ─────────────────────────────────────────────────────────────────────

/// [MTProto Full] framing: Intermediate plus a per-direction sequence number
/// and a CRC-32 over `len || seq || payload`.
///
/// [MTProto Full]: https://core.telegram.org/mtproto/mtproto-transports#full
#[derive(Clone, Debug, Default)]
pub struct Full {
    send_seq: u32,
    recv_seq: u32,
}

impl Full {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for Full {
    fn init_bytes(&self) -> &'static [u8] {
        &[]
    }

    fn encode(&mut self, payload: &[u8], _quick_ack: bool, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend(((payload.len() + 12) as u32).to_le_bytes());
        out.extend(self.send_seq.to_le_bytes());
        out.extend_from_slice(payload);
        let crc = crc32_ieee(&out[start..]);
        out.extend(crc.to_le_bytes());
        self.send_seq = self.send_seq.wrapping_add(1);
    }

    fn decode(&mut self, input: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError> {
        if input.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if !(12..=MAX_FRAME_LEN).contains(&len) {
            return Err(FrameError::BadLength { len });
        }
        if input.len() < len {
            return Ok(None);
        }

        let (body, crc_bytes) = input[..len].split_at(len - 4);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let got = crc32_ieee(body);
        if got != expected {
            return Err(FrameError::BadCrc { expected, got });
        }
        let seq = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        if seq != self.recv_seq {
            return Err(FrameError::BadSeq { expected: self.recv_seq, got: seq });
        }
        self.recv_seq = self.recv_seq.wrapping_add(1);

        let payload = take_frame(input, 8, len - 12);
        // take_frame drained header + payload; the CRC is still at the front.
        input.drain(..4);
        Ok(Some(payload))
    }
}

/// CRC-32 with the IEEE 802.3 polynomial.
fn crc32_ieee(data: &[u8]) -> u32 {
    const POLY: u32 = 0xedb88320;
    let mut crc: u32 = 0xffffffff;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_reference_value() {
        assert_eq!(crc32_ieee(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn abridged_long_header() {
        let payload = vec![1u8; 0x7f * 4];
        let mut out = Vec::new();
        Abridged.encode(&payload, false, &mut out);
        assert_eq!(&out[..4], &[0x7f, 0x7f, 0, 0]);

        let mut t = Abridged;
        assert_eq!(t.decode(&mut out).unwrap(), Some(payload));
        assert!(out.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let mut t = Intermediate::new(false);
        let mut out = Vec::new();
        t.encode(&[9u8; 8], false, &mut out);
        let mut partial = out[..6].to_vec();
        assert_eq!(t.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&out[6..]);
        assert_eq!(t.decode(&mut partial).unwrap(), Some(vec![9u8; 8]));
    }

    #[test]
    fn intermediate_quick_ack_bit() {
        let mut t = Intermediate::new(true);
        let mut out = Vec::new();
        t.encode(&[0u8; 4], true, &mut out);
        assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), 0x8000_0004);

        // A bare token from the server comes back as a 4-byte payload.
        let mut input = 0x8123_4567u32.to_le_bytes().to_vec();
        input.extend([4, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(t.decode(&mut input).unwrap(), Some(0x8123_4567u32.to_le_bytes().to_vec()));
        assert_eq!(t.decode(&mut input).unwrap(), Some(vec![1, 2, 3, 4]));

        let mut plain = Intermediate::new(false);
        let mut out = Vec::new();
        plain.encode(&[0u8; 4], true, &mut out);
        assert_eq!(&out[..4], &[4, 0, 0, 0]);
    }

    #[test]
    fn full_checks_crc_and_sequence() {
        let mut client = Full::new();
        let mut server = Full::new();
        let mut wire = Vec::new();
        client.encode(&[1, 2, 3, 4], false, &mut wire);
        client.encode(&[5, 6, 7, 8], false, &mut wire);
        assert_eq!(server.decode(&mut wire).unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(server.decode(&mut wire).unwrap(), Some(vec![5, 6, 7, 8]));
        assert!(wire.is_empty());

        let mut corrupt = Vec::new();
        Full::new().encode(&[1, 2, 3, 4], false, &mut corrupt);
        corrupt[9] ^= 0xff;
        assert!(matches!(Full::new().decode(&mut corrupt), Err(FrameError::BadCrc { .. })));

        let mut replay = Vec::new();
        Full::new().encode(&[1, 2, 3, 4], false, &mut replay);
        assert_eq!(server.decode(&mut replay), Err(FrameError::BadSeq { expected: 2, got: 0 }));
    }
}
