//! Byte-stuffed, checksummed framing.
//!
//! A frame on the wire is `[FEND][command][payload...][checksum][FEND]`, where every
//! payload and checksum byte equal to `FEND` or `FESC` is replaced by a two byte
//! escape sequence. The command byte is sent verbatim.

use alloc::vec::Vec;

use crate::checksum::Checksum;
use crate::PAGE_SIZE;

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape prefix.
pub const FESC: u8 = 0xDB;
/// Follows `FESC` to stand for a literal `FEND`.
pub const TFEND: u8 = 0xDC;
/// Follows `FESC` to stand for a literal `FESC`.
pub const TFESC: u8 = 0xDD;

/// Largest frame either side sends: a read-page reply (2 address bytes and a page)
/// with every stuffable byte escaped, plus command and both delimiters.
pub const MAX_FRAME_LEN: usize = 2 + 1 + 2 * (2 + PAGE_SIZE + 1);

/// One decoded frame, borrowing its payload from the receive buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub command: u8,
    pub payload: &'a [u8],
    /// The trailing checksum byte, if the frame had anything after the command.
    pub checksum: Option<u8>,
    /// Whether the logical bytes summed to the checksum sentinel.
    pub valid: bool,
}

/// Decode one frame in place.
///
/// `buf` holds the received bytes, optionally starting with the opening `FEND`.
/// Scanning stops at the next `FEND` or the end of `buf`; anything after the closing
/// delimiter is ignored. Returns `None` if there is no command byte at all.
///
/// An escape followed by anything other than `TFEND`/`TFESC` is dropped without
/// marking the frame invalid, and `TFEND`/`TFESC` without a preceding escape decode
/// as themselves. Existing hosts rely on this leniency.
pub fn decode(buf: &mut [u8]) -> Option<Frame<'_>> {
    let start = if buf.first() == Some(&FEND) { 1 } else { 0 };
    let command = *buf.get(start)?;
    let mut checksum = Checksum::seeded(command);
    let mut escaped = false;

    // Unstuffing only ever shrinks the data, so the write index trails the read index.
    let body = start + 1;
    let mut len = body;
    for idx in body..buf.len() {
        let value = match buf[idx] {
            FEND => break,
            FESC => {
                escaped = true;
                continue;
            }
            TFEND if escaped => FEND,
            TFESC if escaped => FESC,
            byte => byte,
        };
        escaped = false;
        checksum.push(value);
        buf[len] = value;
        len += 1;
    }

    let interior = &buf[body..len];
    let (payload, trailer) = match interior.split_last() {
        Some((&trailer, payload)) => (payload, Some(trailer)),
        None => (interior, None),
    };
    log::trace!("Decoded frame 0x{:02X}: {} payload bytes, sum 0x{:02X}",
                command, payload.len(), checksum.sum());

    Some(Frame { command, payload, checksum: trailer, valid: checksum.is_valid() })
}

/// Builds outgoing frames into a reusable buffer.
///
/// The buffer grows as needed, so no payload can overrun it regardless of how many
/// bytes require escaping.
#[derive(Clone, Debug, Default)]
pub struct FrameEncoder {
    buf: Vec<u8>,
    checksum: Checksum,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FrameEncoder { buf: Vec::with_capacity(capacity), checksum: Checksum::new() }
    }

    /// Discard any previous frame and begin a new one with `command`.
    pub fn start(&mut self, command: u8) -> &mut Self {
        self.buf.clear();
        self.buf.push(FEND);
        self.buf.push(command);
        self.checksum = Checksum::seeded(command);
        self
    }

    /// Append one logical payload byte.
    pub fn push(&mut self, byte: u8) -> &mut Self {
        self.checksum.push(byte);
        self.stuff(byte);
        self
    }

    /// Append logical payload bytes.
    pub fn extend(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            self.push(byte);
        }
        self
    }

    /// Append the checksum and closing delimiter, returning the complete wire frame.
    pub fn finish(&mut self) -> &[u8] {
        let trailer = self.checksum.trailer();
        self.stuff(trailer);
        self.buf.push(FEND);
        &self.buf
    }

    fn stuff(&mut self, byte: u8) {
        match byte {
            FEND => self.buf.extend_from_slice(&[FESC, TFEND]),
            FESC => self.buf.extend_from_slice(&[FESC, TFESC]),
            _ => self.buf.push(byte),
        }
    }
}

/// Encode a complete frame for `command` and `payload` into a new buffer.
pub fn encode(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut encoder = FrameEncoder::with_capacity(4 + 2 * payload.len());
    encoder.start(command).extend(payload);
    encoder.finish().to_vec()
}

#[cfg(test)]
use alloc::vec;

/// Stuff an arbitrary logical byte sequence, whose first byte is the command.
#[cfg(test)]
fn stuff_logical(logical: &[u8]) -> Vec<u8> {
    let mut wire = vec![FEND, logical[0]];
    for &byte in &logical[1..] {
        match byte {
            FEND => wire.extend_from_slice(&[FESC, TFEND]),
            FESC => wire.extend_from_slice(&[FESC, TFESC]),
            _ => wire.push(byte),
        }
    }
    wire.push(FEND);
    wire
}

#[cfg(test)]
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed)).collect()
}

#[test]
fn test_round_trip() {
    let commands = [0x9F, 0xC7, 0xD8, 0x02, 0x03, 0x83, 0x44, 0x45, 0x00, 0xFF, FESC];
    let lengths = [0, 1, 2, 3, 17, 128, 253];
    for (n, &command) in commands.iter().enumerate() {
        for &len in lengths.iter() {
            let payload = pattern(len, n as u8);
            let mut wire = encode(command, &payload);
            let frame = decode(&mut wire).unwrap();
            assert_eq!(frame.command, command);
            assert_eq!(frame.payload, &payload[..]);
            assert!(frame.valid, "command {:02X} len {}", command, len);
        }
    }
}

#[test]
fn test_end_to_end_identifier_request() {
    assert_eq!(encode(0x9F, &[]), vec![0xC0, 0x9F, 0x60, 0xC0]);
    let mut wire = vec![0xC0, 0x9F, 0x60, 0xC0];
    let frame = decode(&mut wire).unwrap();
    assert_eq!(frame.command, 0x9F);
    assert!(frame.payload.is_empty());
    assert_eq!(frame.checksum, Some(0x60));
    assert!(frame.valid);
}

#[test]
fn test_single_byte_flip_invalidates() {
    let payload = [0x00, 0x05, 0xC0, 0xDB, 0x7E, 0xFF];
    let wire = encode(0x02, &payload);
    let mut logical = vec![0x02];
    logical.extend_from_slice(&payload);
    logical.push(decode(&mut wire.clone()).unwrap().checksum.unwrap());

    for idx in 0..logical.len() {
        for &mask in [0x01, 0x80, 0x5A].iter() {
            let mut corrupted = logical.clone();
            corrupted[idx] ^= mask;
            let mut wire = stuff_logical(&corrupted);
            let frame = decode(&mut wire).unwrap();
            assert!(!frame.valid, "flip at {} with mask {:02X}", idx, mask);
        }
    }
}

#[test]
fn test_escaping() {
    let payload = [FEND, 0x01, FESC, FESC, FEND, TFEND, TFESC];
    let mut wire = encode(0x03, &payload);
    assert_eq!(wire[0], FEND);
    assert_eq!(*wire.last().unwrap(), FEND);
    assert!(!wire[1..wire.len() - 1].contains(&FEND));
    assert_eq!(&wire[2..6], &[FESC, TFEND, 0x01, FESC]);

    let frame = decode(&mut wire).unwrap();
    assert_eq!(frame.payload, &payload[..]);
    assert!(frame.valid);
}

#[test]
fn test_checksum_needing_escape() {
    // 0xFF - 0x3F = 0xC0, so the trailer itself must be stuffed.
    let wire = encode(0x3F, &[]);
    assert_eq!(wire, vec![FEND, 0x3F, FESC, TFEND, FEND]);
    let mut wire = wire;
    let frame = decode(&mut wire).unwrap();
    assert_eq!(frame.checksum, Some(FEND));
    assert!(frame.valid);
}

#[test]
fn test_dangling_escape_is_tolerated() {
    // Escape followed by an ordinary byte: the escape is dropped, the byte kept,
    // and the frame still validates against the logical sum.
    let mut wire = vec![FEND, 0x03, 0x00, FESC, 0x07, 0xF5, FEND];
    let frame = decode(&mut wire).unwrap();
    assert_eq!(frame.payload, &[0x00, 0x07]);
    assert_eq!(frame.checksum, Some(0xF5));
    assert!(frame.valid);
}

#[test]
fn test_unescaped_transposed_codes() {
    // TFEND/TFESC outside an escape are ordinary data.
    let mut wire = vec![FEND, 0x03, TFEND, TFESC, 0x00, FEND];
    let sum = 0x03u8.wrapping_add(TFEND).wrapping_add(TFESC);
    wire[4] = 0xFFu8.wrapping_sub(sum);
    let frame = decode(&mut wire).unwrap();
    assert_eq!(frame.payload, &[TFEND, TFESC]);
    assert!(frame.valid);
}

#[test]
fn test_edge_cases() {
    assert_eq!(decode(&mut []), None);
    assert_eq!(decode(&mut [FEND]), None);

    // No closing delimiter: scan runs to the end of the buffer.
    let mut wire = vec![FEND, 0x9F, 0x60];
    assert!(decode(&mut wire).unwrap().valid);

    // Trailing bytes after the closing delimiter are ignored.
    let mut wire = vec![0x9F, 0x60, FEND, 0x12, 0x34];
    let frame = decode(&mut wire).unwrap();
    assert!(frame.payload.is_empty());
    assert!(frame.valid);

    // Truncated frame fails its checksum.
    let mut wire = encode(0x03, &[0x00, 0x05]);
    wire.truncate(3);
    assert!(!decode(&mut wire).unwrap().valid);

    // A lone command byte has no checksum.
    let mut wire = vec![0x9F, FEND];
    let frame = decode(&mut wire).unwrap();
    assert_eq!(frame.checksum, None);
    assert!(!frame.valid);
}

#[test]
fn test_encoder_reuse() {
    let mut encoder = FrameEncoder::new();
    encoder.start(0x45).extend(&[0x00, 0x07]);
    let first = encoder.finish().to_vec();
    encoder.start(0x45).extend(&[0x00, 0x07]);
    assert_eq!(encoder.finish(), &first[..]);
    assert_eq!(first, encode(0x45, &[0x00, 0x07]));
}

#[test]
fn test_worst_case_fits_max_len() {
    let page = vec![FEND; 2 + PAGE_SIZE];
    let wire = encode(0x03, &page);
    assert!(wire.len() <= MAX_FRAME_LEN);
}
