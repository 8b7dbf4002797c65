/// Value the logical bytes of every valid frame must sum to.
pub const SENTINEL: u8 = 0xFF;

/// Running single-byte checksum.
///
/// The sum wraps modulo 256 and covers the command byte, every payload byte and the
/// trailing checksum byte, always over logical (unstuffed) values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksum(u8);

impl Checksum {
    /// Start an empty checksum.
    pub fn new() -> Self {
        Checksum(0)
    }

    /// Start a checksum seeded with the frame's command byte.
    pub fn seeded(command: u8) -> Self {
        Checksum(command)
    }

    pub fn push(&mut self, byte: u8) {
        self.0 = self.0.wrapping_add(byte);
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push(byte);
        }
    }

    /// Current running sum.
    pub fn sum(&self) -> u8 {
        self.0
    }

    /// Checksum byte which brings the running sum to `SENTINEL` once appended.
    pub fn trailer(&self) -> u8 {
        SENTINEL.wrapping_sub(self.0)
    }

    /// True if the bytes pushed so far, trailer included, sum to `SENTINEL`.
    pub fn is_valid(&self) -> bool {
        self.0 == SENTINEL
    }
}

#[test]
fn test_checksum_trailer() {
    // Read-identifier request with no payload.
    let mut ck = Checksum::seeded(0x9F);
    assert_eq!(ck.trailer(), 0x60);
    ck.push(0x60);
    assert!(ck.is_valid());

    // Sums wrap rather than saturate.
    let mut ck = Checksum::new();
    ck.extend(&[0xF0, 0x20, 0x30]);
    assert_eq!(ck.sum(), 0x40);
    assert_eq!(ck.trailer(), 0xBF);
    ck.push(ck.trailer());
    assert!(ck.is_valid());

    // A zero-sum seed needs a trailer of exactly 0xFF.
    assert_eq!(Checksum::seeded(0x00).trailer(), 0xFF);
    assert_eq!(Checksum::seeded(0xFF).trailer(), 0x00);
}
