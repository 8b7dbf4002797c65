/// Store the JEDEC ID read off an SPI flash memory with the 0x9F command.
///
/// The three bytes are the manufacturer ID, the memory type, and the capacity
/// code, which on most parts is log2 of the capacity in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashId {
    pub manufacturer_id: u8,
    pub memory_type: u8,
    pub capacity_code: u8,
}

impl FlashId {
    pub fn from_bytes(id: [u8; 3]) -> Self {
        FlashId { manufacturer_id: id[0], memory_type: id[1], capacity_code: id[2] }
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [self.manufacturer_id, self.memory_type, self.capacity_code]
    }

    /// Capacity in bytes, if the capacity code is a plausible power of two
    /// between 64KiB and 4GiB.
    pub fn capacity(&self) -> Option<u64> {
        match self.capacity_code {
            0x10..=0x20 => Some(1 << self.capacity_code),
            _ => None,
        }
    }

    /// Number of 256-byte pages, if the capacity is known and fits 16-bit page numbers.
    pub fn pages(&self) -> Option<u32> {
        self.capacity()
            .map(|bytes| bytes / crate::PAGE_SIZE as u64)
            .filter(|&pages| pages <= 0x1_0000)
            .map(|pages| pages as u32)
    }

    /// Look up a manufacturer name from the JEDEC ID.
    #[cfg(feature = "std")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        // Only bank 0 IDs are visible without continuation codes.
        match jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            // GigaDevice flash doesn't use a continuation code, so 0xC8 appears as Apple Computer.
            Some(mfn) if mfn == "Apple Computer" => Some("Apple Computer/GigaDevice Semiconductor"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for FlashId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        let capacity = match self.capacity() {
            Some(bytes) if bytes >= 1 << 20 => format!(", {}MiB", bytes >> 20),
            Some(bytes) => format!(", {}KiB", bytes >> 10),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Type 0x{:02X}, Capacity 0x{:02X}{}",
               self.manufacturer_id, mfn, self.memory_type, self.capacity_code, capacity)
    }
}

#[test]
fn test_flash_id_capacity() {
    // Winbond W25Q16: 2MiB.
    let id = FlashId::from_bytes([0xEF, 0x40, 0x15]);
    assert_eq!(id.capacity(), Some(2 * 1024 * 1024));
    assert_eq!(id.pages(), Some(crate::DEFAULT_TOTAL_PAGES));
    assert_eq!(id.to_bytes(), [0xEF, 0x40, 0x15]);

    // 16MiB is the most 16-bit page numbers reach.
    assert_eq!(FlashId::from_bytes([0xEF, 0x40, 0x18]).pages(), Some(0x1_0000));
    assert_eq!(FlashId::from_bytes([0xEF, 0x40, 0x19]).pages(), None);

    // No device present.
    assert_eq!(FlashId::from_bytes([0xFF, 0xFF, 0xFF]).capacity(), None);
    assert_eq!(FlashId::from_bytes([0x00, 0x00, 0x00]).pages(), None);
}

#[cfg(feature = "std")]
#[test]
fn test_flash_id_display() {
    let id = FlashId::from_bytes([0xEF, 0x40, 0x15]);
    assert!(id.manufacturer_name().is_some());
    let s = id.to_string();
    assert!(s.starts_with("Manufacturer 0xEF ("));
    assert!(s.ends_with(", Type 0x40, Capacity 0x15, 2MiB"));
}
