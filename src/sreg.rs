/// Status Register 1
#[derive(Copy, Clone, Debug)]
pub struct StatusRegister1(pub u8);

impl StatusRegister1 {
    /// Get BUSY bit.
    pub fn get_busy(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }
}

#[test]
fn test_status_register1() {
    assert!(StatusRegister1(0x01).get_busy());
    assert!(!StatusRegister1(0x01).get_wel());
    assert!(StatusRegister1(0x02).get_wel());
    assert!(!StatusRegister1(0xFC).get_busy());
}
