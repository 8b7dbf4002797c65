//! Standard SPI NOR flash driven over a CS-framed SPI exchange.

use alloc::vec::Vec;
use core::time::Duration;

use crate::sreg::StatusRegister1;
use crate::{AnyhowResult, Error, FlashCapability, Page, Result, PAGE_SIZE};

/// Trait for objects which provide access to SPI flash.
///
/// Providers only need to implement `exchange()`, which asserts CS, writes all the bytes
/// in `data`, then returns all the received bytes. If it provides a performance optimisation,
/// providers may also implement `write()`, which does not require the received data.
pub trait FlashAccess {
    /// Assert CS, write all bytes in `data` to the SPI bus, then de-assert CS.
    fn write(&mut self, data: &[u8]) -> AnyhowResult<()> {
        // Default implementation uses `exchange()` and ignores the result data.
        self.exchange(data)?;
        Ok(())
    }

    /// Assert CS, write all bytes in `data` while capturing received data, then de-assert CS.
    ///
    /// Returns the received data.
    fn exchange(&mut self, data: &[u8]) -> AnyhowResult<Vec<u8>>;

    fn sleep(&mut self, dur: Duration);
}

/// SPI Flash.
///
/// Implements `FlashCapability` for common 3-byte-address SPI NOR flashes
/// with 256-byte pages and a 64KiB block erase instruction.
pub struct SpiFlash<'a, A: FlashAccess> {
    access: &'a mut A,

    /// Time to sleep between busy polls, if any.
    poll_interval: Option<Duration>,
}

impl<'a, A: FlashAccess> SpiFlash<'a, A> {
    /// Create a new SpiFlash instance using the given FlashAccess provider.
    pub fn new(access: &'a mut A) -> Self {
        SpiFlash { access, poll_interval: None }
    }

    /// Get the time slept between busy polls.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    /// Set the time to sleep between busy polls.
    ///
    /// By default the status register is polled continuously; on slow
    /// links or during long erases a short sleep reduces bus traffic.
    pub fn set_poll_interval(&mut self, interval: Option<Duration>) {
        self.poll_interval = interval;
    }

    /// Power up the flash.
    ///
    /// Returns the legacy device ID.
    pub fn release_power_down(&mut self) -> Result<u8> {
        log::debug!("Sending Release Powerdown command");
        let data = self.exchange(Opcode::ReleasePowerdown, &[0, 0, 0], 1)?;
        Ok(data[0])
    }

    /// Power down the flash.
    pub fn power_down(&mut self) -> Result<()> {
        log::debug!("Sending Powerdown command");
        self.command(Opcode::Powerdown)
    }

    /// Reads the JEDEC manufacturer ID, memory type and capacity bytes.
    pub fn read_jedec_id(&mut self) -> Result<[u8; 3]> {
        let data = self.exchange(Opcode::ReadJEDECID, &[], 3)?;
        let mut id = [0u8; 3];
        id.copy_from_slice(&data[..3]);
        Ok(id)
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let param = self.make_address(address);
        self.exchange(Opcode::ReadData, &param, length)
    }

    /// Erase entire flash chip.
    ///
    /// Returns only after erase operation is complete.
    pub fn erase(&mut self) -> Result<()> {
        self.write_enable()?;
        self.command(Opcode::ChipErase)?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// Erase the 64KiB block containing `address`.
    ///
    /// Returns only after erase operation is complete.
    pub fn erase_block(&mut self, address: u32) -> Result<()> {
        log::trace!("Erasing 64KiB block at 0x{:06X}", address);
        let addr = self.make_address(address);
        self.write_enable()?;
        self.write(Opcode::BlockErase64K, &addr)?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// Program up to one page of data.
    ///
    /// This method sets the write-enable latch and then waits for programming to complete.
    /// Note that this does *not* erase the flash beforehand.
    pub fn page_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut tx = self.make_address(address);
        tx.extend(data);
        self.write_enable()?;
        self.exchange(Opcode::PageProgram, &tx, 0)?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    pub fn write_enable(&mut self) -> Result<()> {
        self.command(Opcode::WriteEnable)?;
        let s1 = self.read_status1()?;
        if !s1.get_wel() {
            log::warn!("WEL not set after WriteEnable, status 0x{:02X}; flash may be protected",
                       s1.0);
        }
        Ok(())
    }

    /// Read status register 1.
    pub fn read_status1(&mut self) -> Result<StatusRegister1> {
        self.exchange(Opcode::ReadStatusRegister1, &[], 1).map(|data| StatusRegister1(data[0]))
    }

    /// Check if the device is currently busy performing an operation.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.read_status1().map(|status| status.get_busy())
    }

    /// Wait until the device stops being busy.
    pub fn wait_while_busy(&mut self) -> Result<()> {
        while self.is_busy()? {
            if let Some(interval) = self.poll_interval {
                self.access.sleep(interval);
            }
        }
        Ok(())
    }

    /// Writes `command` and `data` to the flash memory, then returns `nbytes` of response.
    pub fn exchange<C: Into<u8>>(&mut self, command: C, data: &[u8], nbytes: usize)
        -> Result<Vec<u8>>
    {
        let mut tx = alloc::vec![command.into()];
        tx.extend(data);
        log::trace!("SPI exchange: write {:02X?}, read {} bytes", &tx, nbytes);
        tx.extend(alloc::vec![0u8; nbytes]);
        let rx = self.access.exchange(&tx)?;
        if rx.len() < tx.len() {
            log::warn!("SPI exchange returned {} bytes, expected {}", rx.len(), tx.len());
            #[cfg(feature = "std")]
            return Err(Error::Access(anyhow::anyhow!("SPI exchange returned {} of {} bytes",
                                                     rx.len(), tx.len())));
            #[cfg(not(feature = "std"))]
            return Err(Error::Access);
        }
        log::trace!("SPI exchange: read {:02X?}", &rx[1+data.len()..]);
        Ok(rx[1+data.len()..].to_vec())
    }

    /// Writes `command` and `data` to the flash memory, without reading the response.
    pub fn write<C: Into<u8>>(&mut self, command: C, data: &[u8]) -> Result<()> {
        let mut tx = alloc::vec![command.into()];
        tx.extend(data);
        log::trace!("SPI write: {:02X?}", &tx);
        self.access.write(&tx)?;
        Ok(())
    }

    /// Convenience method for issuing a single command and not caring about the returned data
    pub fn command<C: Into<u8>>(&mut self, command: C) -> Result<()> {
        self.write(command, &[])?;
        Ok(())
    }

    /// Generate a 3-byte big-endian address.
    fn make_address(&self, addr: u32) -> Vec<u8> {
        addr.to_be_bytes()[1..].to_vec()
    }
}

impl<'a, A: FlashAccess> FlashCapability for SpiFlash<'a, A> {
    fn power_up(&mut self) -> AnyhowResult<()> {
        let legacy_id = self.release_power_down()?;
        log::trace!("Legacy device ID 0x{:02X}", legacy_id);
        Ok(())
    }

    fn power_down(&mut self) -> AnyhowResult<()> {
        Ok(SpiFlash::power_down(self)?)
    }

    fn read_identifier(&mut self) -> AnyhowResult<[u8; 3]> {
        Ok(self.read_jedec_id()?)
    }

    fn erase_chip(&mut self) -> AnyhowResult<()> {
        Ok(self.erase()?)
    }

    fn erase_block_64k(&mut self, address: u32) -> AnyhowResult<()> {
        Ok(self.erase_block(address)?)
    }

    fn read_page(&mut self, page: u16) -> AnyhowResult<Page> {
        let data = self.read((page as u32) << 8, PAGE_SIZE)?;
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(&data);
        Ok(page)
    }

    fn write_page(&mut self, page: u16, data: &Page) -> AnyhowResult<()> {
        Ok(self.page_program((page as u32) << 8, data)?)
    }
}

/// SPI flash command opcodes used by the programmer.
///
/// These are taken from the Winbond W25Q16JV datasheet, but are
/// widely applicable.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
enum Opcode {
    WriteEnable = 0x06,
    ReadData = 0x03,
    PageProgram = 0x02,
    ReadStatusRegister1 = 0x05,
    ReadJEDECID = 0x9F,
    Powerdown = 0xB9,
    ReleasePowerdown = 0xAB,
    ChipErase = 0xC7,
    BlockErase64K = 0xD8,
}

#[cfg(test)]
use alloc::vec;

/// Answers like a W25Q16 that is never busy, recording every transaction.
#[cfg(test)]
#[derive(Default)]
struct MockAccess {
    transactions: Vec<Vec<u8>>,
    sleeps: usize,
    busy_polls: usize,
}

#[cfg(test)]
impl FlashAccess for MockAccess {
    fn exchange(&mut self, data: &[u8]) -> AnyhowResult<Vec<u8>> {
        self.transactions.push(data.to_vec());
        let mut rx = vec![0u8; data.len()];
        match data[0] {
            0x05 if self.busy_polls > 0 => {
                self.busy_polls -= 1;
                rx[1] = 0x03;
            },
            0x05 => rx[1] = 0x02,
            0x9F => rx[1..4].copy_from_slice(&[0xEF, 0x40, 0x15]),
            0xAB => rx[4] = 0x14,
            0x03 => {
                for (i, x) in rx[4..].iter_mut().enumerate() {
                    *x = i as u8;
                }
            },
            _ => (),
        }
        Ok(rx)
    }

    fn sleep(&mut self, _dur: Duration) {
        self.sleeps += 1;
    }
}

#[test]
fn test_identify_and_power() {
    let mut access = MockAccess::default();
    let mut flash = SpiFlash::new(&mut access);
    flash.power_up().unwrap();
    assert_eq!(flash.read_identifier().unwrap(), [0xEF, 0x40, 0x15]);
    FlashCapability::power_down(&mut flash).unwrap();
    assert_eq!(access.transactions, vec![
        vec![0xAB, 0, 0, 0, 0],
        vec![0x9F, 0, 0, 0],
        vec![0xB9],
    ]);
}

#[test]
fn test_read_page() {
    let mut access = MockAccess::default();
    let mut flash = SpiFlash::new(&mut access);
    let page = flash.read_page(0x0102).unwrap();
    assert_eq!(page[0], 0);
    assert_eq!(page[255], 255);
    assert_eq!(&access.transactions[0][..4], &[0x03, 0x01, 0x02, 0x00]);
    assert_eq!(access.transactions[0].len(), 4 + PAGE_SIZE);
}

#[test]
fn test_write_page() {
    let mut access = MockAccess::default();
    let mut flash = SpiFlash::new(&mut access);
    flash.write_page(5, &[0xA5; PAGE_SIZE]).unwrap();
    let t = &access.transactions;
    assert_eq!(t.len(), 4);
    assert_eq!(t[0], vec![0x06]);
    assert_eq!(t[1], vec![0x05, 0x00]);
    assert_eq!(&t[2][..4], &[0x02, 0x00, 0x05, 0x00]);
    assert!(t[2][4..].iter().all(|&x| x == 0xA5));
    assert_eq!(t[2].len(), 4 + PAGE_SIZE);
    assert_eq!(t[3], vec![0x05, 0x00]);
}

#[test]
fn test_erase_waits_while_busy() {
    let mut access = MockAccess { busy_polls: 3, ..Default::default() };
    let mut flash = SpiFlash::new(&mut access);
    flash.set_poll_interval(Some(Duration::from_millis(10)));
    flash.erase_block_64k(0x01_0000).unwrap();
    let opcodes: Vec<u8> = access.transactions.iter().map(|t| t[0]).collect();
    // WREN, status check (busy, first of three), erase, then polls until idle.
    assert_eq!(opcodes, vec![0x06, 0x05, 0xD8, 0x05, 0x05, 0x05]);
    assert_eq!(access.transactions[2], vec![0xD8, 0x01, 0x00, 0x00]);
    assert_eq!(access.sleeps, 2);

    let mut access = MockAccess::default();
    let mut flash = SpiFlash::new(&mut access);
    flash.erase_chip().unwrap();
    let opcodes: Vec<u8> = access.transactions.iter().map(|t| t[0]).collect();
    assert_eq!(opcodes, vec![0x06, 0x05, 0xC7, 0x05]);
}

/// Provider which drops the last byte of every exchange.
#[cfg(test)]
struct TruncatingAccess;

#[cfg(test)]
impl FlashAccess for TruncatingAccess {
    fn exchange(&mut self, data: &[u8]) -> AnyhowResult<Vec<u8>> {
        Ok(vec![0u8; data.len() - 1])
    }

    fn sleep(&mut self, _dur: Duration) {}
}

#[test]
fn test_short_exchange_is_an_error() {
    let mut access = TruncatingAccess;
    let mut flash = SpiFlash::new(&mut access);
    match flash.read_jedec_id() {
        Err(ref e) if !e.is_link() => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(flash.read_page(3).is_err());
}
