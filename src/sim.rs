//! In-memory flash and link, for tests and for developing host tools without hardware.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use crate::link::Link;
use crate::{AnyhowResult, FlashCapability, Page, BLOCK_SIZE, PAGE_SIZE};

#[cfg(feature = "std")]
macro_rules! access_error {
    ($($arg:tt)*) => { anyhow::anyhow!($($arg)*) };
}
#[cfg(not(feature = "std"))]
macro_rules! access_error {
    ($($arg:tt)*) => { crate::Error::Access };
}

/// Flash emulated in memory.
///
/// Programming can only clear bits and erasing sets whole blocks back to 0xFF, as on
/// real NOR flash. Every operation other than `power_up()` fails while the flash is
/// powered down.
pub struct MemoryFlash {
    id: [u8; 3],
    data: Vec<u8>,
    powered: bool,
    power_ups: usize,
    power_downs: usize,
    readback_faults: Vec<u16>,
}

impl MemoryFlash {
    /// Create an erased flash of `pages` pages reporting `id` as its JEDEC identifier.
    pub fn new(id: [u8; 3], pages: u32) -> Self {
        MemoryFlash {
            id,
            data: vec![0xFF; pages as usize * PAGE_SIZE],
            powered: false,
            power_ups: 0,
            power_downs: 0,
            readback_faults: Vec::new(),
        }
    }

    /// Contents of the whole flash.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable contents of the whole flash, for preloading.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Number of `power_up()` and `power_down()` calls so far.
    pub fn power_cycles(&self) -> (usize, usize) {
        (self.power_ups, self.power_downs)
    }

    /// Corrupt the next read of `page`, as if the program had not taken.
    pub fn inject_readback_fault(&mut self, page: u16) {
        self.readback_faults.push(page);
    }

    fn check_powered(&self) -> AnyhowResult<()> {
        if self.powered {
            Ok(())
        } else {
            Err(access_error!("flash accessed while powered down"))
        }
    }

    fn page_range(&self, page: u16) -> AnyhowResult<core::ops::Range<usize>> {
        let start = page as usize * PAGE_SIZE;
        if start + PAGE_SIZE > self.data.len() {
            return Err(access_error!("page {} beyond end of flash", page));
        }
        Ok(start..start + PAGE_SIZE)
    }
}

impl FlashCapability for MemoryFlash {
    fn power_up(&mut self) -> AnyhowResult<()> {
        self.powered = true;
        self.power_ups += 1;
        Ok(())
    }

    fn power_down(&mut self) -> AnyhowResult<()> {
        self.powered = false;
        self.power_downs += 1;
        Ok(())
    }

    fn read_identifier(&mut self) -> AnyhowResult<[u8; 3]> {
        self.check_powered()?;
        Ok(self.id)
    }

    fn erase_chip(&mut self) -> AnyhowResult<()> {
        self.check_powered()?;
        for byte in self.data.iter_mut() {
            *byte = 0xFF;
        }
        Ok(())
    }

    fn erase_block_64k(&mut self, address: u32) -> AnyhowResult<()> {
        self.check_powered()?;
        let start = address as usize & !(BLOCK_SIZE - 1);
        if start >= self.data.len() {
            return Err(access_error!("erase address 0x{:08X} beyond end of flash", address));
        }
        let end = usize::min(start + BLOCK_SIZE, self.data.len());
        for byte in self.data[start..end].iter_mut() {
            *byte = 0xFF;
        }
        Ok(())
    }

    fn read_page(&mut self, page: u16) -> AnyhowResult<Page> {
        self.check_powered()?;
        let range = self.page_range(page)?;
        let mut data = [0u8; PAGE_SIZE];
        data.copy_from_slice(&self.data[range]);
        if let Some(idx) = self.readback_faults.iter().position(|&p| p == page) {
            self.readback_faults.remove(idx);
            data[0] ^= 0x01;
        }
        Ok(data)
    }

    fn write_page(&mut self, page: u16, data: &Page) -> AnyhowResult<()> {
        self.check_powered()?;
        let range = self.page_range(page)?;
        for (cell, byte) in self.data[range].iter_mut().zip(data.iter()) {
            *cell &= byte;
        }
        Ok(())
    }
}

/// Link backed by in-memory queues.
///
/// Bytes given to `feed()` are returned by reads; bytes written are collected for
/// `take_written()`. Reads never wait.
#[derive(Clone, Debug, Default)]
pub struct MemoryLink {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be read.
    pub fn feed(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    /// Number of bytes queued for reading.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    /// Remove and return everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }
}

impl Link for MemoryLink {
    fn write(&mut self, data: &[u8]) -> AnyhowResult<()> {
        self.tx.extend_from_slice(data);
        Ok(())
    }

    fn read_nonblock(&mut self, buf: &mut [u8], _timeout: Duration) -> AnyhowResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                },
                None => break,
            }
        }
        Ok(n)
    }
}

#[test]
fn test_nor_semantics() {
    let mut flash = MemoryFlash::new([0xEF, 0x40, 0x15], 512);
    assert!(flash.read_page(0).is_err());
    flash.power_up().unwrap();

    let mut data = [0xFF; PAGE_SIZE];
    data[0] = 0x0F;
    flash.write_page(300, &data).unwrap();
    data[0] = 0xF1;
    flash.write_page(300, &data).unwrap();
    assert_eq!(flash.read_page(300).unwrap()[0], 0x01);

    // Block erase covers the 64KiB block containing the address.
    flash.erase_block_64k(300 << 8).unwrap();
    assert_eq!(flash.read_page(300).unwrap(), [0xFF; PAGE_SIZE]);

    assert!(flash.read_page(512).is_err());
    assert!(flash.erase_block_64k(0x0002_0000).is_err());
    flash.power_down().unwrap();
    assert_eq!(flash.power_cycles(), (1, 1));
}

#[test]
fn test_readback_fault_is_one_shot() {
    let mut flash = MemoryFlash::new([0xEF, 0x40, 0x15], 16);
    flash.power_up().unwrap();
    flash.inject_readback_fault(3);
    assert_eq!(flash.read_page(3).unwrap()[0], 0xFE);
    assert_eq!(flash.read_page(3).unwrap()[0], 0xFF);
}
