//! Execution of decoded requests against the flash.

use core::ops::{Deref, DerefMut};

use crate::frame::FrameEncoder;
use crate::link::Link;
use crate::protocol::{Command, Request, Response};
use crate::{link_error, AnyhowResult, Error, FlashCapability, Page, Result};

/// Keeps the flash powered up for as long as it is held.
///
/// The flash is powered down by `release()`, or when the guard is dropped on an
/// early return, in which case a power-down failure can only be logged.
pub struct PowerGuard<'a, F: FlashCapability + ?Sized> {
    flash: &'a mut F,
    released: bool,
}

impl<'a, F: FlashCapability + ?Sized> PowerGuard<'a, F> {
    pub fn acquire(flash: &'a mut F) -> AnyhowResult<Self> {
        flash.power_up()?;
        Ok(PowerGuard { flash, released: false })
    }

    /// Power down now, reporting any error.
    pub fn release(mut self) -> AnyhowResult<()> {
        self.released = true;
        self.flash.power_down()
    }
}

impl<'a, F: FlashCapability + ?Sized> Deref for PowerGuard<'a, F> {
    type Target = F;

    fn deref(&self) -> &F {
        self.flash
    }
}

impl<'a, F: FlashCapability + ?Sized> DerefMut for PowerGuard<'a, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.flash
    }
}

impl<'a, F: FlashCapability + ?Sized> Drop for PowerGuard<'a, F> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.flash.power_down() {
                log::warn!("Failed to power down flash: {:?}", e);
            }
        }
    }
}

/// Encodes responses and writes them to the link.
pub struct Responder<'a, L: Link + ?Sized> {
    link: &'a mut L,
    encoder: &'a mut FrameEncoder,
}

impl<'a, L: Link + ?Sized> Responder<'a, L> {
    pub fn new(link: &'a mut L, encoder: &'a mut FrameEncoder) -> Self {
        Responder { link, encoder }
    }

    /// Send one response frame. Link errors come back as `Error::Link`.
    pub fn send(&mut self, response: &Response) -> Result<()> {
        let wire = response.encode(self.encoder);
        log::trace!("Sending {:?} frame, {} bytes", response.command(), wire.len());
        self.link.write(wire).map_err(link_error)
    }
}

/// Run `request` against `flash`, sending its responses through `out`.
///
/// The flash is powered for the duration of the request and powered down on every
/// path out. `total_pages` bounds the sweep of read-all-pages.
///
/// Errors mean no reply was sent for the request, except for `Error::Link`,
/// which may follow partial output from read-all-pages.
pub fn execute<F, L>(flash: &mut F, out: &mut Responder<L>, request: &Request, total_pages: u32)
    -> Result<()>
where
    F: FlashCapability + ?Sized,
    L: Link + ?Sized,
{
    log::debug!("Executing {:?}", request.command());
    let mut flash = PowerGuard::acquire(flash)?;

    match request {
        Request::ReadIdentifier => {
            let id = flash.read_identifier()?;
            flash.release()?;
            log::debug!("Read identifier {:02X?}", id);
            out.send(&Response::Identifier(id))
        },
        Request::BulkErase => {
            flash.erase_chip()?;
            flash.release()?;
            out.send(&Response::Ready(Some(Command::BulkErase.into())))
        },
        Request::SectorErase { sector } => {
            let address = (*sector as u32) << 8;
            if address as usize % crate::BLOCK_SIZE != 0 {
                log::debug!("Sector 0x{:04X} is not block aligned, erasing its whole block",
                            sector);
            }
            flash.erase_block_64k(address)?;
            flash.release()?;
            out.send(&Response::Ready(None))
        },
        Request::ReadPage { page } => {
            reply_page(&mut *flash, out, *page)?;
            flash.release()?;
            Ok(())
        },
        Request::ReadAllPages => {
            log::debug!("Reading {} pages", total_pages);
            for page in 0..total_pages {
                reply_page(&mut *flash, out, page as u16)?;
            }
            out.send(&Response::Ready(None))?;
            flash.release()?;
            Ok(())
        },
        Request::ProgramPage { page, data } => {
            flash.write_page(*page, data)?;
            let readback = flash.read_page(*page)?;
            flash.release()?;
            verify_readback(*page, data, &readback)?;
            out.send(&Response::Ready(None))
        },
    }
}

/// Read `page` and reply with its contents, or with an empty response if it is blank.
fn reply_page<F, L>(flash: &mut F, out: &mut Responder<L>, page: u16) -> Result<()>
where
    F: FlashCapability + ?Sized,
    L: Link + ?Sized,
{
    let data = flash.read_page(page)?;
    if data.iter().all(|&x| x == 0xFF) {
        out.send(&Response::Empty { page })
    } else {
        out.send(&Response::Page { page, data })
    }
}

/// Check programmed data matches what was read back.
///
/// Returns Err::ReadbackError on mismatch.
fn verify_readback(page: u16, data: &Page, readback: &Page) -> Result<()> {
    let mismatch = data.iter().zip(readback.iter()).enumerate().find(|(_, (a, b))| a != b);
    match mismatch {
        Some((offset, (a, b))) => {
            log::warn!("Readback mismatch in page 0x{:04X} at offset {}: wrote 0x{:02X}, read 0x{:02X}",
                       page, offset, a, b);
            Err(Error::ReadbackError { page, offset, wrote: *a, read: *b })
        },
        None => Ok(()),
    }
}

#[cfg(test)]
use crate::frame::decode;
#[cfg(test)]
use crate::sim::{MemoryFlash, MemoryLink};
#[cfg(test)]
use crate::PAGE_SIZE;
#[cfg(test)]
use alloc::vec::Vec;

#[cfg(test)]
const ID: [u8; 3] = [0xEF, 0x40, 0x15];

#[cfg(test)]
fn run(flash: &mut MemoryFlash, request: Request, total_pages: u32)
    -> (Result<()>, Vec<Response>)
{
    let mut link = MemoryLink::new();
    let mut encoder = FrameEncoder::new();
    let result = {
        let mut out = Responder::new(&mut link, &mut encoder);
        execute(flash, &mut out, &request, total_pages)
    };
    (result, split_responses(&link.take_written()))
}

#[cfg(test)]
fn split_responses(wire: &[u8]) -> Vec<Response> {
    wire.split(|&b| b == 0xC0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            let frame = decode(&mut chunk).unwrap();
            assert!(frame.valid);
            Response::parse(&frame).unwrap()
        })
        .collect()
}

#[test]
fn test_read_identifier() {
    let mut flash = MemoryFlash::new(ID, 64);
    let (result, replies) = run(&mut flash, Request::ReadIdentifier, 64);
    result.unwrap();
    assert_eq!(replies, [Response::Identifier(ID)]);
    assert!(!flash.is_powered());
    assert_eq!(flash.power_cycles(), (1, 1));
}

#[test]
fn test_erase() {
    let mut flash = MemoryFlash::new(ID, 512);
    for byte in flash.data_mut().iter_mut() {
        *byte = 0x00;
    }

    // Sector index is in page units: 0x0100 is byte address 0x10000.
    let (result, replies) = run(&mut flash, Request::SectorErase { sector: 0x0100 }, 512);
    result.unwrap();
    assert_eq!(replies, [Response::Ready(None)]);
    assert!(flash.data()[..0x10000].iter().all(|&x| x == 0x00));
    assert!(flash.data()[0x10000..0x20000].iter().all(|&x| x == 0xFF));

    let (result, replies) = run(&mut flash, Request::BulkErase, 512);
    result.unwrap();
    assert_eq!(replies, [Response::Ready(Some(0xC7))]);
    assert!(flash.data().iter().all(|&x| x == 0xFF));
    assert_eq!(flash.power_cycles(), (2, 2));
}

#[test]
fn test_read_page_blank_is_idempotent() {
    let mut flash = MemoryFlash::new(ID, 64);
    let (_, first) = run(&mut flash, Request::ReadPage { page: 9 }, 64);
    let (_, second) = run(&mut flash, Request::ReadPage { page: 9 }, 64);
    assert_eq!(first, [Response::Empty { page: 9 }]);
    assert_eq!(first, second);
}

#[test]
fn test_program_then_read() {
    let mut flash = MemoryFlash::new(ID, 64);
    let mut data = [0u8; PAGE_SIZE];
    for (i, x) in data.iter_mut().enumerate() {
        *x = (i as u8).wrapping_mul(3);
    }
    let (result, replies) = run(&mut flash, Request::ProgramPage { page: 5, data }, 64);
    result.unwrap();
    assert_eq!(replies, [Response::Ready(None)]);

    let (_, replies) = run(&mut flash, Request::ReadPage { page: 5 }, 64);
    assert_eq!(replies, [Response::Page { page: 5, data }]);

    // Programming all-0xFF leaves the page blank.
    let (result, _) = run(&mut flash, Request::ProgramPage { page: 6, data: [0xFF; PAGE_SIZE] }, 64);
    result.unwrap();
    let (_, replies) = run(&mut flash, Request::ReadPage { page: 6 }, 64);
    assert_eq!(replies, [Response::Empty { page: 6 }]);
}

#[test]
fn test_program_readback_failure_is_silent() {
    let mut flash = MemoryFlash::new(ID, 64);
    flash.inject_readback_fault(5);
    let (result, replies) = run(&mut flash, Request::ProgramPage { page: 5, data: [0x00; PAGE_SIZE] }, 64);
    match result {
        Err(Error::ReadbackError { page: 5, offset: 0, wrote: 0x00, read: 0x01 }) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(replies.is_empty());
    assert!(!flash.is_powered());
}

#[test]
fn test_read_all_pages() {
    let mut flash = MemoryFlash::new(ID, 8);
    flash.data_mut()[3 * PAGE_SIZE + 17] = 0x42;
    let (result, replies) = run(&mut flash, Request::ReadAllPages, 8);
    result.unwrap();
    assert_eq!(replies.len(), 9);
    for (page, reply) in replies[..8].iter().enumerate() {
        match reply {
            Response::Page { page: 3, data } => {
                assert_eq!(page, 3);
                assert_eq!(data[17], 0x42);
            },
            Response::Empty { page: p } => assert_eq!(*p as usize, page),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(replies[8], Response::Ready(None));
    assert_eq!(flash.power_cycles(), (1, 1));
}

#[test]
fn test_flash_error_powers_down() {
    let mut flash = MemoryFlash::new(ID, 8);
    let (result, replies) = run(&mut flash, Request::ReadPage { page: 8 }, 8);
    match result {
        Err(ref e) if !e.is_link() => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(replies.is_empty());
    assert!(!flash.is_powered());
    assert_eq!(flash.power_cycles(), (1, 1));
}
