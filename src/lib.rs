// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! spi-flash-prog
//!
//! This crate implements the device side of a host-driven SPI flash programmer:
//! a byte-stuffed, checksummed serial framing protocol, and a session loop which
//! decodes request frames, performs the flash operations, and replies.
//!
//! The flash itself is reached through the `FlashCapability` trait. `SpiFlash`
//! implements it for standard SPI NOR memories over any `FlashAccess` provider,
//! and `sim::MemoryFlash` implements it in memory.
//!
//! With the `std` feature, `Host` drives a programmer from the other end of the link,
//! and `link::serial::SerialLink` provides that link over a serial port.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod checksum;
pub mod dispatch;
pub mod frame;
pub mod id;
pub mod link;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod spi;
pub mod sreg;
#[cfg(feature = "std")]
pub mod host;

pub use checksum::Checksum;
pub use frame::{Frame, FrameEncoder, MAX_FRAME_LEN};
pub use id::FlashId;
pub use link::Link;
pub use protocol::{Command, Request, Response};
pub use session::{Discard, Outcome, ProgramSession, ResetLine};
pub use spi::{FlashAccess, SpiFlash};
#[cfg(feature = "std")]
pub use host::Host;

/// Size in bytes of one flash page, the unit of every read and program.
pub const PAGE_SIZE: usize = 256;

/// Size in bytes of the erase block addressed by sector-erase.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Number of pages swept by read-all-pages unless configured otherwise (2MiB).
pub const DEFAULT_TOTAL_PAGES: u32 = 0x2000;

/// One page of flash data.
pub type Page = [u8; PAGE_SIZE];

#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum Error {
    #[cfg_attr(feature = "std", error("Frame checksum did not sum to 0xFF."))]
    ChecksumMismatch,
    #[cfg_attr(feature = "std", error("Unknown command 0x{0:02X}."))]
    UnknownCommand(u8),
    #[cfg_attr(feature = "std", error(
        "Command 0x{command:02X} needs {expected} payload bytes, got {actual}."))]
    ShortPayload { command: u8, expected: usize, actual: usize },
    #[cfg_attr(feature = "std", error("Mismatch during page readback verification."))]
    ReadbackError { page: u16, offset: usize, wrote: u8, read: u8 },
    #[cfg_attr(feature = "std", error("Address out of range or misaligned: 0x{address:08X}."))]
    InvalidAddress { address: u32 },
    #[cfg_attr(feature = "std", error("No reply received for command 0x{command:02X}."))]
    NoReply { command: u8 },
    #[cfg_attr(feature = "std", error("Unexpected response with command 0x{command:02X}."))]
    UnexpectedResponse { command: u8 },

    #[cfg(feature = "std")]
    #[cfg_attr(feature = "std", error(transparent))]
    Access(#[from] anyhow::Error),
    #[cfg(not(feature = "std"))]
    Access,

    #[cfg(feature = "std")]
    #[cfg_attr(feature = "std", error("Link error: {0}"))]
    Link(anyhow::Error),
    #[cfg(not(feature = "std"))]
    Link,
}

impl Error {
    /// True for errors raised by a `Link` rather than by the flash or the protocol.
    pub fn is_link(&self) -> bool {
        #[cfg(feature = "std")]
        {
            matches!(self, Error::Link(_))
        }
        #[cfg(not(feature = "std"))]
        {
            matches!(self, Error::Link)
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// Tag an error raised by a `Link` so it is not mistaken for a flash access error.
#[cfg(feature = "std")]
pub(crate) fn link_error(err: anyhow::Error) -> Error {
    Error::Link(err)
}
#[cfg(not(feature = "std"))]
pub(crate) fn link_error(_err: Error) -> Error {
    Error::Link
}

/// Operations the programmer needs from the attached flash.
///
/// Every method blocks until the flash has finished. Callers bracket each
/// group of operations with `power_up()` and `power_down()`.
pub trait FlashCapability {
    /// Bring the flash out of deep power-down.
    fn power_up(&mut self) -> AnyhowResult<()>;

    /// Put the flash into deep power-down.
    fn power_down(&mut self) -> AnyhowResult<()>;

    /// Read the 3-byte JEDEC identifier.
    fn read_identifier(&mut self) -> AnyhowResult<[u8; 3]>;

    /// Erase the whole chip.
    fn erase_chip(&mut self) -> AnyhowResult<()>;

    /// Erase the 64KiB block containing byte address `address`.
    fn erase_block_64k(&mut self, address: u32) -> AnyhowResult<()>;

    /// Read one page.
    fn read_page(&mut self, page: u16) -> AnyhowResult<Page>;

    /// Program one page. The page must already be erased for the data to stick.
    fn write_page(&mut self, page: u16, data: &Page) -> AnyhowResult<()>;
}

impl<F: FlashCapability + ?Sized> FlashCapability for &mut F {
    fn power_up(&mut self) -> AnyhowResult<()> {
        (**self).power_up()
    }

    fn power_down(&mut self) -> AnyhowResult<()> {
        (**self).power_down()
    }

    fn read_identifier(&mut self) -> AnyhowResult<[u8; 3]> {
        (**self).read_identifier()
    }

    fn erase_chip(&mut self) -> AnyhowResult<()> {
        (**self).erase_chip()
    }

    fn erase_block_64k(&mut self, address: u32) -> AnyhowResult<()> {
        (**self).erase_block_64k(address)
    }

    fn read_page(&mut self, page: u16) -> AnyhowResult<Page> {
        (**self).read_page(page)
    }

    fn write_page(&mut self, page: u16, data: &Page) -> AnyhowResult<()> {
        (**self).write_page(page, data)
    }
}
