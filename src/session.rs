//! The programmer's frame-at-a-time control loop.

use alloc::vec::Vec;
use core::time::Duration;

use crate::dispatch::{self, Responder};
use crate::frame::{self, FrameEncoder, MAX_FRAME_LEN};
use crate::link::{self, Link};
use crate::protocol::Request;
use crate::{link_error, AnyhowResult, Error, FlashCapability, Result, DEFAULT_TOTAL_PAGES};

/// Reset line of the device configured from the flash.
///
/// The session holds the device in reset while it works on the flash, so the device
/// does not try to configure itself from a half-written image.
pub trait ResetLine {
    fn set_reset(&mut self, asserted: bool) -> AnyhowResult<()>;
}

/// For targets without a reset line.
impl ResetLine for () {
    fn set_reset(&mut self, _asserted: bool) -> AnyhowResult<()> {
        Ok(())
    }
}

/// Result of one `ProgramSession::poll()`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No frame arrived.
    Idle,
    /// A request was executed and answered.
    Completed,
    /// A frame arrived but produced no reply.
    Discarded(Discard),
}

/// Why a received frame produced no reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Discard {
    /// Logical bytes did not sum to 0xFF, or the frame was cut short.
    Checksum,
    /// Unknown or response-only command byte.
    UnknownCommand(u8),
    /// Payload too short for the command.
    Malformed,
    /// Programmed page did not read back as written.
    Readback,
    /// The flash reported an error.
    Flash,
}

/// Device side of the protocol.
///
/// Owns the flash, the link, the reset line, and the receive and transmit buffers,
/// and processes one frame per call to `poll()`.
pub struct ProgramSession<F: FlashCapability, L: Link, R: ResetLine = ()> {
    flash: F,
    link: L,
    reset: R,

    rx: Vec<u8>,
    tx: FrameEncoder,

    /// Number of pages swept by read-all-pages.
    total_pages: u32,

    /// How long `poll()` waits for a frame to start.
    first_byte_timeout: Duration,

    /// How long to wait for each subsequent byte of a frame.
    byte_timeout: Duration,
}

impl<F: FlashCapability, L: Link> ProgramSession<F, L> {
    /// Create a new session with no reset line.
    pub fn new(flash: F, link: L) -> Self {
        Self::with_reset(flash, link, ())
    }
}

impl<F: FlashCapability, L: Link, R: ResetLine> ProgramSession<F, L, R> {
    /// Create a new session which holds `reset` asserted while executing requests.
    pub fn with_reset(flash: F, link: L, reset: R) -> Self {
        ProgramSession {
            flash,
            link,
            reset,
            rx: Vec::with_capacity(MAX_FRAME_LEN),
            tx: FrameEncoder::new(),
            total_pages: DEFAULT_TOTAL_PAGES,
            first_byte_timeout: Duration::from_millis(50),
            byte_timeout: Duration::from_millis(50),
        }
    }

    /// Get the number of pages swept by read-all-pages.
    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Set the number of pages swept by read-all-pages.
    ///
    /// This is 8192 (2MiB) by default. It can be derived from the flash's
    /// identifier using `FlashId::pages()`.
    ///
    /// Panics if `n` is 0 or more than 65536, the most a 16-bit page number reaches.
    pub fn set_total_pages(&mut self, n: u32) {
        assert!(n >= 1, "set_total_pages: n must be at least 1");
        assert!(n <= 0x1_0000, "set_total_pages: n must not exceed 65536");
        self.total_pages = n;
    }

    /// Set how long `poll()` waits for the first byte of a frame. 50ms by default.
    pub fn set_first_byte_timeout(&mut self, timeout: Duration) {
        self.first_byte_timeout = timeout;
    }

    /// Set how long to wait for each further byte of a frame. 50ms by default.
    pub fn set_byte_timeout(&mut self, timeout: Duration) {
        self.byte_timeout = timeout;
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Give back the flash, link and reset line.
    pub fn into_parts(self) -> (F, L, R) {
        (self.flash, self.link, self.reset)
    }

    /// Receive and handle at most one frame.
    ///
    /// Frames which fail their checksum, carry an unknown command or a short payload,
    /// or whose operation fails, get no reply; the reason is returned as
    /// `Outcome::Discarded`. Errors from the link or the reset line are returned
    /// as `Err`.
    pub fn poll(&mut self) -> Result<Outcome> {
        let arrived = link::read_frame(&mut self.link, &mut self.rx, self.first_byte_timeout,
                                       self.byte_timeout, MAX_FRAME_LEN)
            .map_err(link_error)?;
        if !arrived {
            return Ok(Outcome::Idle);
        }

        let frame = match frame::decode(&mut self.rx) {
            Some(frame) => frame,
            None => return Ok(Outcome::Idle),
        };
        if !frame.valid {
            log::debug!("Dropping frame 0x{:02X} with bad checksum", frame.command);
            return Ok(Outcome::Discarded(Discard::Checksum));
        }
        let request = match Request::parse(&frame) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Dropping frame: {:?}", e);
                return Ok(Outcome::Discarded(discard_reason(&e)));
            },
        };

        self.reset.set_reset(true)?;
        let result = {
            let mut out = Responder::new(&mut self.link, &mut self.tx);
            dispatch::execute(&mut self.flash, &mut out, &request, self.total_pages)
        };
        self.reset.set_reset(false)?;

        match result {
            Ok(()) => Ok(Outcome::Completed),
            Err(e) if e.is_link() => Err(e),
            Err(e) => {
                log::warn!("{:?} failed, no reply sent: {:?}", request.command(), e);
                Ok(Outcome::Discarded(discard_reason(&e)))
            },
        }
    }

    /// Handle frames until the link fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.poll()?;
        }
    }
}

fn discard_reason(err: &Error) -> Discard {
    match err {
        Error::ChecksumMismatch => Discard::Checksum,
        Error::UnknownCommand(command) => Discard::UnknownCommand(*command),
        Error::ShortPayload { .. } => Discard::Malformed,
        Error::ReadbackError { .. } => Discard::Readback,
        _ => Discard::Flash,
    }
}

#[cfg(test)]
use crate::frame::encode;
#[cfg(test)]
use crate::sim::{MemoryFlash, MemoryLink};
#[cfg(test)]
use crate::PAGE_SIZE;
#[cfg(test)]
use alloc::vec;

#[cfg(test)]
const ID: [u8; 3] = [0xEF, 0x40, 0x15];

#[cfg(test)]
#[derive(Default)]
struct RecordingReset(Vec<bool>);

#[cfg(test)]
impl ResetLine for RecordingReset {
    fn set_reset(&mut self, asserted: bool) -> AnyhowResult<()> {
        self.0.push(asserted);
        Ok(())
    }
}

#[cfg(test)]
fn session() -> ProgramSession<MemoryFlash, MemoryLink, RecordingReset> {
    let mut session = ProgramSession::with_reset(
        MemoryFlash::new(ID, 64), MemoryLink::new(), RecordingReset::default());
    session.set_total_pages(64);
    session
}

#[test]
fn test_idle() {
    let mut session = session();
    assert_eq!(session.poll().unwrap(), Outcome::Idle);
    assert!(session.link().written().is_empty());
}

#[test]
fn test_read_identifier_end_to_end() {
    let mut session = session();
    session.link_mut().feed(&[0xC0, 0x9F, 0x60, 0xC0]);
    assert_eq!(session.poll().unwrap(), Outcome::Completed);

    let reply = session.link_mut().take_written();
    let sum = 0x9Fu8.wrapping_add(0xEF).wrapping_add(0x40).wrapping_add(0x15);
    assert_eq!(reply, vec![0xC0, 0x9F, 0xEF, 0x40, 0x15, 0xFF - sum, 0xC0]);

    let (flash, _, reset) = session.into_parts();
    assert_eq!(reset.0, vec![true, false]);
    assert_eq!(flash.power_cycles(), (1, 1));
}

#[test]
fn test_bad_checksum_is_dropped() {
    let mut session = session();
    session.link_mut().feed(&[0xC0, 0x9F, 0x61, 0xC0]);
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::Checksum));
    assert!(session.link().written().is_empty());

    let (flash, _, reset) = session.into_parts();
    assert!(reset.0.is_empty());
    assert_eq!(flash.power_cycles(), (0, 0));
}

#[test]
fn test_unknown_command_has_no_side_effects() {
    let mut session = session();
    session.link_mut().feed(&encode(0x42, &[]));
    session.link_mut().feed(&encode(0x44, &[]));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::UnknownCommand(0x42)));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::UnknownCommand(0x44)));
    assert!(session.link().written().is_empty());
    let (flash, _, reset) = session.into_parts();
    assert!(reset.0.is_empty());
    assert_eq!(flash.power_cycles(), (0, 0));
}

#[test]
fn test_short_program_is_dropped() {
    let mut session = session();
    session.link_mut().feed(&encode(0x02, &[0x00, 0x01, 0xAA]));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::Malformed));
    assert!(session.link().written().is_empty());
}

#[test]
fn test_program_fault_produces_no_output() {
    let mut session = session();
    session.flash_mut().inject_readback_fault(5);
    let mut payload = vec![0x00, 0x05];
    payload.extend(vec![0x3C; PAGE_SIZE]);
    session.link_mut().feed(&encode(0x02, &payload));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::Readback));
    assert_eq!(session.link().written().len(), 0);

    // The reset line is still released.
    let (flash, _, reset) = session.into_parts();
    assert_eq!(reset.0, vec![true, false]);
    assert!(!flash.is_powered());
}

#[test]
fn test_one_frame_per_poll() {
    let mut session = session();
    session.link_mut().feed(&encode(0x03, &[0x00, 0x01]));
    session.link_mut().feed(&encode(0x03, &[0x00, 0x02]));
    assert_eq!(session.poll().unwrap(), Outcome::Completed);
    assert_eq!(session.link_mut().take_written(), encode(0x45, &[0x00, 0x01]));
    assert_eq!(session.poll().unwrap(), Outcome::Completed);
    assert_eq!(session.link_mut().take_written(), encode(0x45, &[0x00, 0x02]));
    assert_eq!(session.poll().unwrap(), Outcome::Idle);
}

#[test]
fn test_flash_error_is_discarded() {
    let mut session = session();
    session.link_mut().feed(&encode(0x03, &[0x00, 0x40]));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::Flash));
    assert!(session.link().written().is_empty());
}

#[test]
#[should_panic]
fn test_total_pages_bounds() {
    session().set_total_pages(0x1_0001);
}
