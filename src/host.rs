//! Host side of the protocol: issue requests to a programmer and interpret its replies.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::frame::{self, FrameEncoder, MAX_FRAME_LEN};
use crate::link::{self, Link};
use crate::protocol::{Command, Request, Response};
use crate::{link_error, Error, FlashId, Page, Result, BLOCK_SIZE, DEFAULT_TOTAL_PAGES, PAGE_SIZE};

/// Longest gap allowed between bytes of one reply frame.
const BYTE_TIMEOUT: Duration = Duration::from_millis(50);

/// Client for a programmer at the other end of a `Link`.
///
/// The programmer never acknowledges a failed request, so every failure shows up
/// here as a missing reply. Page programming is retried on a missing reply;
/// other requests report `Error::NoReply`.
pub struct Host<'a, L: Link> {
    link: &'a mut L,
    rx: Vec<u8>,
    encoder: FrameEncoder,

    /// How long to wait for a reply to reads and page programs.
    reply_timeout: Duration,

    /// How long to wait for a reply to chip and sector erases.
    erase_timeout: Duration,

    /// How many times to re-send a page program which got no reply.
    retries: usize,

    /// Number of pages the programmer sweeps in read-all-pages.
    total_pages: u32,
}

impl<'a, L: Link> Host<'a, L> {
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Create a new Host talking over `link`.
    pub fn new(link: &'a mut L) -> Self {
        Host {
            link,
            rx: Vec::with_capacity(MAX_FRAME_LEN),
            encoder: FrameEncoder::new(),
            reply_timeout: Duration::from_secs(1),
            erase_timeout: Duration::from_secs(60),
            retries: 3,
            total_pages: DEFAULT_TOTAL_PAGES,
        }
    }

    /// Set how long to wait for replies to reads and page programs. 1s by default.
    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    /// Set how long to wait for replies to erases. 60s by default.
    pub fn set_erase_timeout(&mut self, timeout: Duration) {
        self.erase_timeout = timeout;
    }

    /// Set how many times an unanswered page program is re-sent. 3 by default.
    pub fn set_retries(&mut self, retries: usize) {
        self.retries = retries;
    }

    /// Get the number of pages read-all-pages is expected to return.
    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Set the number of pages read-all-pages is expected to return.
    ///
    /// This must match the programmer's setting. It is 8192 (2MiB) by default.
    ///
    /// Panics if `n` is 0 or more than 65536.
    pub fn set_total_pages(&mut self, n: u32) {
        assert!(n >= 1, "set_total_pages: n must be at least 1");
        assert!(n <= 0x1_0000, "set_total_pages: n must not exceed 65536");
        self.total_pages = n;
    }

    /// Read the flash's JEDEC ID.
    pub fn read_id(&mut self) -> Result<FlashId> {
        log::debug!("Reading flash ID");
        let timeout = self.reply_timeout;
        match self.transact(&Request::ReadIdentifier, timeout)? {
            Response::Identifier(id) => {
                let id = FlashId::from_bytes(id);
                log::debug!("Read ID: {:?}", id);
                Ok(id)
            },
            other => Err(unexpected(&other)),
        }
    }

    /// Erase entire flash chip.
    ///
    /// Returns once the programmer reports the erase complete.
    pub fn erase_chip(&mut self) -> Result<()> {
        log::debug!("Erasing chip");
        let timeout = self.erase_timeout;
        match self.transact(&Request::BulkErase, timeout)? {
            Response::Ready(Some(tag)) if tag == u8::from(Command::BulkErase) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Erase the 64KiB block at byte address `sector << 8`.
    pub fn erase_sector(&mut self, sector: u16) -> Result<()> {
        log::debug!("Erasing sector 0x{:04X}", sector);
        let timeout = self.erase_timeout;
        match self.transact(&Request::SectorErase { sector }, timeout)? {
            Response::Ready(None) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Read one page, returning `None` if it is blank.
    pub fn read_page(&mut self, page: u16) -> Result<Option<Page>> {
        let timeout = self.reply_timeout;
        match self.transact(&Request::ReadPage { page }, timeout)? {
            Response::Page { page: p, data } if p == page => Ok(Some(data)),
            Response::Empty { page: p } if p == page => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    /// Program one page, which must already be erased.
    ///
    /// The programmer replies only once the page reads back correctly, so a missing
    /// or corrupted reply causes the request to be re-sent, up to the retry limit.
    pub fn program_page(&mut self, page: u16, data: &Page) -> Result<()> {
        let request = Request::ProgramPage { page, data: *data };
        for attempt in 0..=self.retries {
            if attempt > 0 {
                log::warn!("No reply programming page 0x{:04X}, retry {}", page, attempt);
            }
            self.send(&request)?;
            match self.receive(self.reply_timeout) {
                Ok(Some(Response::Ready(None))) => return Ok(()),
                Ok(Some(other)) => return Err(unexpected(&other)),
                Ok(None) | Err(Error::ChecksumMismatch) => continue,
                Err(e) => return Err(e),
            }
        }
        log::error!("Page 0x{:04X} failed to program after {} attempts", page, self.retries + 1);
        Err(Error::NoReply { command: Command::ProgramPage.into() })
    }

    /// Read every page into one image, blank pages included as 0xFF.
    ///
    /// The programmer must answer every page in ascending order before its final
    /// `Ready`. A sweep ending early gives `Error::NoReply`, and a page out of
    /// sequence gives `Error::UnexpectedResponse`.
    ///
    /// Calls `cb` with the number of bytes read so far after each page.
    pub fn read_all_cb<F: Fn(usize)>(&mut self, cb: F) -> Result<Vec<u8>> {
        let total = self.total_pages as usize;
        log::debug!("Reading all {} pages", total);
        let mut image = vec![0xFF; total * PAGE_SIZE];
        let mut pages = 0;
        cb(0);
        self.send(&Request::ReadAllPages)?;
        loop {
            let response = match self.receive(self.reply_timeout)? {
                Some(response) => response,
                None => {
                    log::error!("Reply stopped after {} of {} pages", pages, total);
                    return Err(Error::NoReply { command: Command::ReadAllPages.into() });
                },
            };
            match &response {
                Response::Ready(None) if pages == total => break,
                Response::Ready(None) => {
                    log::error!("Sweep ended after {} of {} pages", pages, total);
                    return Err(Error::NoReply { command: Command::ReadAllPages.into() });
                },
                Response::Page { page, .. } | Response::Empty { page } if *page as usize >= total => {
                    log::error!("Page 0x{:04X} is beyond the expected {} pages", page, total);
                    return Err(Error::InvalidAddress { address: (*page as u32) << 8 });
                },
                Response::Page { page, .. } | Response::Empty { page } if *page as usize != pages => {
                    log::error!("Received page 0x{:04X} while expecting 0x{:04X}", page, pages);
                    return Err(unexpected(&response));
                },
                Response::Page { data, .. } => {
                    let start = pages * PAGE_SIZE;
                    image[start..start + PAGE_SIZE].copy_from_slice(data);
                },
                Response::Empty { .. } => (),
                other => return Err(unexpected(other)),
            }
            log::trace!("Received page 0x{:04X}", pages);
            pages += 1;
            cb(pages * PAGE_SIZE);
        }
        Ok(image)
    }

    /// Read every page into one image, drawing a progress bar to the terminal.
    pub fn read_all_progress(&mut self) -> Result<Vec<u8>> {
        let length = self.total_pages as u64 * PAGE_SIZE as u64;
        let pb = ProgressBar::new(length).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Reading");
        let result = self.read_all_cb(|n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Program `data` at `address`, which must be page aligned.
    ///
    /// Every 64KiB block the data touches is erased first, including any existing data
    /// in those blocks outside the new data. Blank pages are then skipped, and a
    /// partial final page is padded with 0xFF.
    ///
    /// Calls `cb` with the number of bytes programmed so far after each page.
    pub fn program_cb<F: Fn(usize)>(&mut self, address: u32, data: &[u8], cb: F) -> Result<()> {
        self.check_address_length(address, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let start = address as usize;
        let end = start + data.len();
        for block in (start / BLOCK_SIZE)..=((end - 1) / BLOCK_SIZE) {
            self.erase_sector(((block * BLOCK_SIZE) >> 8) as u16)?;
        }

        let mut total_bytes = 0;
        cb(total_bytes);
        for (n, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            let mut page = [0xFF; PAGE_SIZE];
            page[..chunk.len()].copy_from_slice(chunk);
            if page.iter().any(|&x| x != 0xFF) {
                self.program_page((start / PAGE_SIZE + n) as u16, &page)?;
            }
            total_bytes += chunk.len();
            cb(total_bytes);
        }
        Ok(())
    }

    /// Program `data` at `address`, drawing a progress bar to the terminal.
    pub fn program_progress(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let pb = ProgressBar::new(data.len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        let result = self.program_cb(address, data, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Send `request` and wait up to `timeout` for its single reply.
    fn transact(&mut self, request: &Request, timeout: Duration) -> Result<Response> {
        self.send(request)?;
        match self.receive(timeout)? {
            Some(response) => Ok(response),
            None => Err(Error::NoReply { command: request.command().into() }),
        }
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        let wire = request.encode(&mut self.encoder);
        log::trace!("Sending {:?} frame, {} bytes", request.command(), wire.len());
        self.link.write(wire).map_err(link_error)?;
        self.link.flush().map_err(link_error)
    }

    /// Wait up to `timeout` for one reply frame.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Response>> {
        let arrived = link::read_frame(&mut *self.link, &mut self.rx, timeout, BYTE_TIMEOUT,
                                       MAX_FRAME_LEN)
            .map_err(link_error)?;
        if !arrived {
            return Ok(None);
        }
        match frame::decode(&mut self.rx) {
            Some(frame) if frame.valid => Response::parse(&frame).map(Some),
            Some(_) => Err(Error::ChecksumMismatch),
            None => Ok(None),
        }
    }

    /// Checks `address` is page aligned and `address + length` fits in `total_pages`.
    fn check_address_length(&self, address: u32, length: usize) -> Result<()> {
        let capacity = self.total_pages as usize * PAGE_SIZE;
        if address as usize % PAGE_SIZE != 0 {
            log::error!("Address 0x{:08X} is not page aligned", address);
            Err(Error::InvalidAddress { address })
        } else if address as usize + length > capacity {
            log::error!("Operation would exceed flash capacity");
            Err(Error::InvalidAddress { address: (address as usize + length) as u32 })
        } else {
            Ok(())
        }
    }
}

fn unexpected(response: &Response) -> Error {
    log::error!("Unexpected response {:?}", response.command());
    Error::UnexpectedResponse { command: response.command().into() }
}

#[cfg(test)]
use crate::frame::encode;
#[cfg(test)]
use crate::sim::{MemoryFlash, MemoryLink};
#[cfg(test)]
use crate::ProgramSession;
#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::collections::VecDeque;

#[cfg(test)]
const ID: [u8; 3] = [0xEF, 0x40, 0x15];

/// Link straight into a simulated programmer, which handles each request as it
/// is written.
#[cfg(test)]
struct Loopback {
    device: ProgramSession<MemoryFlash, MemoryLink>,
    replies: VecDeque<u8>,
    lost_replies: usize,
}

#[cfg(test)]
impl Loopback {
    fn new(pages: u32) -> Self {
        let mut device = ProgramSession::new(MemoryFlash::new(ID, pages), MemoryLink::new());
        device.set_total_pages(pages);
        Loopback { device, replies: VecDeque::new(), lost_replies: 0 }
    }

    fn flash(&self) -> &MemoryFlash {
        self.device.flash()
    }
}

#[cfg(test)]
impl Link for Loopback {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.device.link_mut().feed(data);
        while self.device.link().pending() > 0 {
            self.device.poll()?;
        }
        let reply = self.device.link_mut().take_written();
        if self.lost_replies > 0 && !reply.is_empty() {
            self.lost_replies -= 1;
        } else {
            self.replies.extend(reply);
        }
        Ok(())
    }

    fn read_nonblock(&mut self, buf: &mut [u8], _timeout: Duration) -> anyhow::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.replies.pop_front() {
                Some(byte) => buf[n] = byte,
                None => break,
            }
            n += 1;
        }
        Ok(n)
    }
}

#[test]
fn test_loopback_program_and_read() {
    let mut link = Loopback::new(512);
    link.device.flash_mut().data_mut()[0x0_0000] = 0x00;
    link.device.flash_mut().data_mut()[0x1_F000] = 0x00;

    let mut data: Vec<u8> = (0..PAGE_SIZE).map(|x| x as u8).collect();
    data.extend(vec![0xFF; PAGE_SIZE]);
    data.extend(vec![0x12; 100]);

    let mut host = Host::new(&mut link);
    host.set_total_pages(512);
    assert_eq!(host.read_id().unwrap().to_bytes(), ID);

    let progress = Cell::new(0);
    host.program_cb(0x1_0100, &data, |n| progress.set(n)).unwrap();
    assert_eq!(progress.get(), data.len());

    assert_eq!(host.read_page(0x101).unwrap().map(|p| p.to_vec()),
               Some(data[..PAGE_SIZE].to_vec()));
    assert_eq!(host.read_page(0x102).unwrap(), None);

    let image = host.read_all_cb(|n| progress.set(n)).unwrap();
    assert_eq!(progress.get(), 512 * PAGE_SIZE);

    let flash = link.flash().data();
    assert_eq!(&image[..], flash);
    assert_eq!(&flash[0x1_0100..0x1_0300], &data[..2 * PAGE_SIZE]);
    assert_eq!(&flash[0x1_0300..0x1_0364], &[0x12; 100][..]);
    assert!(flash[0x1_0364..0x1_0400].iter().all(|&x| x == 0xFF));
    // Block 0 was outside the data and kept its contents; block 1 was erased.
    assert_eq!(flash[0x0_0000], 0x00);
    assert_eq!(flash[0x1_F000], 0xFF);
}

#[test]
fn test_loopback_erase_chip() {
    let mut link = Loopback::new(32);
    for byte in link.device.flash_mut().data_mut().iter_mut() {
        *byte = 0x00;
    }
    Host::new(&mut link).erase_chip().unwrap();
    assert!(link.flash().data().iter().all(|&x| x == 0xFF));
}

#[test]
fn test_loopback_program_retries() {
    let mut link = Loopback::new(32);
    link.lost_replies = 1;
    link.device.flash_mut().inject_readback_fault(4);
    Host::new(&mut link).program_page(4, &[0x5A; PAGE_SIZE]).unwrap();
    assert!(link.flash().data()[4 * PAGE_SIZE..5 * PAGE_SIZE].iter().all(|&x| x == 0x5A));
    assert_eq!(link.lost_replies, 0);
}

#[test]
fn test_read_all_rejects_short_sweep() {
    let mut link = MemoryLink::new();
    link.feed(&encode(0x03, &{
        let mut p = vec![0x00, 0x00];
        p.extend_from_slice(&[0x12; PAGE_SIZE]);
        p
    }));
    link.feed(&encode(0x45, &[0x00, 0x01]));
    link.feed(&encode(0x44, &[]));
    let mut host = Host::new(&mut link);
    host.set_total_pages(4);
    match host.read_all_cb(|_| {}) {
        Err(Error::NoReply { command: 0x83 }) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_read_all_rejects_repeated_page() {
    // A repeated page would otherwise hide the missing page 1.
    let mut link = MemoryLink::new();
    link.feed(&encode(0x45, &[0x00, 0x00]));
    link.feed(&encode(0x45, &[0x00, 0x00]));
    link.feed(&encode(0x44, &[]));
    let mut host = Host::new(&mut link);
    host.set_total_pages(2);
    match host.read_all_cb(|_| {}) {
        Err(Error::UnexpectedResponse { command: 0x45 }) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_loopback_read_all_overrun() {
    // The programmer sweeps more pages than the host expects.
    let mut link = Loopback::new(32);
    let mut host = Host::new(&mut link);
    host.set_total_pages(16);
    match host.read_all_cb(|_| {}) {
        Err(Error::InvalidAddress { address: 0x1000 }) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_read_id() {
    let mut link = MemoryLink::new();
    link.feed(&encode(0x9F, &[0xEF, 0x40, 0x15]));
    let id = Host::new(&mut link).read_id().unwrap();
    assert_eq!(id, FlashId::from_bytes([0xEF, 0x40, 0x15]));
    assert_eq!(link.written(), &[0xC0, 0x9F, 0x60, 0xC0]);
}

#[test]
fn test_no_reply() {
    let mut link = MemoryLink::new();
    match Host::new(&mut link).erase_chip() {
        Err(Error::NoReply { command: 0xC7 }) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_program_page_gives_up() {
    let mut link = MemoryLink::new();
    let mut host = Host::new(&mut link);
    host.set_retries(2);
    match host.program_page(1, &[0x00; PAGE_SIZE]) {
        Err(Error::NoReply { command: 0x02 }) => (),
        other => panic!("unexpected {:?}", other),
    }
    // Three identical requests were sent.
    let sent = link.written().to_vec();
    let one = encode(0x02, &{
        let mut p = vec![0x00, 0x01];
        p.extend_from_slice(&[0x00; PAGE_SIZE]);
        p
    });
    assert_eq!(sent.len(), 3 * one.len());
    assert_eq!(&sent[..one.len()], &one[..]);
}

#[test]
fn test_mismatched_reply() {
    let mut link = MemoryLink::new();
    link.feed(&encode(0x45, &[0x00, 0x02]));
    match Host::new(&mut link).read_page(1) {
        Err(Error::UnexpectedResponse { command: 0x45 }) => (),
        other => panic!("unexpected {:?}", other),
    }

    // A corrupted reply to anything but page program is an error.
    let mut link = MemoryLink::new();
    link.feed(&[0xC0, 0x45, 0x00, 0x01, 0x00, 0xC0]);
    match Host::new(&mut link).read_page(1) {
        Err(Error::ChecksumMismatch) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_program_rejects_bad_address() {
    let mut link = MemoryLink::new();
    let mut host = Host::new(&mut link);
    host.set_total_pages(16);
    match host.program_cb(0x80, &[0x00; 4], |_| {}) {
        Err(Error::InvalidAddress { address: 0x80 }) => (),
        other => panic!("unexpected {:?}", other),
    }
    match host.program_cb(0xF00, &[0x00; 0x200], |_| {}) {
        Err(Error::InvalidAddress { address: 0x1100 }) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(link.written().is_empty());
}
