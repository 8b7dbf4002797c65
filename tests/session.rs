use spi_flash_prog::sim::{MemoryFlash, MemoryLink};
use spi_flash_prog::{frame, Discard, FrameEncoder, Outcome, ProgramSession, Request, Response,
                     PAGE_SIZE};

const ID: [u8; 3] = [0xC8, 0x40, 0x14];
const PAGES: u32 = 64;

fn session() -> ProgramSession<MemoryFlash, MemoryLink> {
    let mut session = ProgramSession::new(MemoryFlash::new(ID, PAGES), MemoryLink::new());
    session.set_total_pages(PAGES);
    session
}

/// Send `request` and return every response it produced.
fn exchange(session: &mut ProgramSession<MemoryFlash, MemoryLink>, request: &Request)
    -> Vec<Response>
{
    let mut encoder = FrameEncoder::new();
    session.link_mut().feed(request.encode(&mut encoder));
    session.poll().unwrap();
    let mut wire = session.link_mut().take_written();
    let mut responses = Vec::new();
    for chunk in wire.split_mut(|&b| b == 0xC0).filter(|c| !c.is_empty()) {
        let frame = frame::decode(chunk).unwrap();
        assert!(frame.valid);
        responses.push(Response::parse(&frame).unwrap());
    }
    responses
}

#[test]
fn test_read_identifier() {
    let mut session = session();
    assert_eq!(exchange(&mut session, &Request::ReadIdentifier), vec![Response::Identifier(ID)]);
}

#[test]
fn test_blank_page_reads_empty_repeatedly() {
    let mut session = session();
    for _ in 0..3 {
        assert_eq!(exchange(&mut session, &Request::ReadPage { page: 7 }),
                   vec![Response::Empty { page: 7 }]);
    }
    assert!(session.flash().data().iter().all(|&x| x == 0xFF));
}

#[test]
fn test_program_then_read() {
    let mut session = session();
    let mut data = [0u8; PAGE_SIZE];
    for (i, byte) in data.iter_mut().enumerate() {
        // Includes the framing bytes, which must survive stuffing.
        *byte = [0xC0, 0xDB, 0xDC, 0xDD][i % 4] ^ (i / 4) as u8;
    }
    assert_eq!(exchange(&mut session, &Request::ProgramPage { page: 9, data }),
               vec![Response::Ready(None)]);
    assert_eq!(exchange(&mut session, &Request::ReadPage { page: 9 }),
               vec![Response::Page { page: 9, data }]);
}

#[test]
fn test_blank_program_reads_empty() {
    let mut session = session();
    assert_eq!(exchange(&mut session, &Request::ProgramPage { page: 3, data: [0xFF; PAGE_SIZE] }),
               vec![Response::Ready(None)]);
    assert_eq!(exchange(&mut session, &Request::ReadPage { page: 3 }),
               vec![Response::Empty { page: 3 }]);
}

#[test]
fn test_erase_sector_and_chip() {
    let mut session = session();
    for byte in session.flash_mut().data_mut().iter_mut() {
        *byte = 0x00;
    }
    // Sector 0x0000 is the 64KiB block starting at byte 0, the whole of this flash.
    assert_eq!(exchange(&mut session, &Request::SectorErase { sector: 0x0000 }),
               vec![Response::Ready(None)]);
    assert!(session.flash().data().iter().all(|&x| x == 0xFF));

    session.flash_mut().data_mut()[100] = 0x00;
    assert_eq!(exchange(&mut session, &Request::BulkErase), vec![Response::Ready(Some(0xC7))]);
    assert!(session.flash().data().iter().all(|&x| x == 0xFF));
}

#[test]
fn test_read_all_pages() {
    let mut session = session();
    session.flash_mut().data_mut()[5 * PAGE_SIZE] = 0x42;
    let responses = exchange(&mut session, &Request::ReadAllPages);
    assert_eq!(responses.len(), PAGES as usize + 1);
    for (page, response) in responses[..PAGES as usize].iter().enumerate() {
        match response {
            Response::Page { page: 5, data } if page == 5 => assert_eq!(data[0], 0x42),
            Response::Empty { page: p } => assert_eq!(*p as usize, page),
            other => panic!("unexpected {:?} for page {}", other, page),
        }
    }
    assert_eq!(responses.last(), Some(&Response::Ready(None)));
}

#[test]
fn test_silent_failures_keep_power_balanced() {
    let mut session = session();
    session.flash_mut().inject_readback_fault(2);
    let mut encoder = FrameEncoder::new();

    let data = [0x11; PAGE_SIZE];
    session.link_mut().feed(Request::ProgramPage { page: 2, data }.encode(&mut encoder));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::Readback));

    // Page beyond the end of the flash.
    session.link_mut().feed(Request::ReadPage { page: 0x1000 }.encode(&mut encoder));
    assert_eq!(session.poll().unwrap(), Outcome::Discarded(Discard::Flash));

    assert!(session.link().written().is_empty());
    let (ups, downs) = session.flash().power_cycles();
    assert_eq!(ups, 2);
    assert_eq!(ups, downs);
    assert!(!session.flash().is_powered());
}
