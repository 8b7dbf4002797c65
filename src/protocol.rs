//! Command codes and the typed requests and responses carried in frames.

use core::convert::{TryFrom, TryInto};

use crate::frame::{Frame, FrameEncoder};
use crate::{Error, Page, Result, PAGE_SIZE};

/// Command byte of each frame.
///
/// Requests reuse the SPI flash opcode of the matching operation. The device
/// answers read-identifier and read-page with frames carrying the same code,
/// and uses `Ready` and `Empty` for everything else.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    ProgramPage = 0x02,
    ReadPage = 0x03,
    Ready = 0x44,
    Empty = 0x45,
    ReadAllPages = 0x83,
    ReadIdentifier = 0x9F,
    BulkErase = 0xC7,
    SectorErase = 0xD8,
}

/// A request from the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReadIdentifier,
    BulkErase,
    /// Erase the 64KiB block at byte address `sector << 8`.
    SectorErase { sector: u16 },
    ReadPage { page: u16 },
    ReadAllPages,
    ProgramPage { page: u16, data: Page },
}

impl Request {
    /// Interpret a decoded frame as a request.
    ///
    /// Payload bytes past those a command needs are ignored. Response-only codes and
    /// unknown codes give `Error::UnknownCommand`.
    pub fn parse(frame: &Frame) -> Result<Self> {
        let command = match Command::try_from(frame.command) {
            Ok(command) => command,
            Err(_) => return Err(Error::UnknownCommand(frame.command)),
        };
        let payload = frame.payload;
        match command {
            Command::ReadIdentifier => Ok(Request::ReadIdentifier),
            Command::BulkErase => Ok(Request::BulkErase),
            Command::ReadAllPages => Ok(Request::ReadAllPages),
            Command::SectorErase => Ok(Request::SectorErase { sector: index(command, payload)? }),
            Command::ReadPage => Ok(Request::ReadPage { page: index(command, payload)? }),
            Command::ProgramPage => {
                let page = index(command, payload)?;
                Ok(Request::ProgramPage { page, data: page_data(command, payload)? })
            },
            Command::Ready | Command::Empty => Err(Error::UnknownCommand(frame.command)),
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Request::ReadIdentifier => Command::ReadIdentifier,
            Request::BulkErase => Command::BulkErase,
            Request::SectorErase { .. } => Command::SectorErase,
            Request::ReadPage { .. } => Command::ReadPage,
            Request::ReadAllPages => Command::ReadAllPages,
            Request::ProgramPage { .. } => Command::ProgramPage,
        }
    }

    /// Encode this request as a wire frame using `encoder`'s buffer.
    pub fn encode<'e>(&self, encoder: &'e mut FrameEncoder) -> &'e [u8] {
        encoder.start(self.command().into());
        match self {
            Request::SectorErase { sector: idx } | Request::ReadPage { page: idx } => {
                encoder.extend(&idx.to_be_bytes());
            },
            Request::ProgramPage { page, data } => {
                encoder.extend(&page.to_be_bytes()).extend(data);
            },
            _ => (),
        }
        encoder.finish()
    }
}

/// A response from the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// JEDEC manufacturer, memory type and capacity bytes.
    Identifier([u8; 3]),
    /// Operation complete. Bulk erase tags its reply with its own command code.
    Ready(Option<u8>),
    /// The page read back as all 0xFF.
    Empty { page: u16 },
    Page { page: u16, data: Page },
}

impl Response {
    pub fn command(&self) -> Command {
        match self {
            Response::Identifier(_) => Command::ReadIdentifier,
            Response::Ready(_) => Command::Ready,
            Response::Empty { .. } => Command::Empty,
            Response::Page { .. } => Command::ReadPage,
        }
    }

    /// Encode this response as a wire frame using `encoder`'s buffer.
    pub fn encode<'e>(&self, encoder: &'e mut FrameEncoder) -> &'e [u8] {
        encoder.start(self.command().into());
        match self {
            Response::Identifier(id) => {
                encoder.extend(id);
            },
            Response::Ready(Some(tag)) => {
                encoder.push(*tag);
            },
            Response::Ready(None) => (),
            Response::Empty { page } => {
                encoder.extend(&page.to_be_bytes());
            },
            Response::Page { page, data } => {
                encoder.extend(&page.to_be_bytes()).extend(data);
            },
        }
        encoder.finish()
    }

    /// Interpret a decoded frame as a response.
    pub fn parse(frame: &Frame) -> Result<Self> {
        let command = match Command::try_from(frame.command) {
            Ok(command) => command,
            Err(_) => return Err(Error::UnknownCommand(frame.command)),
        };
        let payload = frame.payload;
        match command {
            Command::ReadIdentifier => {
                let id: [u8; 3] = payload.get(..3).and_then(|id| id.try_into().ok()).ok_or(
                    Error::ShortPayload { command: frame.command, expected: 3, actual: payload.len() })?;
                Ok(Response::Identifier(id))
            },
            Command::Ready => Ok(Response::Ready(payload.first().copied())),
            Command::Empty => Ok(Response::Empty { page: index(command, payload)? }),
            Command::ReadPage => {
                let page = index(command, payload)?;
                Ok(Response::Page { page, data: page_data(command, payload)? })
            },
            _ => Err(Error::UnexpectedResponse { command: frame.command }),
        }
    }
}

/// Read the big-endian page or sector index leading an addressed payload.
fn index(command: Command, payload: &[u8]) -> Result<u16> {
    match payload {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::ShortPayload { command: command.into(), expected: 2, actual: payload.len() }),
    }
}

/// Read the page of data following the index of an addressed payload.
fn page_data(command: Command, payload: &[u8]) -> Result<Page> {
    payload.get(2..2 + PAGE_SIZE).and_then(|data| data.try_into().ok()).ok_or(Error::ShortPayload {
        command: command.into(),
        expected: 2 + PAGE_SIZE,
        actual: payload.len(),
    })
}

#[cfg(test)]
use crate::frame::{decode, encode};
#[cfg(test)]
use alloc::vec::Vec;

#[cfg(test)]
fn request(wire: &mut [u8]) -> Result<Request> {
    Request::parse(&decode(wire).unwrap())
}

#[test]
fn test_parse_requests() {
    assert_eq!(request(&mut encode(0x9F, &[])).unwrap(), Request::ReadIdentifier);
    assert_eq!(request(&mut encode(0xC7, &[])).unwrap(), Request::BulkErase);
    assert_eq!(request(&mut encode(0x83, &[])).unwrap(), Request::ReadAllPages);
    assert_eq!(request(&mut encode(0xD8, &[0x01, 0x00])).unwrap(),
               Request::SectorErase { sector: 0x0100 });
    assert_eq!(request(&mut encode(0x03, &[0x12, 0x34, 0xAA])).unwrap(),
               Request::ReadPage { page: 0x1234 });

    let mut payload = alloc::vec![0x00, 0x05];
    payload.extend((0..PAGE_SIZE).map(|i| i as u8));
    match request(&mut encode(0x02, &payload)).unwrap() {
        Request::ProgramPage { page, data } => {
            assert_eq!(page, 5);
            assert_eq!(&data[..], &payload[2..]);
        },
        other => panic!("unexpected request {:?}", other),
    }
}

#[test]
fn test_parse_rejects() {
    match request(&mut encode(0x42, &[])) {
        Err(Error::UnknownCommand(0x42)) => (),
        other => panic!("unexpected {:?}", other),
    }
    // Response-only codes are not requests.
    match request(&mut encode(0x44, &[])) {
        Err(Error::UnknownCommand(0x44)) => (),
        other => panic!("unexpected {:?}", other),
    }
    match request(&mut encode(0x03, &[0x01])) {
        Err(Error::ShortPayload { command: 0x03, expected: 2, actual: 1 }) => (),
        other => panic!("unexpected {:?}", other),
    }
    match request(&mut encode(0x02, &[0x00, 0x05, 0xAA, 0xBB])) {
        Err(Error::ShortPayload { command: 0x02, expected: 258, actual: 4 }) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_request_encoding() {
    let mut encoder = FrameEncoder::new();
    assert_eq!(Request::ReadIdentifier.encode(&mut encoder), &[0xC0, 0x9F, 0x60, 0xC0]);
    assert_eq!(Request::ReadPage { page: 0x00C0 }.encode(&mut encoder),
               &encode(0x03, &[0x00, 0xC0])[..]);
    let data = [0x5A; PAGE_SIZE];
    let wire: Vec<u8> = Request::ProgramPage { page: 7, data }.encode(&mut encoder).to_vec();
    let mut wire = wire;
    assert_eq!(request(&mut wire).unwrap(), Request::ProgramPage { page: 7, data });
}

#[test]
fn test_responses() {
    let mut encoder = FrameEncoder::new();
    let responses = [
        Response::Identifier([0xEF, 0x40, 0x15]),
        Response::Ready(None),
        Response::Ready(Some(0xC7)),
        Response::Empty { page: 0x1FFF },
        Response::Page { page: 3, data: [0xC0; PAGE_SIZE] },
    ];
    for response in responses.iter() {
        let mut wire = response.encode(&mut encoder).to_vec();
        let frame = decode(&mut wire).unwrap();
        assert!(frame.valid);
        assert_eq!(frame.command, u8::from(response.command()));
        assert_eq!(&Response::parse(&frame).unwrap(), response);
    }

    assert_eq!(Response::Ready(Some(0xC7)).encode(&mut encoder),
               &encode(0x44, &[0xC7])[..]);
    assert_eq!(Response::Empty { page: 5 }.encode(&mut encoder),
               &encode(0x45, &[0x00, 0x05])[..]);
}
