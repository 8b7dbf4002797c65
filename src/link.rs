//! Byte transport between host and programmer.

use alloc::vec::Vec;
use core::time::Duration;

use crate::frame::FEND;
use crate::AnyhowResult;

/// Trait for objects which carry bytes between the host and the programmer.
///
/// Providers implement `write()` and `read_nonblock()`; the framing layer reads
/// one byte at a time so providers need not buffer beyond what the port does.
pub trait Link {
    /// Write all bytes in `data`.
    fn write(&mut self, data: &[u8]) -> AnyhowResult<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the first one.
    ///
    /// Returns the number of bytes read, or 0 on timeout.
    fn read_nonblock(&mut self, buf: &mut [u8], timeout: Duration) -> AnyhowResult<usize>;

    /// Flush any buffered output.
    fn flush(&mut self) -> AnyhowResult<()> {
        Ok(())
    }
}

impl<L: Link + ?Sized> Link for &mut L {
    fn write(&mut self, data: &[u8]) -> AnyhowResult<()> {
        (**self).write(data)
    }

    fn read_nonblock(&mut self, buf: &mut [u8], timeout: Duration) -> AnyhowResult<usize> {
        (**self).read_nonblock(buf, timeout)
    }

    fn flush(&mut self) -> AnyhowResult<()> {
        (**self).flush()
    }
}

/// Read one frame from `link` into `buf`.
///
/// Waits up to `first_byte_timeout` for anything to arrive and returns `false` if
/// nothing does. Delimiters before the first frame byte are skipped. Bytes are then
/// collected until the closing delimiter (kept in `buf`), until `max_len` bytes have
/// been collected, or until no byte arrives within `byte_timeout`. A frame cut short
/// is still returned; its checksum will not match.
pub fn read_frame<L: Link + ?Sized>(
    link: &mut L, buf: &mut Vec<u8>, first_byte_timeout: Duration, byte_timeout: Duration,
    max_len: usize,
) -> AnyhowResult<bool> {
    buf.clear();
    let mut byte = [0u8; 1];
    if link.read_nonblock(&mut byte, first_byte_timeout)? == 0 {
        return Ok(false);
    }
    let mut received = 1;
    loop {
        if byte[0] == FEND {
            if !buf.is_empty() {
                buf.push(FEND);
                break;
            }
        } else {
            buf.push(byte[0]);
        }
        if buf.len() >= max_len || link.read_nonblock(&mut byte, byte_timeout)? == 0 {
            break;
        }
        received += 1;
    }
    log::trace!("Received {} bytes, frame {:02X?}", received, buf);
    Ok(true)
}

#[cfg(feature = "std")]
pub mod serial {
    //! Serial port link.

    use super::*;
    use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};

    /// Baud rate the programmer firmware listens at.
    pub const DEFAULT_BAUD: u32 = 230_400;

    /// Serial port link.
    pub struct SerialLink {
        port: Box<dyn SerialPort>,
    }

    impl SerialLink {
        /// Open `device` at `baud`, or `DEFAULT_BAUD` if not given, as 8N1 without
        /// flow control.
        pub fn open(device: &str, baud: Option<u32>) -> AnyhowResult<Self> {
            let baud = baud.unwrap_or(DEFAULT_BAUD);
            let port = serialport::new(device, baud)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_secs(1))
                .open()?;
            log::info!("Opened serial port {} at {} baud", device, baud);
            Ok(SerialLink { port })
        }
    }

    impl Link for SerialLink {
        fn write(&mut self, data: &[u8]) -> AnyhowResult<()> {
            self.port.write_all(data)?;
            Ok(())
        }

        fn read_nonblock(&mut self, buf: &mut [u8], timeout: Duration) -> AnyhowResult<usize> {
            let old_timeout = self.port.timeout();
            self.port.set_timeout(timeout)?;
            let result = match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e.into()),
            };
            self.port.set_timeout(old_timeout)?;
            result
        }

        fn flush(&mut self) -> AnyhowResult<()> {
            self.port.flush()?;
            Ok(())
        }
    }
}

#[cfg(test)]
use crate::sim::MemoryLink;
#[cfg(test)]
use alloc::vec;

#[cfg(test)]
const T: Duration = Duration::from_millis(50);

#[test]
fn test_read_frame() {
    let mut link = MemoryLink::new();
    let mut buf = Vec::new();
    assert!(!read_frame(&mut link, &mut buf, T, T, 64).unwrap());

    // Idle delimiters ahead of the frame are skipped, the closing one kept,
    // and the second frame stays queued.
    link.feed(&[FEND, FEND, 0x9F, 0x60, FEND, 0x83, 0x7C, FEND]);
    assert!(read_frame(&mut link, &mut buf, T, T, 64).unwrap());
    assert_eq!(buf, vec![0x9F, 0x60, FEND]);
    assert!(read_frame(&mut link, &mut buf, T, T, 64).unwrap());
    assert_eq!(buf, vec![0x83, 0x7C, FEND]);
    assert!(!read_frame(&mut link, &mut buf, T, T, 64).unwrap());
}

#[test]
fn test_read_frame_bounds() {
    let mut link = MemoryLink::new();
    let mut buf = Vec::new();

    // Truncated frame: returned as received when the line goes quiet.
    link.feed(&[FEND, 0x03, 0x00]);
    assert!(read_frame(&mut link, &mut buf, T, T, 64).unwrap());
    assert_eq!(buf, vec![0x03, 0x00]);

    // Capacity reached before a delimiter.
    link.feed(&[0x01, 0x02, 0x03, 0x04, 0x05, FEND]);
    assert!(read_frame(&mut link, &mut buf, T, T, 4).unwrap());
    assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04]);

    // Only delimiters: something arrived, but no frame.
    let mut link = MemoryLink::new();
    link.feed(&[FEND, FEND]);
    assert!(read_frame(&mut link, &mut buf, T, T, 64).unwrap());
    assert!(buf.is_empty());
}
