/*! Blocking duplex transports a connection is served over.

The framing layer only needs three operations, so the trait stays small and
object safe: anything that can read some bytes, write all given bytes and
shut down qualifies. TCP and Unix sockets are provided; tests plug in
scripted in-memory doubles.
*/
use std::io::{Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::error::{Error, Result};

/// A blocking byte channel between the FastCGI client and this application.
pub trait Transport {
    /// Reads up to `buf.len()` bytes. Partial reads are allowed; `0` means
    /// the peer closed the channel.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole of `buf` or fails.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Shuts the channel down. Further reads and writes fail.
    fn close(&mut self) -> Result<()>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(Read::read(self, buf)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(Write::write_all(self, buf)?)
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.shutdown(std::net::Shutdown::Both)?)
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(Read::read(self, buf)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(Write::write_all(self, buf)?)
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.shutdown(std::net::Shutdown::Both)?)
    }
}

/// Fills `buf` completely. A peer close mid-record is a protocol violation.
pub(crate) fn read_full(io: &mut dyn Transport, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::protocol("peer closed the connection mid-record"));
        }
        filled += n;
    }
    Ok(())
}
