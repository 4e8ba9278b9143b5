//! Deadline-bound raw I/O over a connected stream.
//!
//! Every read and write is issued against an explicit deadline derived from
//! the connection's configured timeout. Nothing here buffers ahead of the
//! caller: in binary mode a read-ahead would desynchronize the framing, so
//! [`FramedTransport::read_line`] fetches one byte at a time and is only ever
//! used in ASCII mode and during the ASCII bootstrap.

use std::io::{self, prelude::*};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use byteorder::{ReadBytesExt, BE};
use color_eyre::eyre::bail;
use color_eyre::Result;

use crate::proto::ProtocolError;

/// A connected byte stream the client can run the protocol over.
///
/// Implemented for [`TcpStream`]; test harnesses implement it for in-memory
/// duplex pipes.
pub trait Wire: Read + Write + Send {
    /// Arm or clear the per-operation deadline for subsequent reads and
    /// writes. `None` means block indefinitely.
    fn set_io_deadline(&mut self, deadline: Option<Duration>) -> io::Result<()>;

    /// Tear the stream down in both directions.
    fn shutdown_both(&mut self) -> io::Result<()>;
}

impl Wire for TcpStream {
    fn set_io_deadline(&mut self, deadline: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(deadline)?;
        self.set_write_timeout(deadline)
    }

    fn shutdown_both(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

const DRAIN_CHUNK: usize = 4096;

/// Raw stream access with aligned reads/writes and per-operation deadlines.
#[derive(Debug)]
pub struct FramedTransport<W: Wire> {
    wire: W,
    /// Per-operation timeout; zero means no deadline.
    timeout: Duration,
}

impl<W: Wire> FramedTransport<W> {
    /// Wrap a connected stream.
    pub fn new(wire: W, timeout: Duration) -> Self {
        FramedTransport { wire, timeout }
    }

    /// Change the timeout applied to subsequent operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The currently configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn arm_deadline(&mut self) -> io::Result<()> {
        let deadline = if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        };
        self.wire.set_io_deadline(deadline)
    }

    /// Write all of `bytes`, then flush.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.arm_deadline()?;
        self.wire.write_all(bytes)?;
        self.wire.flush()?;
        Ok(())
    }

    /// Fill `buf` completely or fail.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        self.arm_deadline()?;
        self.wire.read_exact(buf)?;
        Ok(())
    }

    /// Read one big-endian `i32`.
    pub fn read_i32_be(&mut self) -> Result<i32> {
        self.arm_deadline()?;
        Ok(self.wire.read_i32::<BE>()?)
    }

    /// Read one big-endian `u32`.
    pub fn read_u32_be(&mut self) -> Result<u32> {
        self.arm_deadline()?;
        Ok(self.wire.read_u32::<BE>()?)
    }

    /// Read up to `max_len` bytes until a `\n` is observed. The terminating
    /// byte is included iff `include_newline`. Reads are unbuffered so the
    /// stream position after the call is exactly one byte past the newline.
    pub fn read_line(&mut self, max_len: usize, include_newline: bool) -> Result<Vec<u8>> {
        self.arm_deadline()?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.wire.read_exact(&mut byte)?;
            if byte[0] == b'\n' {
                if include_newline {
                    line.push(b'\n');
                }
                return Ok(line);
            }
            line.push(byte[0]);
            if line.len() >= max_len {
                bail!(ProtocolError(format!(
                    "line exceeded {max_len} bytes without a newline"
                )));
            }
        }
    }

    /// Read and discard exactly `n` bytes.
    pub fn drain_bytes(&mut self, n: usize) -> Result<()> {
        self.arm_deadline()?;
        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(DRAIN_CHUNK);
            self.wire.read_exact(&mut scratch[..take])?;
            remaining -= take;
        }
        Ok(())
    }

    /// Close the stream in both directions; best effort.
    pub fn shutdown(&mut self) {
        let _ = self.wire.shutdown_both();
    }
}

#[cfg(test)]
pub(crate) mod testwire {
    //! In-memory duplex streams for exercising the codecs without sockets.

    use super::*;

    pub(crate) type DuplexWire = readwrite::ReadWrite<pipe::PipeReader, pipe::PipeWriter>;

    impl Wire for DuplexWire {
        fn set_io_deadline(&mut self, _deadline: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown_both(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A connected pair: bytes written to one end are read from the other.
    pub(crate) fn pair() -> (DuplexWire, DuplexWire) {
        let (client_rx, server_tx) = pipe::pipe();
        let (server_rx, client_tx) = pipe::pipe();
        (
            readwrite::ReadWrite::new(client_rx, client_tx),
            readwrite::ReadWrite::new(server_rx, server_tx),
        )
    }
}
