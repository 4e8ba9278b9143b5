//! The line-oriented ASCII dialect.
//!
//! Commands go out as `\r\n`-terminated lines; replies come back either as a
//! bare integer line or as an integer length followed by that many payload
//! bytes and a trailing `\n`. The trailing newline after a payload MUST be
//! consumed: leaving it in the stream desynchronizes the next integer parse.

use std::sync::OnceLock;

use color_eyre::eyre::bail;
use color_eyre::Result;
use log::debug;
use regex::Regex;

use crate::proto::{DeviceError, ProtocolError, MAX_PAYLOAD};
use crate::transport::{FramedTransport, Wire};

/// Longest integer reply line the parser will chew through. The daemon pads
/// some replies with garbage, so this is generous.
const MAX_INT_LINE: usize = 256;

/// Longest channel-mask line (hex digits) after a READBUF.
const MAX_MASK_LINE: usize = 1024;

fn integer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(-?\d+)").expect("static regex"))
}

/// Parse the canonical integer reply: leading NUL bytes stripped, optional
/// whitespace, an optionally-negative decimal, trailing garbage tolerated.
pub fn parse_integer_line(line: &[u8]) -> Result<i32> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_start_matches('\0');
    let caps = integer_re()
        .captures(text)
        .ok_or_else(|| ProtocolError(format!("unparsable integer line {text:?}")))?;
    caps[1]
        .parse::<i32>()
        .map_err(|_| ProtocolError(format!("integer reply {:?} out of range", &caps[1])).into())
}

/// Send one ASCII command, appending `\r\n` iff the caller did not supply a
/// line ending.
pub fn send_command<W: Wire>(t: &mut FramedTransport<W>, cmd: &str) -> Result<()> {
    debug!(target: "iiod", "ascii> {}", cmd.trim_end());
    if cmd.ends_with('\n') {
        t.write_all(cmd.as_bytes())
    } else {
        let mut line = Vec::with_capacity(cmd.len() + 2);
        line.extend_from_slice(cmd.as_bytes());
        line.extend_from_slice(b"\r\n");
        t.write_all(&line)
    }
}

/// Read one integer reply line.
pub fn read_integer_reply<W: Wire>(t: &mut FramedTransport<W>) -> Result<i32> {
    let line = t.read_line(MAX_INT_LINE, false)?;
    parse_integer_line(&line)
}

/// Send a command and read its integer reply. Value semantics are per
/// command: `0` success, positive a length or opaque success value, negative
/// an errno.
pub fn exec<W: Wire>(t: &mut FramedTransport<W>, cmd: &str) -> Result<i32> {
    send_command(t, cmd)?;
    read_integer_reply(t)
}

/// Like [`exec`] but a negative reply becomes a [`DeviceError`].
pub fn exec_checked<W: Wire>(t: &mut FramedTransport<W>, cmd: &str) -> Result<i32> {
    let status = exec(t, cmd)?;
    if status < 0 {
        bail!(DeviceError::new(status));
    }
    Ok(status)
}

/// Consume the single `\n` that terminates a payload.
fn drain_trailing_newline<W: Wire>(t: &mut FramedTransport<W>) -> Result<()> {
    let mut byte = [0u8; 1];
    t.read_full(&mut byte)?;
    if byte[0] != b'\n' {
        bail!(ProtocolError(format!(
            "expected newline after payload, found {:#04x}",
            byte[0]
        )));
    }
    Ok(())
}

/// Read a length-prefixed payload reply: integer line `N`, then exactly `N`
/// bytes, then a trailing `\n`. A negative `N` is a device error.
pub fn read_lp_payload<W: Wire>(t: &mut FramedTransport<W>) -> Result<Vec<u8>> {
    let n = read_integer_reply(t)?;
    if n < 0 {
        bail!(DeviceError::new(n));
    }
    let n = n as usize;
    if n > MAX_PAYLOAD {
        bail!(ProtocolError(format!(
            "announced payload of {n} bytes exceeds the {MAX_PAYLOAD} byte cap"
        )));
    }
    let mut payload = vec![0u8; n];
    t.read_full(&mut payload)?;
    drain_trailing_newline(t)?;
    Ok(payload)
}

/// Issue `READBUF <dev> <len>` and read the reply: integer chunk length `N`,
/// a hex channel-mask line, `N` raw bytes, and a trailing `\n`.
///
/// Returns the byte count and the mask line. With an empty `dst` the server
/// replies with a bare status and no mask or payload follows. If the server
/// announces more bytes than `dst` holds, the chunk and its newline are
/// drained before the error returns so the stream stays aligned.
pub fn readbuf<W: Wire>(
    t: &mut FramedTransport<W>,
    dev: &str,
    dst: &mut [u8],
) -> Result<(usize, String)> {
    send_command(t, &format!("READBUF {} {}", dev, dst.len()))?;
    let n = read_integer_reply(t)?;
    if n < 0 {
        bail!(DeviceError::new(n));
    }
    if dst.is_empty() {
        return Ok((0, String::new()));
    }
    let n = n as usize;
    let mask_line = t.read_line(MAX_MASK_LINE, false)?;
    let mask = String::from_utf8_lossy(&mask_line).into_owned();
    if n > dst.len() {
        t.drain_bytes(n)?;
        drain_trailing_newline(t)?;
        bail!(ProtocolError(format!(
            "server announced {n} bytes but the destination holds {}",
            dst.len()
        )));
    }
    t.read_full(&mut dst[..n])?;
    drain_trailing_newline(t)?;
    Ok((n, mask))
}

/// Issue `WRITEBUF <dev> <len>` followed by the raw payload; the integer
/// reply is the number of bytes accepted.
pub fn writebuf<W: Wire>(t: &mut FramedTransport<W>, dev: &str, data: &[u8]) -> Result<usize> {
    send_command(t, &format!("WRITEBUF {} {}", dev, data.len()))?;
    t.write_all(data)?;
    let status = read_integer_reply(t)?;
    if status < 0 {
        bail!(DeviceError::new(status));
    }
    Ok(status as usize)
}
