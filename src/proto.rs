//! IIOD wire protocol constants, opcode tables, and frame primitives.
//!
//! The daemon speaks two dialects over one TCP stream: a line-oriented ASCII
//! dialect and a length-framed binary dialect. This module owns what both
//! dialects agree on: the 8-byte binary command header, the per-opcode
//! response plan, the payload encodings, and the error types shared by the
//! rest of the crate.
//!
//! Note the endianness asymmetry: headers and length prefixes are big-endian,
//! while channel masks and block sizes are little-endian words. The reference
//! daemon does it this way.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use byteorder::{ReadBytesExt, WriteBytesExt, BE, LE};
use color_eyre::eyre::bail;
use color_eyre::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default TCP port the daemon listens on.
pub const TCP_PORT: u16 = 30431;

/// Hard cap on any length-prefixed payload, requests and responses alike.
pub const MAX_PAYLOAD: usize = 20 * 1024 * 1024;

/// Highest device index that fits the binary command header.
pub const MAX_DEVICE_INDEX: u8 = 0x7F;

/// Size of the fixed binary command/response header.
pub const HEADER_LEN: usize = 8;

/// A framing or shape violation on the wire. Terminal for the connection.
#[derive(Debug, Clone)]
pub struct ProtocolError(pub String);

impl ProtocolError {
    /// Build from anything string-like.
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "iiod protocol error: {}", self.0)
    }
}

impl Error for ProtocolError {}

/// A negative status code returned by the daemon, carrying the errno value
/// as it appeared on the wire (so EINVAL is stored as -22).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    /// Wire status, always negative.
    pub errno: i32,
}

impl DeviceError {
    /// Wrap a negative wire status.
    pub fn new(errno: i32) -> Self {
        DeviceError { errno }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match Errno::try_from(-self.errno) {
            Ok(e) => write!(f, "device error: {:?} ({})", e, self.errno),
            Err(_) => write!(f, "device error: errno {}", self.errno),
        }
    }
}

impl Error for DeviceError {}

/// A command was issued in the wrong connection mode. Recoverable.
#[derive(Debug, Clone, Copy)]
pub struct ModeError {
    /// Mode the command needs.
    pub required: &'static str,
    /// Mode the connection is in.
    pub current: &'static str,
}

impl fmt::Display for ModeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "command requires {} mode but the connection is in {} mode",
            self.required, self.current
        )
    }
}

impl Error for ModeError {}

/// An argument was rejected before any wire activity.
#[derive(Debug, Clone)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid argument: {}", self.0)
    }
}

impl Error for ValidationError {}

/// A binary reply turned out to be a legacy server answering in ASCII with an
/// XML body. Carries the header bytes already consumed so the compat layer
/// can realign the stream and retry in ASCII.
#[derive(Debug, Clone)]
pub struct LegacyXmlReply {
    /// The eight bytes read where a response header was expected.
    pub head: Vec<u8>,
}

impl fmt::Display for LegacyXmlReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "legacy server answered a binary request with XML")
    }
}

impl Error for LegacyXmlReply {}

/// Errno values the daemon is known to return. The wire carries them negated.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EIO = 5,
    EBADF = 9,
    EAGAIN = 11,
    ENOMEM = 12,
    EBUSY = 16,
    ENODEV = 19,
    EINVAL = 22,
    ENOSPC = 28,
    EPIPE = 32,
    ENOSYS = 38,
    ENODATA = 61,
    ENOTSUP = 95,
    ETIMEDOUT = 110,
}

/// Binary dialect opcodes. `RESPONSE` is server-only and is refused as a
/// request by [`Header::put`].
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    RESPONSE = 0x00,
    PRINT = 0x01,
    TIMEOUT = 0x02,
    READ_ATTR = 0x03,
    READ_DBG_ATTR = 0x04,
    READ_BUF_ATTR = 0x05,
    READ_CHN_ATTR = 0x06,
    WRITE_ATTR = 0x07,
    WRITE_DBG_ATTR = 0x08,
    WRITE_BUF_ATTR = 0x09,
    WRITE_CHN_ATTR = 0x0A,
    GET_TRIG = 0x0B,
    SET_TRIG = 0x0C,
    CREATE_BUFFER = 0x0D,
    FREE_BUFFER = 0x0E,
    ENABLE_BUFFER = 0x0F,
    DISABLE_BUFFER = 0x10,
    CREATE_BLOCK = 0x11,
    FREE_BLOCK = 0x12,
    TRANSFER_BLOCK = 0x13,
    ENQUEUE_BLOCK_CYCLIC = 0x14,
    RETRY_DEQUEUE_BLOCK = 0x15,
    CREATE_EV_STREAM = 0x16,
    FREE_EV_STREAM = 0x17,
    READ_EVENT = 0x18,
}

/// Layout of a response. The RESPONSE header's `code` field is the status of
/// every shape; payload-bearing shapes append a big-endian `u32` length and
/// that many raw bytes. A negative status terminates the response with no
/// tail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseShape {
    /// The server sends no response header at all.
    None,
    /// Header only; status in the header's `code`.
    Status,
    /// Header, then one auxiliary `u32` (typically an id echo).
    StatusAndU32,
    /// Header, then `u32` length and that many bytes.
    StatusAndLPBytes,
    /// Header, then auxiliary `u32`, then `u32` length and bytes.
    StatusAndU32AndLPBytes,
}

impl Opcode {
    /// The response plan for this opcode, frozen at compile time.
    pub fn response_shape(self) -> ResponseShape {
        use Opcode::*;
        use ResponseShape::*;
        match self {
            // Server-only; never sent, so never waited on.
            RESPONSE => None,
            PRINT => StatusAndLPBytes,
            TIMEOUT => None,
            READ_ATTR | READ_DBG_ATTR | READ_BUF_ATTR | READ_CHN_ATTR => StatusAndLPBytes,
            WRITE_ATTR | WRITE_DBG_ATTR | WRITE_BUF_ATTR | WRITE_CHN_ATTR => Status,
            GET_TRIG => StatusAndLPBytes,
            SET_TRIG => Status,
            CREATE_BUFFER => StatusAndU32,
            FREE_BUFFER | ENABLE_BUFFER | DISABLE_BUFFER => Status,
            CREATE_BLOCK => StatusAndU32,
            FREE_BLOCK => Status,
            TRANSFER_BLOCK => StatusAndLPBytes,
            ENQUEUE_BLOCK_CYCLIC | RETRY_DEQUEUE_BLOCK => Status,
            CREATE_EV_STREAM => StatusAndU32,
            FREE_EV_STREAM => Status,
            READ_EVENT => StatusAndLPBytes,
        }
    }

    /// Whether this opcode may be sent by a client.
    pub fn is_request(self) -> bool {
        self != Opcode::RESPONSE
    }
}

/// The fixed 8-byte command/response header, network byte order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    /// Client identifier assigned at binary-mode entry; never zero.
    pub client_id: u16,
    /// Operation selector.
    pub opcode: Opcode,
    /// Device index, `0..=0x7F`.
    pub device: u8,
    /// Opcode-dependent: sample count, buffer id, composed block code, or
    /// status in responses.
    pub code: i32,
}

impl Header {
    /// Serialize the header. Refuses server-only opcodes and out-of-range
    /// device indices before touching the stream.
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        if !self.opcode.is_request() {
            bail!(ProtocolError::new("RESPONSE is a server-only opcode"));
        }
        if self.device > MAX_DEVICE_INDEX {
            bail!(ValidationError(format!(
                "device index {} out of range",
                self.device
            )));
        }
        stream.write_u16::<BE>(self.client_id)?;
        stream.write_u8(self.opcode.into())?;
        stream.write_u8(self.device)?;
        stream.write_i32::<BE>(self.code)?;
        Ok(())
    }

    /// Parse a header from 8 raw bytes.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut r = io::Cursor::new(bytes);
        let client_id = r.read_u16::<BE>()?;
        let op = r.read_u8()?;
        let opcode = Opcode::try_from(op)
            .map_err(|_| ProtocolError(format!("unknown opcode {op:#04x} in header")))?;
        let device = r.read_u8()?;
        let code = r.read_i32::<BE>()?;
        Ok(Header {
            client_id,
            opcode,
            device,
            code,
        })
    }
}

/// Append `u32 length (BE) ‖ bytes`.
pub fn put_lp_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    if data.len() > MAX_PAYLOAD {
        bail!(ValidationError(format!(
            "payload of {} bytes exceeds the {} byte cap",
            data.len(),
            MAX_PAYLOAD
        )));
    }
    buf.write_u32::<BE>(data.len() as u32)?;
    buf.write_all(data)?;
    Ok(())
}

/// Append a length-prefixed UTF-8 string.
pub fn put_lp_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    put_lp_bytes(buf, s.as_bytes())
}

/// Append `lp_string(name) ‖ lp_string(value)`.
pub fn put_name_value(buf: &mut Vec<u8>, name: &str, value: &str) -> Result<()> {
    put_lp_string(buf, name)?;
    put_lp_string(buf, value)?;
    Ok(())
}

/// Encode an enabled-channel set as `⌈(max+1)/32⌉` little-endian `u32` words
/// with bit `i` set iff channel `i` is enabled. The input need not be sorted
/// or deduplicated.
pub fn encode_channel_mask(channels: &[u8]) -> Result<Vec<u8>> {
    if channels.is_empty() {
        bail!(ValidationError("channel set must not be empty".to_string()));
    }
    let max = channels.iter().max().copied().unwrap_or(0) as usize;
    let words = max / 32 + 1;
    let mut mask = vec![0u32; words];
    for &ch in channels {
        mask[ch as usize / 32] |= 1 << (ch as usize % 32);
    }
    let mut out = Vec::with_capacity(words * 4);
    for w in mask {
        out.write_u32::<LE>(w)?;
    }
    Ok(out)
}

/// Decode a channel mask back into the sorted channel set. The inverse of
/// [`encode_channel_mask`].
pub fn decode_channel_mask(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        bail!(ProtocolError(format!(
            "channel mask of {} bytes is not a whole number of words",
            bytes.len()
        )));
    }
    let mut channels = Vec::new();
    let mut r = io::Cursor::new(bytes);
    for word in 0..bytes.len() / 4 {
        let w = r.read_u32::<LE>()?;
        for bit in 0..32 {
            if w & (1 << bit) != 0 {
                channels.push((word * 32 + bit) as u8);
            }
        }
    }
    Ok(channels)
}

/// Append a block size as a little-endian `u64`.
pub fn put_block_size(buf: &mut Vec<u8>, size: u64) -> Result<()> {
    buf.write_u64::<LE>(size)?;
    Ok(())
}

/// Compose the wire `code` for block operations:
/// `buffer_id | (block_id << 16)`.
pub fn block_code(buffer_id: u16, block_id: u16) -> i32 {
    (buffer_id as i32) | ((block_id as i32) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn channel_mask_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n = rng.gen_range(1..=16);
            let mut set: Vec<u8> = (0..n).map(|_| rng.gen_range(0..=127)).collect();
            let encoded = encode_channel_mask(&set).unwrap();
            set.sort_unstable();
            set.dedup();
            let max = *set.last().unwrap() as usize;
            assert_eq!(encoded.len(), 4 * (max / 32 + 1));
            assert_eq!(decode_channel_mask(&encoded).unwrap(), set);
        }
    }

    #[test]
    fn channel_mask_word_boundaries() {
        let encoded = encode_channel_mask(&[0, 3, 5]).unwrap();
        assert_eq!(encoded, vec![0x29, 0, 0, 0]);
        let encoded = encode_channel_mask(&[31]).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 0x80]);
        let encoded = encode_channel_mask(&[32]).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn channel_mask_rejects_empty_set() {
        let err = encode_channel_mask(&[]).unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[test]
    fn response_plan_is_total_and_refuses_server_opcodes() {
        for raw in 0x00..=0x18u8 {
            let op = Opcode::try_from(raw).expect("opcode table has a hole");
            assert_eq!(u8::from(op), raw);
            let _ = op.response_shape();
            assert_eq!(op.is_request(), raw != 0x00);
        }
        assert!(Opcode::try_from(0x19u8).is_err());
    }

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            client_id: 0x1234,
            opcode: Opcode::CREATE_BUFFER,
            device: 1,
            code: 7,
        };
        let mut buf = vec![];
        hdr.put(&mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0x0d, 0x01, 0x00, 0x00, 0x00, 0x07]);
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf);
        assert_eq!(Header::parse(&raw).unwrap(), hdr);
    }

    #[test]
    fn header_refuses_response_opcode() {
        let hdr = Header {
            client_id: 1,
            opcode: Opcode::RESPONSE,
            device: 0,
            code: 0,
        };
        let mut buf = vec![];
        let err = hdr.put(&mut buf).unwrap_err();
        assert!(err.downcast_ref::<ProtocolError>().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn header_refuses_out_of_range_device() {
        let hdr = Header {
            client_id: 1,
            opcode: Opcode::PRINT,
            device: 0x80,
            code: 0,
        };
        assert!(hdr.put(&mut vec![]).is_err());
    }

    #[test]
    fn header_rejects_unknown_opcode_in_reply() {
        let raw = [0u8, 1, 0x42, 0, 0, 0, 0, 0];
        let err = Header::parse(&raw).unwrap_err();
        assert!(err.downcast_ref::<ProtocolError>().is_some());
    }

    #[test]
    fn block_code_composition() {
        assert_eq!(block_code(1, 0), 1);
        assert_eq!(block_code(1, 2), 0x0002_0001);
        assert_eq!(block_code(0xFFFF, 0x7FFF), 0x7FFF_FFFF);
    }

    #[test]
    fn name_value_encoding() {
        let mut buf = vec![];
        put_name_value(&mut buf, "ab", "c").unwrap();
        assert_eq!(buf, [0, 0, 0, 2, b'a', b'b', 0, 0, 0, 1, b'c']);
    }

    #[test]
    fn device_error_names_known_errnos() {
        let msg = DeviceError::new(-22).to_string();
        assert!(msg.contains("EINVAL"), "{msg}");
        assert!(msg.contains("-22"), "{msg}");
        let msg = DeviceError::new(-9999).to_string();
        assert!(msg.contains("9999"), "{msg}");
    }
}
