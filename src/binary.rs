//! The length-framed binary dialect.
//!
//! Commands are an 8-byte header optionally followed by payload slices
//! written back-to-back; responses are one RESPONSE header whose `code` is
//! the status, followed by the shape-specific tail from the response plan in
//! [`crate::proto`]. A negative status carries no tail.

use color_eyre::eyre::bail;
use color_eyre::Result;
use log::{debug, warn};

use crate::proto::{
    DeviceError, Header, LegacyXmlReply, Opcode, ProtocolError, ResponseShape, HEADER_LEN,
    MAX_PAYLOAD,
};
use crate::transport::{FramedTransport, Wire};

/// A fully decoded binary response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status from the response header; negative is an errno.
    pub status: i32,
    /// Auxiliary word for `StatusAndU32`-style shapes, zero otherwise.
    pub aux: u32,
    /// Length-prefixed tail for payload-bearing shapes, empty otherwise.
    pub data: Vec<u8>,
}

/// Frame and send one command: header plus payload slices back-to-back, in a
/// single write.
pub fn send_command<W: Wire>(
    t: &mut FramedTransport<W>,
    client_id: u16,
    opcode: Opcode,
    device: u8,
    code: i32,
    payload: &[&[u8]],
) -> Result<()> {
    let total: usize = payload.iter().map(|p| p.len()).sum();
    if total > MAX_PAYLOAD {
        bail!(ProtocolError(format!(
            "request payload of {total} bytes exceeds the {MAX_PAYLOAD} byte cap"
        )));
    }
    let header = Header {
        client_id,
        opcode,
        device,
        code,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + total);
    header.put(&mut frame)?;
    for p in payload {
        frame.extend_from_slice(p);
    }
    debug!(target: "iiod", "binary> {:?} dev={} code={:#x} payload={}B", opcode, device, code, total);
    t.write_all(&frame)
}

/// Heuristic for a legacy ASCII/XML reply arriving where a binary response
/// header was expected. The v0.25 daemon answers binary attribute requests
/// it does not understand with an ASCII length line and an XML document.
pub(crate) fn looks_like_legacy_xml(head: &[u8]) -> bool {
    const MARKERS: [&[u8]; 4] = [b"<?xm", b"<con", b"DOCT", b"<dev"];
    if MARKERS
        .iter()
        .any(|m| head.windows(m.len()).any(|w| &w == m))
    {
        return true;
    }
    head.first().is_some_and(|b| b.is_ascii_digit())
        && head.contains(&b'\n')
        && head.contains(&b'<')
}

fn read_header<W: Wire>(t: &mut FramedTransport<W>, client_id: u16) -> Result<Header> {
    let mut raw = [0u8; HEADER_LEN];
    t.read_full(&mut raw)?;
    if looks_like_legacy_xml(&raw) {
        bail!(LegacyXmlReply { head: raw.to_vec() });
    }
    let header = Header::parse(&raw)?;
    if header.opcode != Opcode::RESPONSE {
        bail!(ProtocolError(format!(
            "expected a RESPONSE header, got {:?}",
            header.opcode
        )));
    }
    if header.client_id != client_id {
        warn!(
            target: "iiod",
            "response for client {:#06x} on a connection owned by {:#06x}",
            header.client_id, client_id
        );
    }
    Ok(header)
}

fn read_lp_tail<W: Wire>(t: &mut FramedTransport<W>) -> Result<Vec<u8>> {
    let len = t.read_u32_be()? as usize;
    if len > MAX_PAYLOAD {
        bail!(ProtocolError(format!(
            "announced payload of {len} bytes exceeds the {MAX_PAYLOAD} byte cap"
        )));
    }
    let mut data = vec![0u8; len];
    t.read_full(&mut data)?;
    Ok(data)
}

/// Read the response for `opcode` per the compile-time response plan.
/// Returns `None` for opcodes the server never replies to. Negative statuses
/// are returned in the reply, not raised; callers decide whether they are
/// fatal.
pub fn read_reply<W: Wire>(
    t: &mut FramedTransport<W>,
    opcode: Opcode,
    client_id: u16,
) -> Result<Option<Reply>> {
    read_reply_shaped(t, opcode.response_shape(), client_id)
}

/// Read a response of an explicit shape. TRANSFER_BLOCK is the one opcode
/// whose reply depends on direction: length-prefixed bytes coming in,
/// status-only going out.
pub(crate) fn read_reply_shaped<W: Wire>(
    t: &mut FramedTransport<W>,
    shape: ResponseShape,
    client_id: u16,
) -> Result<Option<Reply>> {
    if shape == ResponseShape::None {
        return Ok(None);
    }
    let header = read_header(t, client_id)?;
    let status = header.code;
    let mut reply = Reply {
        status,
        aux: 0,
        data: vec![],
    };
    if status < 0 {
        return Ok(Some(reply));
    }
    match shape {
        ResponseShape::None => {}
        ResponseShape::Status => {}
        ResponseShape::StatusAndU32 => {
            reply.aux = t.read_u32_be()?;
        }
        ResponseShape::StatusAndLPBytes => {
            reply.data = read_lp_tail(t)?;
        }
        ResponseShape::StatusAndU32AndLPBytes => {
            reply.aux = t.read_u32_be()?;
            reply.data = read_lp_tail(t)?;
        }
    }
    Ok(Some(reply))
}

/// Read a `StatusAndLPBytes` response directly into `dst`, draining any
/// excess the destination cannot hold. Returns the server-reported byte
/// count; a negative status becomes a [`DeviceError`].
pub fn read_reply_into<W: Wire>(
    t: &mut FramedTransport<W>,
    opcode: Opcode,
    client_id: u16,
    dst: &mut [u8],
) -> Result<usize> {
    debug_assert_eq!(opcode.response_shape(), ResponseShape::StatusAndLPBytes);
    let header = read_header(t, client_id)?;
    if header.code < 0 {
        bail!(DeviceError::new(header.code));
    }
    let len = t.read_u32_be()? as usize;
    if len > MAX_PAYLOAD {
        bail!(ProtocolError(format!(
            "announced payload of {len} bytes exceeds the {MAX_PAYLOAD} byte cap"
        )));
    }
    let take = len.min(dst.len());
    t.read_full(&mut dst[..take])?;
    if len > take {
        t.drain_bytes(len - take)?;
    }
    Ok(len)
}
