//! Buffer and block lifecycle over the binary dialect, plus the ASCII
//! buffer commands.
//!
//! Handles are plain `Copy` ids; the registry behind the connection lock
//! owns the real state. Ids are assigned client-side from monotonic
//! counters and checked against the server's echo. The happy path is
//! CREATE_BUFFER → ENABLE_BUFFER → (CREATE_BLOCK → TRANSFER_BLOCK →
//! FREE_BLOCK)* → DISABLE_BUFFER → FREE_BUFFER.

use std::collections::HashMap;

use color_eyre::eyre::bail;
use color_eyre::Result;
use log::debug;

use crate::ascii;
use crate::binary;
use crate::conn::Manager;
use crate::proto::{
    block_code, encode_channel_mask, put_block_size, Opcode, ProtocolError, ResponseShape,
    ValidationError,
};
use crate::transport::Wire;

/// Handle to a server-side buffer, valid until freed or the connection
/// closes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u16);

impl BufferId {
    /// The raw wire id.
    pub fn value(self) -> u16 {
        self.0
    }
}

/// Handle to a block within a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub(crate) buffer: u16,
    pub(crate) block: u16,
}

impl BlockId {
    /// The owning buffer.
    pub fn buffer(self) -> BufferId {
        BufferId(self.buffer)
    }

    /// The raw block id.
    pub fn value(self) -> u16 {
        self.block
    }

    /// The composed `code` field block operations travel with.
    pub fn wire_code(self) -> i32 {
        block_code(self.buffer, self.block)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BlockState {
    pub(crate) size: usize,
    pub(crate) in_flight: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct BufferState {
    pub(crate) device: u8,
    pub(crate) channels: Vec<u8>,
    pub(crate) cyclic: bool,
    pub(crate) enabled: bool,
    pub(crate) next_block_id: u16,
    pub(crate) blocks: HashMap<u16, BlockState>,
}

impl<W: Wire> Manager<W> {
    /// CREATE_BUFFER: register a buffer for `channels` of the device at
    /// `device_index`. The channel set is sorted and deduplicated before the
    /// mask is encoded; the server's id echo is checked against the id we
    /// assigned.
    pub fn create_buffer(
        &self,
        device_index: u8,
        channels: &[u8],
        cyclic: bool,
    ) -> Result<BufferId> {
        let mut channels = channels.to_vec();
        channels.sort_unstable();
        channels.dedup();
        let mask = encode_channel_mask(&channels)?;
        self.with_session(|session| {
            session.require_binary()?;
            let id = session.next_buffer_id;
            session.next_buffer_id = session.next_buffer_id.wrapping_add(1);
            let reply =
                session.transact_checked(Opcode::CREATE_BUFFER, device_index, id as i32, &[&mask])?;
            if reply.aux != id as u32 {
                bail!(ProtocolError(format!(
                    "server echoed buffer id {} for our id {id}",
                    reply.aux
                )));
            }
            session.buffers.insert(
                id,
                BufferState {
                    device: device_index,
                    channels,
                    cyclic,
                    enabled: false,
                    next_block_id: 0,
                    blocks: HashMap::new(),
                },
            );
            debug!(target: "iiod", "created buffer {id} on device {device_index}");
            Ok(BufferId(id))
        })
    }

    /// ENABLE_BUFFER: start the buffer. Blocks cannot be created or
    /// transferred before this succeeds.
    pub fn enable_buffer(&self, buffer: BufferId) -> Result<()> {
        self.with_session(|session| {
            let device = buffer_device(&session.buffers, buffer)?;
            session.transact_checked(Opcode::ENABLE_BUFFER, device, buffer.0 as i32, &[])?;
            if let Some(state) = session.buffers.get_mut(&buffer.0) {
                state.enabled = true;
            }
            Ok(())
        })
    }

    /// DISABLE_BUFFER: stop the buffer; the handle stays valid for FREE.
    pub fn disable_buffer(&self, buffer: BufferId) -> Result<()> {
        self.with_session(|session| {
            let device = buffer_device(&session.buffers, buffer)?;
            session.transact_checked(Opcode::DISABLE_BUFFER, device, buffer.0 as i32, &[])?;
            if let Some(state) = session.buffers.get_mut(&buffer.0) {
                state.enabled = false;
                for block in state.blocks.values_mut() {
                    block.in_flight = false;
                }
            }
            Ok(())
        })
    }

    /// FREE_BUFFER: release the buffer and every block it owns.
    pub fn free_buffer(&self, buffer: BufferId) -> Result<()> {
        self.with_session(|session| {
            let device = buffer_device(&session.buffers, buffer)?;
            session.transact_checked(Opcode::FREE_BUFFER, device, buffer.0 as i32, &[])?;
            session.buffers.remove(&buffer.0);
            Ok(())
        })
    }

    /// CREATE_BLOCK: allocate a transfer block of `size` bytes. Fails before
    /// any wire I/O when `size` is zero or the buffer was never enabled.
    pub fn create_block(&self, buffer: BufferId, size: usize) -> Result<BlockId> {
        if size == 0 {
            bail!(ValidationError("block size must be positive".to_string()));
        }
        self.with_session(|session| {
            let (device, block) = {
                let state = buffer_state_mut(&mut session.buffers, buffer)?;
                if !state.enabled {
                    bail!(ValidationError(format!(
                        "buffer {} is not enabled",
                        buffer.0
                    )));
                }
                let block = state.next_block_id;
                state.next_block_id = state.next_block_id.wrapping_add(1);
                (state.device, block)
            };
            let id = BlockId {
                buffer: buffer.0,
                block,
            };
            let mut payload = Vec::with_capacity(8);
            put_block_size(&mut payload, size as u64)?;
            let reply =
                session.transact_checked(Opcode::CREATE_BLOCK, device, id.wire_code(), &[&payload])?;
            if reply.aux != block as u32 {
                bail!(ProtocolError(format!(
                    "server echoed block id {} for our id {block}",
                    reply.aux
                )));
            }
            if let Some(state) = session.buffers.get_mut(&buffer.0) {
                state.blocks.insert(
                    block,
                    BlockState {
                        size,
                        in_flight: false,
                    },
                );
            }
            Ok(id)
        })
    }

    /// FREE_BLOCK: release one block.
    pub fn free_block(&self, block: BlockId) -> Result<()> {
        self.with_session(|session| {
            let device = buffer_device(&session.buffers, block.buffer())?;
            session.transact_checked(Opcode::FREE_BLOCK, device, block.wire_code(), &[])?;
            if let Some(state) = session.buffers.get_mut(&block.buffer) {
                state.blocks.remove(&block.block);
            }
            Ok(())
        })
    }

    /// TRANSFER_BLOCK, capture direction: fill `dst` from the device.
    ///
    /// Returns the server-reported byte count; `dst` receives
    /// `min(reported, dst.len())` bytes and any excess is drained so the
    /// stream stays aligned. Cyclic buffers use
    /// [`enqueue_block_cyclic`](Self::enqueue_block_cyclic) instead.
    pub fn transfer_block(&self, block: BlockId, dst: &mut [u8]) -> Result<usize> {
        self.with_session(|session| {
            let (device, size) = checked_block(session, block, false)?;
            let client_id = session.require_binary()?;
            let mut payload = Vec::with_capacity(8);
            put_block_size(&mut payload, size as u64)?;
            binary::send_command(
                &mut session.transport,
                client_id,
                Opcode::TRANSFER_BLOCK,
                device,
                block.wire_code(),
                &[&payload],
            )?;
            binary::read_reply_into(
                &mut session.transport,
                Opcode::TRANSFER_BLOCK,
                client_id,
                dst,
            )
        })
    }

    /// TRANSFER_BLOCK, output direction: push `data` to the device. The
    /// reply is status-only in this direction.
    pub fn submit_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            bail!(ValidationError("refusing to submit an empty block".to_string()));
        }
        self.with_session(|session| {
            let (device, size) = checked_block(session, block, false)?;
            if data.len() > size {
                bail!(ValidationError(format!(
                    "{} bytes do not fit a {size}-byte block",
                    data.len()
                )));
            }
            let client_id = session.require_binary()?;
            let mut head = Vec::with_capacity(8);
            put_block_size(&mut head, data.len() as u64)?;
            binary::send_command(
                &mut session.transport,
                client_id,
                Opcode::TRANSFER_BLOCK,
                device,
                block.wire_code(),
                &[&head, data],
            )?;
            let reply =
                binary::read_reply_shaped(&mut session.transport, ResponseShape::Status, client_id)?
                    .ok_or_else(|| ProtocolError::new("missing TRANSFER_BLOCK status"))?;
            if reply.status < 0 {
                bail!(crate::proto::DeviceError::new(reply.status));
            }
            Ok(())
        })
    }

    /// ENQUEUE_BLOCK_CYCLIC: hand one block to the server for cyclic
    /// replay. At most one block per buffer may be in flight; the server
    /// repeats it until the buffer is disabled.
    pub fn enqueue_block_cyclic(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            bail!(ValidationError("refusing to enqueue an empty block".to_string()));
        }
        self.with_session(|session| {
            let (device, size) = checked_block(session, block, true)?;
            if data.len() > size {
                bail!(ValidationError(format!(
                    "{} bytes do not fit a {size}-byte block",
                    data.len()
                )));
            }
            if let Some(state) = session.buffers.get(&block.buffer) {
                if state.blocks.values().any(|b| b.in_flight) {
                    bail!(ValidationError(format!(
                        "buffer {} already has a block in flight",
                        block.buffer
                    )));
                }
            }
            let mut head = Vec::with_capacity(8);
            put_block_size(&mut head, data.len() as u64)?;
            session.transact_checked(
                Opcode::ENQUEUE_BLOCK_CYCLIC,
                device,
                block.wire_code(),
                &[&head, data],
            )?;
            if let Some(state) = session.buffers.get_mut(&block.buffer) {
                if let Some(b) = state.blocks.get_mut(&block.block) {
                    b.in_flight = true;
                }
            }
            Ok(())
        })
    }

    /// RETRY_DEQUEUE_BLOCK: nudge a cyclic block the server timed out on.
    pub fn retry_dequeue_block(&self, block: BlockId) -> Result<()> {
        self.with_session(|session| {
            let (device, _) = checked_block(session, block, true)?;
            session.transact_checked(Opcode::RETRY_DEQUEUE_BLOCK, device, block.wire_code(), &[])?;
            Ok(())
        })
    }

    /// The registered byte size of a block.
    pub fn block_size(&self, block: BlockId) -> Result<usize> {
        self.with_session(|session| {
            let state = buffer_state(&session.buffers, block.buffer())?;
            match state.blocks.get(&block.block) {
                Some(b) => Ok(b.size),
                None => bail!(ValidationError(format!(
                    "unknown block {} on buffer {}",
                    block.block, block.buffer
                ))),
            }
        })
    }

    /// `OPEN <dev> <samples> 0x<mask>[ CYCLIC]` in the ASCII dialect.
    pub fn open_buffer_ascii(
        &self,
        dev: &str,
        samples: usize,
        mask_hex: &str,
        cyclic: bool,
    ) -> Result<()> {
        if samples == 0 {
            bail!(ValidationError("sample count must be positive".to_string()));
        }
        if mask_hex.is_empty() || !mask_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!(ValidationError(format!("bad channel mask {mask_hex:?}")));
        }
        let cmd = if cyclic {
            format!("OPEN {dev} {samples} 0x{mask_hex} CYCLIC")
        } else {
            format!("OPEN {dev} {samples} 0x{mask_hex}")
        };
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::exec_checked(&mut session.transport, &cmd)?;
            Ok(())
        })
    }

    /// `READBUF <dev> <len>`: fill `dst`, returning the byte count and the
    /// channel-mask line.
    pub fn read_buffer_ascii(&self, dev: &str, dst: &mut [u8]) -> Result<(usize, String)> {
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::readbuf(&mut session.transport, dev, dst)
        })
    }

    /// `WRITEBUF <dev> <len>` plus the raw payload; returns the accepted
    /// byte count.
    pub fn write_buffer_ascii(&self, dev: &str, data: &[u8]) -> Result<usize> {
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::writebuf(&mut session.transport, dev, data)
        })
    }

    /// `CLOSE <dev>`.
    pub fn close_buffer_ascii(&self, dev: &str) -> Result<()> {
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::exec_checked(&mut session.transport, &format!("CLOSE {dev}"))?;
            Ok(())
        })
    }

    /// `SET <dev> BUFFERS_COUNT <n>` (ASCII only; the binary dialect has no
    /// equivalent opcode).
    pub fn set_buffers_count_ascii(&self, dev: &str, count: u32) -> Result<()> {
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::exec_checked(
                &mut session.transport,
                &format!("SET {dev} BUFFERS_COUNT {count}"),
            )?;
            Ok(())
        })
    }
}

fn buffer_state<'a>(
    buffers: &'a HashMap<u16, BufferState>,
    buffer: BufferId,
) -> Result<&'a BufferState> {
    match buffers.get(&buffer.0) {
        Some(state) => Ok(state),
        None => bail!(ValidationError(format!("unknown buffer {}", buffer.0))),
    }
}

fn buffer_state_mut<'a>(
    buffers: &'a mut HashMap<u16, BufferState>,
    buffer: BufferId,
) -> Result<&'a mut BufferState> {
    match buffers.get_mut(&buffer.0) {
        Some(state) => Ok(state),
        None => bail!(ValidationError(format!("unknown buffer {}", buffer.0))),
    }
}

fn buffer_device(buffers: &HashMap<u16, BufferState>, buffer: BufferId) -> Result<u8> {
    Ok(buffer_state(buffers, buffer)?.device)
}

fn checked_block<W: Wire>(
    session: &crate::conn::Session<W>,
    block: BlockId,
    want_cyclic: bool,
) -> Result<(u8, usize)> {
    let state = buffer_state(&session.buffers, block.buffer())?;
    if !state.enabled {
        bail!(ValidationError(format!(
            "buffer {} is not enabled",
            block.buffer
        )));
    }
    if state.cyclic != want_cyclic {
        let (this, that) = if want_cyclic {
            ("cyclic transfers", "TRANSFER_BLOCK")
        } else {
            ("TRANSFER_BLOCK", "cyclic transfers")
        };
        bail!(ValidationError(format!(
            "buffer {} was created for {that}, not {this}",
            block.buffer
        )));
    }
    match state.blocks.get(&block.block) {
        Some(b) => Ok((state.device, b.size)),
        None => bail!(ValidationError(format!(
            "unknown block {} on buffer {}",
            block.block, block.buffer
        ))),
    }
}
