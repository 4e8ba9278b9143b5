//! Client library and diagnostic toolkit for the IIOD network protocol.
//!
//! IIOD is the daemon exposing Industrial I/O devices over TCP, notably on
//! PlutoSDR-class hardware. It speaks two dialects over one stream: a
//! line-oriented ASCII dialect and a length-framed binary dialect. This
//! crate auto-negotiates between them, reads and writes device attributes,
//! parses the daemon's self-description XML, and streams interleaved I/Q
//! sample buffers through bounded queues with watermark backpressure.
//!
//! # Example
//!
//! Connect, bootstrap, and read a gain attribute with the legacy-server
//! fallback:
//!
//! ```no_run
//! # fn example() -> color_eyre::Result<()> {
//! use std::time::Duration;
//! use iiod_client::Manager;
//!
//! let mgr = Manager::new("192.168.2.1");
//! mgr.connect(Duration::from_millis(2500))?;
//! mgr.bootstrap(2500, true)?;
//! let gain = mgr.read_attr_compat("ad9361-phy", "voltage0", "hardwaregain")?;
//! println!("gain: {gain}");
//! # Ok(())
//! # }
//! ```
//!
//! Capture one block from an enabled buffer:
//!
//! ```no_run
//! # fn example() -> color_eyre::Result<()> {
//! # use std::time::Duration;
//! # use iiod_client::Manager;
//! # let mgr = Manager::new("192.168.2.1");
//! let buffer = mgr.create_buffer(1, &[0, 1], false)?;
//! mgr.enable_buffer(buffer)?;
//! let block = mgr.create_block(buffer, 65536)?;
//! let mut frame = vec![0u8; 65536];
//! let n = mgr.transfer_block(block, &mut frame)?;
//! let (i, q) = iiod_client::iq::deinterleave_iq(&frame[..n])?;
//! # Ok(())
//! # }
//! ```

pub mod ascii;
pub mod binary;
mod buffer;
mod conn;
pub mod context;
pub mod iq;
pub mod proto;
pub mod scan;
pub mod stream;
pub mod transport;

mod attr;

pub use buffer::{BlockId, BufferId};
pub use conn::Manager;
pub use context::Context;
pub use proto::{DeviceError, Errno, ModeError, Opcode, ProtocolError, ValidationError};
pub use scan::{DecodeMap, ScanFormat};
pub use stream::{start_rx_stream, start_tx_stream, QueueConfig, RxStream, TxStream};
