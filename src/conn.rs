//! The connection manager.
//!
//! One [`Manager`] owns one TCP stream and a per-connection state machine:
//! `Disconnected → Ascii → Binary`, with any fatal I/O or framing error
//! landing in `Broken`, from where only [`Manager::close`] is legal. The
//! mode is never inferred from the wire, only from explicit negotiation, and
//! every outgoing command is gated on it.
//!
//! All wire access is serialized by the connection lock: a command holds it
//! for the full request+response round-trip, so responses match requests 1:1
//! in FIFO order.

use std::collections::{BTreeSet, HashMap};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::{debug, info, warn};
use rand::Rng;

use crate::ascii;
use crate::binary::{self, Reply};
use crate::buffer::BufferState;
use crate::context::Context;
use crate::proto::{DeviceError, ModeError, Opcode, ProtocolError, TCP_PORT};
use crate::transport::{FramedTransport, Wire};

/// The negotiated dialect of a live connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Mode {
    Ascii,
    Binary { client_id: u16 },
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::Ascii => "ASCII",
            Mode::Binary { .. } => "binary",
        }
    }
}

/// Per-connection state behind the connection lock.
pub(crate) struct Session<W: Wire> {
    pub(crate) transport: FramedTransport<W>,
    pub(crate) mode: Mode,
    pub(crate) next_buffer_id: u16,
    pub(crate) buffers: HashMap<u16, BufferState>,
}

impl<W: Wire> Session<W> {
    fn new(transport: FramedTransport<W>) -> Self {
        Session {
            transport,
            mode: Mode::Ascii,
            next_buffer_id: 0,
            buffers: HashMap::new(),
        }
    }

    /// Gate an ASCII helper.
    pub(crate) fn require_ascii(&self) -> Result<()> {
        match self.mode {
            Mode::Ascii => Ok(()),
            Mode::Binary { .. } => bail!(ModeError {
                required: "ASCII",
                current: self.mode.name(),
            }),
        }
    }

    /// Gate a binary helper; yields the client id.
    pub(crate) fn require_binary(&self) -> Result<u16> {
        match self.mode {
            Mode::Binary { client_id } => Ok(client_id),
            Mode::Ascii => bail!(ModeError {
                required: "binary",
                current: self.mode.name(),
            }),
        }
    }

    /// One full binary round-trip under the connection lock.
    pub(crate) fn transact(
        &mut self,
        opcode: Opcode,
        device: u8,
        code: i32,
        payload: &[&[u8]],
    ) -> Result<Option<Reply>> {
        let client_id = self.require_binary()?;
        binary::send_command(&mut self.transport, client_id, opcode, device, code, payload)?;
        binary::read_reply(&mut self.transport, opcode, client_id)
    }

    /// Like [`transact`] but the opcode must have a response and a negative
    /// status becomes a [`DeviceError`].
    ///
    /// [`transact`]: Self::transact
    pub(crate) fn transact_checked(
        &mut self,
        opcode: Opcode,
        device: u8,
        code: i32,
        payload: &[&[u8]],
    ) -> Result<Reply> {
        let reply = self
            .transact(opcode, device, code, payload)?
            .ok_or_else(|| ProtocolError(format!("{opcode:?} has no response to wait for")))?;
        if reply.status < 0 {
            bail!(DeviceError::new(reply.status));
        }
        Ok(reply)
    }
}

enum State<W: Wire> {
    Disconnected,
    Live(Session<W>),
    Broken,
}

/// A connection to one IIOD daemon.
///
/// Cheap to share behind an [`Arc`]; all commands serialize on the internal
/// connection lock.
pub struct Manager<W: Wire = TcpStream> {
    addr: String,
    timeout: Mutex<Duration>,
    state: Mutex<State<W>>,
    xml: RwLock<Option<Arc<Context>>>,
    enabled: Mutex<HashMap<String, BTreeSet<String>>>,
    compat_downgrades: AtomicU64,
}

/// Transport and protocol faults poison the connection; everything else
/// (validation, mode, device status, legacy-XML detection) leaves it usable.
fn is_fatal(err: &color_eyre::Report) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some()
            || cause.downcast_ref::<ProtocolError>().is_some()
    })
}

impl Manager<TcpStream> {
    /// Address can be `host` or `host:port`; the default port is 30431.
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Manager::with_addr(addr.into())
    }

    /// Dial the daemon. The timeout also becomes the per-operation deadline;
    /// zero means no deadline.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        let mut guard = self.lock_state();
        if matches!(*guard, State::Live(_)) {
            bail!(ProtocolError::new("already connected"));
        }
        let addr = if self.addr.contains(':') {
            self.addr.clone()
        } else {
            format!("{}:{}", self.addr, TCP_PORT)
        };
        let stream = dial(&addr, timeout).wrap_err_with(|| format!("connecting to {addr}"))?;
        stream.set_nodelay(true)?;
        *self.timeout.lock().unwrap_or_else(|e| e.into_inner()) = timeout;
        *guard = State::Live(Session::new(FramedTransport::new(stream, timeout)));
        info!(target: "iiod", "connected to {addr}");
        Ok(())
    }
}

fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    if timeout.is_zero() {
        return Ok(TcpStream::connect(addr)?);
    }
    let mut last = None;
    for candidate in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = Some(err),
        }
    }
    match last {
        Some(err) => Err(err.into()),
        None => Err(eyre!("{addr} did not resolve to any address")),
    }
}

impl<W: Wire> Manager<W> {
    fn with_addr(addr: String) -> Self {
        Manager {
            addr,
            timeout: Mutex::new(Duration::ZERO),
            state: Mutex::new(State::Disconnected),
            xml: RwLock::new(None),
            enabled: Mutex::new(HashMap::new()),
            compat_downgrades: AtomicU64::new(0),
        }
    }

    /// Adopt an already-connected stream in ASCII mode. This is how test
    /// harnesses and exotic transports enter; [`Manager::connect`] is the
    /// TCP front door.
    pub fn attach(wire: W, timeout: Duration) -> Self {
        let mgr = Manager::with_addr("<attached>".to_string());
        *mgr.timeout.lock().unwrap_or_else(|e| e.into_inner()) = timeout;
        *mgr.state.lock().unwrap_or_else(|e| e.into_inner()) =
            State::Live(Session::new(FramedTransport::new(wire, timeout)));
        mgr
    }

    fn lock_state(&self) -> MutexGuard<'_, State<W>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one transaction under the connection lock. A fatal error tears
    /// the stream down and leaves the connection `Broken`.
    pub(crate) fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session<W>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock_state();
        let session = match &mut *guard {
            State::Live(session) => session,
            State::Disconnected => bail!("connection is not open"),
            State::Broken => bail!("connection is broken; close it"),
        };
        match f(session) {
            Err(err) if is_fatal(&err) => {
                warn!(target: "iiod", "fatal transaction error, closing: {err:#}");
                session.transport.shutdown();
                *guard = State::Broken;
                Err(err)
            }
            other => other,
        }
    }

    /// Whether the connection is live and upgraded to the binary dialect.
    pub fn is_binary(&self) -> bool {
        matches!(
            &*self.lock_state(),
            State::Live(Session {
                mode: Mode::Binary { .. },
                ..
            })
        )
    }

    /// Whether the connection is live (in either dialect).
    pub fn is_connected(&self) -> bool {
        matches!(&*self.lock_state(), State::Live(_))
    }

    /// Change the per-operation deadline. Zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(|e| e.into_inner()) = timeout;
        if let State::Live(session) = &mut *self.lock_state() {
            session.transport.set_timeout(timeout);
        }
    }

    /// The configured per-operation deadline.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of transparent binary→ASCII attribute downgrades so far.
    pub fn compat_downgrades(&self) -> u64 {
        self.compat_downgrades.load(Ordering::Relaxed)
    }

    pub(crate) fn note_compat_downgrade(&self) {
        self.compat_downgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Send one ASCII command and parse its integer reply. Refused in
    /// binary mode.
    pub fn exec_ascii(&self, cmd: &str) -> Result<i32> {
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::exec(&mut session.transport, cmd)
        })
    }

    /// `VERSION`: the daemon's version line. ASCII dialect only; the reply
    /// is a bare line rather than an integer, so [`exec_ascii`] does not
    /// apply.
    ///
    /// [`exec_ascii`]: Self::exec_ascii
    pub fn server_version(&self) -> Result<String> {
        self.with_session(|session| {
            session.require_ascii()?;
            ascii::send_command(&mut session.transport, "VERSION")?;
            let line = session.transport.read_line(128, false)?;
            Ok(String::from_utf8_lossy(&line).trim().to_string())
        })
    }

    /// Negotiate the binary dialect. Returns false (and stays in ASCII) if
    /// the server declines; true if it accepts or the connection already
    /// upgraded.
    pub fn try_upgrade_to_binary(&self) -> Result<bool> {
        self.with_session(|session| {
            if let Mode::Binary { .. } = session.mode {
                return Ok(true);
            }
            let status = ascii::exec(&mut session.transport, "BINARY")?;
            if status != 0 {
                debug!(target: "iiod", "server declined BINARY with {status}");
                return Ok(false);
            }
            let client_id = rand::thread_rng().gen_range(1..=u16::MAX);
            session.mode = Mode::Binary { client_id };
            info!(target: "iiod", "upgraded to binary dialect, client id {client_id:#06x}");
            Ok(true)
        })
    }

    /// Set the server-side command timeout, in either dialect. The binary
    /// opcode has no response by design.
    pub fn set_server_timeout(&self, millis: u32) -> Result<()> {
        self.with_session(|session| match session.mode {
            Mode::Ascii => {
                ascii::exec_checked(&mut session.transport, &format!("TIMEOUT {millis}"))?;
                Ok(())
            }
            Mode::Binary { .. } => {
                session.transact(Opcode::TIMEOUT, 0, millis as i32, &[])?;
                Ok(())
            }
        })
    }

    /// Fetch the daemon's self-description XML and refresh the cached,
    /// indexed context. The raw bytes are returned verbatim; a structural
    /// parse failure is logged but does not fail the fetch.
    pub fn fetch_xml(&self) -> Result<Vec<u8>> {
        let bytes = self.with_session(|session| match session.mode {
            Mode::Ascii => {
                ascii::send_command(&mut session.transport, "PRINT")?;
                ascii::read_lp_payload(&mut session.transport)
            }
            Mode::Binary { .. } => {
                let reply = session.transact_checked(Opcode::PRINT, 0, 0, &[])?;
                Ok(reply.data)
            }
        })?;
        match Context::parse(&bytes) {
            Ok(ctx) => {
                *self.xml.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(ctx));
            }
            Err(err) => {
                warn!(target: "iiod", "daemon XML did not parse: {err:#}");
            }
        }
        Ok(bytes)
    }

    /// The cached context, fetching it first if necessary.
    pub fn context(&self) -> Result<Arc<Context>> {
        if let Some(ctx) = &*self.xml.read().unwrap_or_else(|e| e.into_inner()) {
            return Ok(Arc::clone(ctx));
        }
        self.fetch_xml()?;
        match &*self.xml.read().unwrap_or_else(|e| e.into_inner()) {
            Some(ctx) => Ok(Arc::clone(ctx)),
            None => bail!(eyre!("daemon XML is not parsable; no context available")),
        }
    }

    /// The standard start-of-session sequence: server timeout, XML fetch,
    /// then the optional upgrade. Returns whether the connection ended up
    /// binary.
    pub fn bootstrap(&self, server_timeout_ms: u32, upgrade: bool) -> Result<bool> {
        self.set_server_timeout(server_timeout_ms)?;
        self.fetch_xml()?;
        if upgrade {
            self.try_upgrade_to_binary()
        } else {
            Ok(false)
        }
    }

    /// Record a channel's client-side enable flag for decode-map
    /// construction. Wire traffic, if any, is the caller's business.
    pub fn mark_channel_enabled(&self, device: &str, channel: &str, enabled: bool) {
        let mut map = self.enabled.lock().unwrap_or_else(|e| e.into_inner());
        let set = map.entry(device.to_string()).or_default();
        if enabled {
            set.insert(channel.to_string());
        } else {
            set.remove(channel);
        }
    }

    /// Build the decode map for a device from the cached context and the
    /// channels currently marked enabled.
    pub fn build_decode_map(&self, device: &str) -> Result<crate::scan::DecodeMap> {
        let ctx = self.context()?;
        let dev = ctx.device(device)?;
        let enabled = self
            .enabled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device)
            .cloned()
            .unwrap_or_default();
        crate::scan::DecodeMap::build(dev, &enabled)
    }

    /// Close the connection. Buffers still registered are FREEd best-effort
    /// first (each one is a server-side leak otherwise) and warned about.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock_state();
        if let State::Live(session) = &mut *guard {
            let leaked: Vec<(u16, u8)> = session
                .buffers
                .iter()
                .map(|(&id, state)| (id, state.device))
                .collect();
            for (id, device) in leaked {
                warn!(target: "iiod", "buffer {id} still open at close, freeing");
                if session.require_binary().is_ok() {
                    let _ = session.transact(Opcode::FREE_BUFFER, device, id as i32, &[]);
                }
                session.buffers.remove(&id);
            }
            session.transport.shutdown();
        }
        *guard = State::Disconnected;
        *self.xml.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

impl<W: Wire> Drop for Manager<W> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testwire::{pair, DuplexWire};
    use std::io::prelude::*;
    use std::thread;

    fn scripted<F>(script: F) -> (Manager<DuplexWire>, thread::JoinHandle<()>)
    where
        F: FnOnce(&mut DuplexWire) + Send + 'static,
    {
        let (client, mut server) = pair();
        let handle = thread::spawn(move || script(&mut server));
        (Manager::attach(client, Duration::ZERO), handle)
    }

    fn read_line_from(server: &mut DuplexWire) -> Vec<u8> {
        let mut line = vec![];
        let mut byte = [0u8; 1];
        loop {
            server.read_exact(&mut byte).unwrap();
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return line;
            }
        }
    }

    #[test]
    fn upgrade_success_assigns_nonzero_client_id() {
        let (mgr, server) = scripted(|server| {
            assert_eq!(read_line_from(server), b"BINARY\r\n");
            server.write_all(b"0\n").unwrap();
        });
        assert!(!mgr.is_binary());
        assert!(mgr.try_upgrade_to_binary().unwrap());
        assert!(mgr.is_binary());
        server.join().unwrap();
    }

    #[test]
    fn upgrade_decline_stays_ascii() {
        let (mgr, server) = scripted(|server| {
            read_line_from(server);
            server.write_all(b"-38\n").unwrap();
            // Still ASCII afterwards.
            assert_eq!(read_line_from(server), b"TIMEOUT 100\r\n");
            server.write_all(b"0\n").unwrap();
        });
        assert!(!mgr.try_upgrade_to_binary().unwrap());
        assert!(!mgr.is_binary());
        assert_eq!(mgr.exec_ascii("TIMEOUT 100").unwrap(), 0);
        server.join().unwrap();
    }

    #[test]
    fn ascii_helper_refused_in_binary_mode() {
        let (mgr, server) = scripted(|server| {
            read_line_from(server);
            server.write_all(b"0\n").unwrap();
        });
        mgr.try_upgrade_to_binary().unwrap();
        let err = mgr.exec_ascii("VERSION").unwrap_err();
        assert!(err.downcast_ref::<ModeError>().is_some());
        // A mode error is recoverable: the connection is still live.
        assert!(mgr.is_connected());
        server.join().unwrap();
    }

    #[test]
    fn binary_helper_refused_in_ascii_mode() {
        let (mgr, server) = scripted(|_server| {});
        let err = mgr
            .with_session(|s| s.transact(Opcode::PRINT, 0, 0, &[]))
            .unwrap_err();
        assert!(err.downcast_ref::<ModeError>().is_some());
        server.join().unwrap();
    }

    #[test]
    fn fetch_xml_in_ascii_mode_caches_the_context() {
        let xml = crate::context::tests::SAMPLE_XML;
        let (mgr, server) = scripted(move |server| {
            assert_eq!(read_line_from(server), b"PRINT\r\n");
            server
                .write_all(format!("{}\n{}\n", xml.len(), xml).as_bytes())
                .unwrap();
        });
        let bytes = mgr.fetch_xml().unwrap();
        assert_eq!(bytes, xml.as_bytes());
        let ctx = mgr.context().unwrap();
        assert_eq!(ctx.no_devices(), 2);
        server.join().unwrap();
    }

    #[test]
    fn unparsable_xml_still_returns_bytes() {
        let (mgr, server) = scripted(|server| {
            // Twice: an empty cache makes context() re-fetch.
            for _ in 0..2 {
                read_line_from(server);
                server.write_all(b"9\nnot xml!!\n").unwrap();
            }
        });
        assert_eq!(mgr.fetch_xml().unwrap(), b"not xml!!");
        assert!(mgr.context().is_err());
        assert!(mgr.is_connected(), "xml parse failure is non-fatal");
        server.join().unwrap();
    }

    #[test]
    fn fatal_io_error_breaks_the_connection() {
        let (mgr, server) = scripted(|server| {
            read_line_from(server);
            // Drop without replying: the client sees EOF mid-transaction.
        });
        assert!(mgr.exec_ascii("VERSION").is_err());
        server.join().unwrap();
        let err = mgr.exec_ascii("VERSION").unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        // Only close is legal from Broken.
        mgr.close().unwrap();
        let err = mgr.exec_ascii("VERSION").unwrap_err();
        assert!(format!("{err:#}").contains("not open"));
    }

    #[test]
    fn device_error_does_not_break_the_connection() {
        let (mgr, server) = scripted(|server| {
            read_line_from(server);
            server.write_all(b"-22\n").unwrap();
            read_line_from(server);
            server.write_all(b"0\n").unwrap();
        });
        let err = mgr
            .with_session(|s| {
                s.require_ascii()?;
                ascii::exec_checked(&mut s.transport, "SETTRIG adc nope")
            })
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeviceError>(),
            Some(&DeviceError::new(-22))
        );
        assert_eq!(mgr.exec_ascii("TIMEOUT 1").unwrap(), 0);
        server.join().unwrap();
    }

    #[test]
    fn version_reads_a_bare_line() {
        let (mgr, server) = scripted(|server| {
            assert_eq!(read_line_from(server), b"VERSION\r\n");
            server.write_all(b"0.25 v0.25-pluto\n").unwrap();
        });
        assert_eq!(mgr.server_version().unwrap(), "0.25 v0.25-pluto");
        server.join().unwrap();
    }

    #[test]
    fn bootstrap_runs_timeout_print_binary() {
        let xml = crate::context::tests::SAMPLE_XML;
        let (mgr, server) = scripted(move |server| {
            assert_eq!(read_line_from(server), b"TIMEOUT 2500\r\n");
            server.write_all(b"0\n").unwrap();
            assert_eq!(read_line_from(server), b"PRINT\r\n");
            server
                .write_all(format!("{}\n{}\n", xml.len(), xml).as_bytes())
                .unwrap();
            assert_eq!(read_line_from(server), b"BINARY\r\n");
            server.write_all(b"0\n").unwrap();
        });
        assert!(mgr.bootstrap(2500, true).unwrap());
        assert!(mgr.is_binary());
        server.join().unwrap();
    }
}
