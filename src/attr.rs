//! Device, channel, buffer, and debug attribute access.
//!
//! Every operation dispatches on the connection mode. The binary dialect
//! addresses devices by index (resolved through the cached context) and
//! carries the target as a length-prefixed string; the ASCII dialect spells
//! the same target out on the command line. The `*_compat` variants try
//! binary first and transparently retry in ASCII when a legacy server
//! answers a binary request with XML.

use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use log::warn;

use crate::ascii;
use crate::conn::{Manager, Mode, Session};
use crate::context::Direction;
use crate::proto::{
    put_lp_string, put_name_value, DeviceError, LegacyXmlReply, Opcode, ProtocolError,
    ValidationError,
};
use crate::transport::{FramedTransport, Wire};

/// Which attribute namespace an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope<'a> {
    Device,
    Debug,
    Buffer,
    Channel { output: bool, id: &'a str },
}

impl<'a> Scope<'a> {
    fn read_opcode(self) -> Opcode {
        match self {
            Scope::Device => Opcode::READ_ATTR,
            Scope::Debug => Opcode::READ_DBG_ATTR,
            Scope::Buffer => Opcode::READ_BUF_ATTR,
            Scope::Channel { .. } => Opcode::READ_CHN_ATTR,
        }
    }

    fn write_opcode(self) -> Opcode {
        match self {
            Scope::Device => Opcode::WRITE_ATTR,
            Scope::Debug => Opcode::WRITE_DBG_ATTR,
            Scope::Buffer => Opcode::WRITE_BUF_ATTR,
            Scope::Channel { .. } => Opcode::WRITE_CHN_ATTR,
        }
    }

    /// The command-line selector between the device and the attribute name.
    fn ascii_selector(self) -> String {
        match self {
            Scope::Device => String::new(),
            Scope::Debug => " DEBUG".to_string(),
            Scope::Buffer => " BUFFER".to_string(),
            Scope::Channel { output: false, id } => format!(" INPUT {id}"),
            Scope::Channel { output: true, id } => format!(" OUTPUT {id}"),
        }
    }

    /// The binary target string; it mirrors the ASCII selector so both
    /// dialects name attributes identically.
    fn binary_target(self, attr: &str) -> String {
        match self {
            Scope::Device | Scope::Debug | Scope::Buffer => attr.to_string(),
            Scope::Channel { output: false, id } => format!("INPUT {id} {attr}"),
            Scope::Channel { output: true, id } => format!("OUTPUT {id} {attr}"),
        }
    }

    fn validate(self, dev: &str, attr: &str) -> Result<()> {
        if dev.is_empty() {
            bail!(ValidationError("empty device name".to_string()));
        }
        if attr.is_empty() {
            bail!(ValidationError("empty attribute name".to_string()));
        }
        if let Scope::Channel { id, .. } = self {
            if id.is_empty() {
                bail!(ValidationError("empty channel name".to_string()));
            }
        }
        Ok(())
    }
}

/// Attribute payloads come back with trailing newline or NUL padding.
fn clean_value(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', '\n', '\r', ' ', '\t'])
        .to_string()
}

fn looks_like_xml_text(value: &str) -> bool {
    let v = value.trim_start();
    v.starts_with("<?xml")
        || v.starts_with("<context")
        || v.starts_with("<device")
        || v.contains("DOCTYPE")
}

/// Drain the remainder of a legacy ASCII reply whose first eight bytes were
/// consumed as a would-be binary header, leaving the stream on a fresh line.
fn realign_after_legacy_xml<W: Wire>(t: &mut FramedTransport<W>, head: &[u8]) -> Result<()> {
    let (line, consumed_payload) = match head.iter().position(|&b| b == b'\n') {
        Some(pos) => (head[..pos].to_vec(), head.len() - pos - 1),
        None => {
            let mut line = head.to_vec();
            line.extend(t.read_line(256, false)?);
            (line, 0)
        }
    };
    let n = ascii::parse_integer_line(&line)?;
    if n < 0 {
        return Ok(());
    }
    // Payload plus its trailing newline, minus what the sniffed header
    // already swallowed.
    let total = n as usize + 1;
    if total < consumed_payload {
        bail!(ProtocolError(
            "legacy reply shorter than the bytes already consumed".to_string()
        ));
    }
    t.drain_bytes(total - consumed_payload)?;
    Ok(())
}

impl<W: Wire> Manager<W> {
    fn cached_context_if_binary(&self) -> Result<Option<std::sync::Arc<crate::context::Context>>> {
        if self.is_binary() {
            Ok(Some(self.context()?))
        } else {
            Ok(None)
        }
    }

    fn read_attr_scoped(&self, dev: &str, scope: Scope, attr: &str) -> Result<String> {
        scope.validate(dev, attr)?;
        let ctx = self.cached_context_if_binary()?;
        self.with_session(|session| match session.mode {
            Mode::Ascii => ascii_read(session, dev, scope, attr),
            Mode::Binary { .. } => {
                let ctx = ctx
                    .as_ref()
                    .ok_or_else(|| eyre!("no context cached for device index lookup"))?;
                let index = ctx.device_index(dev)?;
                let mut payload = Vec::new();
                put_lp_string(&mut payload, &scope.binary_target(attr))?;
                let reply = session.transact_checked(scope.read_opcode(), index, 0, &[&payload])?;
                Ok(clean_value(&reply.data))
            }
        })
    }

    fn write_attr_scoped(&self, dev: &str, scope: Scope, attr: &str, value: &str) -> Result<i32> {
        scope.validate(dev, attr)?;
        let ctx = self.cached_context_if_binary()?;
        self.with_session(|session| match session.mode {
            Mode::Ascii => ascii_write(session, dev, scope, attr, value),
            Mode::Binary { .. } => {
                let ctx = ctx
                    .as_ref()
                    .ok_or_else(|| eyre!("no context cached for device index lookup"))?;
                let index = ctx.device_index(dev)?;
                let mut payload = Vec::new();
                put_name_value(&mut payload, &scope.binary_target(attr), value)?;
                let reply = session.transact_checked(scope.write_opcode(), index, 0, &[&payload])?;
                Ok(reply.status)
            }
        })
    }

    /// Read a device-level attribute.
    pub fn read_device_attr(&self, dev: &str, attr: &str) -> Result<String> {
        self.read_attr_scoped(dev, Scope::Device, attr)
    }

    /// Read a debug attribute.
    pub fn read_debug_attr(&self, dev: &str, attr: &str) -> Result<String> {
        self.read_attr_scoped(dev, Scope::Debug, attr)
    }

    /// Read a buffer attribute.
    pub fn read_buffer_attr(&self, dev: &str, attr: &str) -> Result<String> {
        self.read_attr_scoped(dev, Scope::Buffer, attr)
    }

    /// Read a channel attribute.
    pub fn read_channel_attr(
        &self,
        dev: &str,
        output: bool,
        channel: &str,
        attr: &str,
    ) -> Result<String> {
        self.read_attr_scoped(dev, Scope::Channel { output, id: channel }, attr)
    }

    /// Write a device-level attribute.
    pub fn write_device_attr(&self, dev: &str, attr: &str, value: &str) -> Result<()> {
        self.write_attr_scoped(dev, Scope::Device, attr, value)?;
        Ok(())
    }

    /// Write a debug attribute.
    pub fn write_debug_attr(&self, dev: &str, attr: &str, value: &str) -> Result<()> {
        self.write_attr_scoped(dev, Scope::Debug, attr, value)?;
        Ok(())
    }

    /// Write a buffer attribute.
    pub fn write_buffer_attr(&self, dev: &str, attr: &str, value: &str) -> Result<()> {
        self.write_attr_scoped(dev, Scope::Buffer, attr, value)?;
        Ok(())
    }

    /// Write a channel attribute.
    pub fn write_channel_attr(
        &self,
        dev: &str,
        output: bool,
        channel: &str,
        attr: &str,
        value: &str,
    ) -> Result<()> {
        self.write_attr_scoped(dev, Scope::Channel { output, id: channel }, attr, value)?;
        Ok(())
    }

    fn compat_scope<'a>(&self, dev: &str, channel: &'a str) -> Result<Scope<'a>> {
        if channel.is_empty() {
            return Ok(Scope::Device);
        }
        let ctx = self.context()?;
        let direction = ctx.device(dev)?.channel(channel)?.direction;
        Ok(Scope::Channel {
            output: direction == Direction::Output,
            id: channel,
        })
    }

    /// Read an attribute, trying binary first and falling back to ASCII if
    /// the server turns out to be a legacy one that answers binary requests
    /// with XML. `channel` may be empty for device-level attributes.
    pub fn read_attr_compat(&self, dev: &str, channel: &str, attr: &str) -> Result<String> {
        let scope = self.compat_scope(dev, channel)?;
        if !self.is_binary() {
            return self.read_attr_scoped(dev, scope, attr);
        }
        match self.read_attr_scoped(dev, scope, attr) {
            Ok(value) if looks_like_xml_text(&value) => {
                self.downgrade(dev, attr, "payload");
                self.with_session(|session| ascii_read(session, dev, scope, attr))
            }
            Err(err) => match err.downcast_ref::<LegacyXmlReply>() {
                Some(legacy) => {
                    let head = legacy.head.clone();
                    self.downgrade(dev, attr, "header");
                    self.with_session(|session| {
                        realign_after_legacy_xml(&mut session.transport, &head)?;
                        ascii_read(session, dev, scope, attr)
                    })
                }
                None => Err(err),
            },
            ok => ok,
        }
    }

    /// Write an attribute with the same legacy fallback as
    /// [`read_attr_compat`](Self::read_attr_compat).
    pub fn write_attr_compat(&self, dev: &str, channel: &str, attr: &str, value: &str) -> Result<()> {
        let scope = self.compat_scope(dev, channel)?;
        if !self.is_binary() {
            self.write_attr_scoped(dev, scope, attr, value)?;
            return Ok(());
        }
        match self.write_attr_scoped(dev, scope, attr, value) {
            Err(err) => match err.downcast_ref::<LegacyXmlReply>() {
                Some(legacy) => {
                    let head = legacy.head.clone();
                    self.downgrade(dev, attr, "header");
                    self.with_session(|session| {
                        realign_after_legacy_xml(&mut session.transport, &head)?;
                        ascii_write(session, dev, scope, attr, value)
                    })?;
                    Ok(())
                }
                None => Err(err),
            },
            Ok(_) => Ok(()),
        }
    }

    fn downgrade(&self, dev: &str, attr: &str, what: &str) {
        self.note_compat_downgrade();
        warn!(
            target: "iiod",
            "legacy XML {what} answering a binary attribute request for {dev}/{attr}; retrying in ASCII"
        );
    }

    /// The current trigger of a device, in either dialect.
    pub fn get_trigger(&self, dev: &str) -> Result<String> {
        if dev.is_empty() {
            bail!(ValidationError("empty device name".to_string()));
        }
        let ctx = self.cached_context_if_binary()?;
        self.with_session(|session| match session.mode {
            Mode::Ascii => {
                ascii::send_command(&mut session.transport, &format!("GETTRIG {dev}"))?;
                Ok(clean_value(&ascii::read_lp_payload(&mut session.transport)?))
            }
            Mode::Binary { .. } => {
                let ctx = ctx
                    .as_ref()
                    .ok_or_else(|| eyre!("no context cached for device index lookup"))?;
                let index = ctx.device_index(dev)?;
                let reply = session.transact_checked(Opcode::GET_TRIG, index, 0, &[])?;
                Ok(clean_value(&reply.data))
            }
        })
    }

    /// Set (or with `None` clear) the trigger of a device. The binary name
    /// field travels as a length-prefixed string.
    pub fn set_trigger(&self, dev: &str, trigger: Option<&str>) -> Result<()> {
        if dev.is_empty() {
            bail!(ValidationError("empty device name".to_string()));
        }
        let ctx = self.cached_context_if_binary()?;
        self.with_session(|session| match session.mode {
            Mode::Ascii => {
                let cmd = match trigger {
                    Some(t) => format!("SETTRIG {dev} {t}"),
                    None => format!("SETTRIG {dev}"),
                };
                ascii::exec_checked(&mut session.transport, &cmd)?;
                Ok(())
            }
            Mode::Binary { .. } => {
                let ctx = ctx
                    .as_ref()
                    .ok_or_else(|| eyre!("no context cached for device index lookup"))?;
                let index = ctx.device_index(dev)?;
                let mut payload = Vec::new();
                put_lp_string(&mut payload, trigger.unwrap_or_default())?;
                session.transact_checked(Opcode::SET_TRIG, index, 0, &[&payload])?;
                Ok(())
            }
        })
    }

    fn strict_write(&self, dev: &str, channel: &str, attr: &str, value: &str) -> Result<()> {
        let scope = self.compat_scope(dev, channel)?;
        let status = self.write_attr_scoped(dev, scope, attr, value)?;
        if status != 0 {
            bail!("writing {attr} on {dev} returned status {status}, expected 0");
        }
        Ok(())
    }

    /// Tune a local oscillator: writes the channel's `frequency` attribute.
    pub fn set_lo_frequency(&self, dev: &str, channel: &str, hz: u64) -> Result<()> {
        self.strict_write(dev, channel, "frequency", &hz.to_string())
    }

    /// Set the sampling rate: writes `sampling_frequency`.
    pub fn set_sample_rate(&self, dev: &str, channel: &str, hz: u64) -> Result<()> {
        self.strict_write(dev, channel, "sampling_frequency", &hz.to_string())
    }

    /// Set the hardware gain in dB: writes `hardwaregain`.
    pub fn set_hardware_gain(&self, dev: &str, channel: &str, gain_db: f64) -> Result<()> {
        self.strict_write(dev, channel, "hardwaregain", &format!("{gain_db}"))
    }

    /// Flip a channel's enable attribute and record the client-side flag the
    /// decode map is built from.
    pub fn set_channel_enabled(
        &self,
        dev: &str,
        channel: &str,
        attr: &str,
        enabled: bool,
    ) -> Result<()> {
        if channel.is_empty() {
            bail!(ValidationError("empty channel name".to_string()));
        }
        self.strict_write(dev, channel, attr, if enabled { "1" } else { "0" })?;
        self.mark_channel_enabled(dev, channel, enabled);
        Ok(())
    }
}

fn ascii_read<W: Wire>(
    session: &mut Session<W>,
    dev: &str,
    scope: Scope,
    attr: &str,
) -> Result<String> {
    let cmd = format!("READ {dev}{} {attr}", scope.ascii_selector());
    ascii::send_command(&mut session.transport, &cmd)?;
    let payload = ascii::read_lp_payload(&mut session.transport)?;
    Ok(clean_value(&payload))
}

fn ascii_write<W: Wire>(
    session: &mut Session<W>,
    dev: &str,
    scope: Scope,
    attr: &str,
    value: &str,
) -> Result<i32> {
    let cmd = format!("WRITE {dev}{} {attr} {}", scope.ascii_selector(), value.len());
    ascii::send_command(&mut session.transport, &cmd)?;
    // The value travels raw, without an appended newline.
    session.transport.write_all(value.as_bytes())?;
    let status = ascii::read_integer_reply(&mut session.transport)?;
    if status < 0 {
        bail!(DeviceError::new(status));
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::SAMPLE_XML;
    use crate::transport::testwire::{pair, DuplexWire};
    use std::io::prelude::*;
    use std::thread;
    use std::time::Duration;

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

    fn serve_print(server: &mut DuplexWire) {
        assert_eq!(read_line_from(server), b"PRINT\r\n");
        server
            .write_all(format!("{}\n{}\n", SAMPLE_XML.len(), SAMPLE_XML).as_bytes())
            .unwrap();
    }

    fn serve_binary_upgrade(server: &mut DuplexWire) {
        assert_eq!(read_line_from(server), b"BINARY\r\n");
        server.write_all(b"0\n").unwrap();
    }

    #[test]
    fn ascii_channel_read_spells_out_the_target() {
        let (mgr, server) = scripted(|server| {
            assert_eq!(
                read_line_from(server),
                b"READ ad9361-phy INPUT voltage0 hardwaregain\r\n"
            );
            server.write_all(b"5\n71 dB\n").unwrap();
        });
        let value = mgr
            .read_channel_attr("ad9361-phy", false, "voltage0", "hardwaregain")
            .unwrap();
        assert_eq!(value, "71 dB");
        server.join().unwrap();
    }

    #[test]
    fn ascii_write_sends_raw_value_without_newline() {
        let (mgr, server) = scripted(|server| {
            assert_eq!(
                read_line_from(server),
                b"WRITE ad9361-phy ensm_mode 3\r\n"
            );
            let mut value = [0u8; 3];
            server.read_exact(&mut value).unwrap();
            assert_eq!(&value, b"fdd");
            server.write_all(b"3\n").unwrap();
        });
        mgr.write_device_attr("ad9361-phy", "ensm_mode", "fdd").unwrap();
        server.join().unwrap();
    }

    #[test]
    fn binary_read_resolves_device_index_and_lp_target() {
        let (mgr, server) = scripted(|server| {
            serve_print(server);
            serve_binary_upgrade(server);
            // READ_CHN_ATTR on device index 0 with lp target.
            let mut frame = [0u8; 8 + 4 + 27];
            server.read_exact(&mut frame).unwrap();
            assert_eq!(frame[2..8], [0x06, 0x00, 0, 0, 0, 0]);
            assert_eq!(frame[8..12], [0, 0, 0, 27]);
            assert_eq!(&frame[12..], b"INPUT voltage0 hardwaregain");
            let mut reply = vec![0u8, 0, 0x00, 0x00, 0, 0, 0, 5, 0, 0, 0, 5];
            reply.extend_from_slice(b"5 dB\n");
            server.write_all(&reply).unwrap();
        });
        mgr.fetch_xml().unwrap();
        mgr.try_upgrade_to_binary().unwrap();
        let value = mgr
            .read_channel_attr("ad9361-phy", false, "voltage0", "hardwaregain")
            .unwrap();
        assert_eq!(value, "5 dB");
        server.join().unwrap();
    }

    #[test]
    fn validation_rejects_empty_names_before_wire() {
        let (mgr, server) = scripted(|_server| {});
        for err in [
            mgr.read_device_attr("", "attr").unwrap_err(),
            mgr.read_device_attr("dev", "").unwrap_err(),
            mgr.read_channel_attr("dev", false, "", "attr").unwrap_err(),
        ] {
            assert!(err.downcast_ref::<ValidationError>().is_some());
        }
        server.join().unwrap();
    }

    #[test]
    fn compat_downgrades_on_xml_payload() {
        let (mgr, server) = scripted(|server| {
            serve_print(server);
            serve_binary_upgrade(server);
            // A well-framed binary reply whose payload is XML.
            let body = b"<?xml version=\"1.0\"?><context/>";
            let mut frame = [0u8; 8 + 4 + 27];
            server.read_exact(&mut frame).unwrap();
            let mut reply = vec![0u8, 0, 0x00, 0x00];
            reply.extend_from_slice(&(body.len() as i32).to_be_bytes());
            reply.extend_from_slice(&(body.len() as u32).to_be_bytes());
            reply.extend_from_slice(body);
            server.write_all(&reply).unwrap();
            // The transparent ASCII retry.
            assert_eq!(
                read_line_from(server),
                b"READ ad9361-phy INPUT voltage0 hardwaregain\r\n"
            );
            server.write_all(b"4\n5 dB\n").unwrap();
        });
        mgr.fetch_xml().unwrap();
        mgr.try_upgrade_to_binary().unwrap();
        assert_eq!(mgr.compat_downgrades(), 0);
        let value = mgr
            .read_attr_compat("ad9361-phy", "voltage0", "hardwaregain")
            .unwrap();
        assert_eq!(value, "5 dB");
        assert_eq!(mgr.compat_downgrades(), 1);
        assert!(mgr.is_binary(), "mode is unchanged by the per-call fallback");
        server.join().unwrap();
    }

    #[test]
    fn compat_realigns_after_raw_xml_reply() {
        let (mgr, server) = scripted(|server| {
            serve_print(server);
            serve_binary_upgrade(server);
            let mut frame = [0u8; 8 + 4 + 27];
            server.read_exact(&mut frame).unwrap();
            // The legacy server answers in ASCII: length line, XML, newline.
            let xml = b"<?xml version=\"1.0\" encoding=\"utf-8\"?>";
            server
                .write_all(format!("{}\n", xml.len()).as_bytes())
                .unwrap();
            server.write_all(xml).unwrap();
            server.write_all(b"\n").unwrap();
            // The retry must find the stream aligned.
            assert_eq!(
                read_line_from(server),
                b"READ ad9361-phy INPUT voltage0 hardwaregain\r\n"
            );
            server.write_all(b"4\n5 dB\n").unwrap();
        });
        mgr.fetch_xml().unwrap();
        mgr.try_upgrade_to_binary().unwrap();
        let value = mgr
            .read_attr_compat("ad9361-phy", "voltage0", "hardwaregain")
            .unwrap();
        assert_eq!(value, "5 dB");
        assert_eq!(mgr.compat_downgrades(), 1);
        server.join().unwrap();
    }

    #[test]
    fn trigger_roundtrip_in_ascii() {
        let (mgr, server) = scripted(|server| {
            assert_eq!(read_line_from(server), b"GETTRIG cf-ad9361-lpc\r\n");
            server.write_all(b"8\ntrigger0\n").unwrap();
            assert_eq!(read_line_from(server), b"SETTRIG cf-ad9361-lpc trigger1\r\n");
            server.write_all(b"0\n").unwrap();
            assert_eq!(read_line_from(server), b"SETTRIG cf-ad9361-lpc\r\n");
            server.write_all(b"0\n").unwrap();
        });
        assert_eq!(mgr.get_trigger("cf-ad9361-lpc").unwrap(), "trigger0");
        mgr.set_trigger("cf-ad9361-lpc", Some("trigger1")).unwrap();
        mgr.set_trigger("cf-ad9361-lpc", None).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn convenience_setters_write_the_expected_attrs() {
        let (mgr, server) = scripted(|server| {
            serve_print(server);
            assert_eq!(
                read_line_from(server),
                b"WRITE ad9361-phy OUTPUT altvoltage0 frequency 10\r\n"
            );
            let mut value = [0u8; 10];
            server.read_exact(&mut value).unwrap();
            assert_eq!(&value, b"2400000000");
            server.write_all(b"0\n").unwrap();
            assert_eq!(
                read_line_from(server),
                b"WRITE cf-ad9361-lpc INPUT voltage0 en 1\r\n"
            );
            let mut value = [0u8; 1];
            server.read_exact(&mut value).unwrap();
            assert_eq!(&value, b"1");
            server.write_all(b"0\n").unwrap();
        });
        // Context is needed to resolve channel directions.
        mgr.fetch_xml().unwrap();
        mgr.set_lo_frequency("ad9361-phy", "altvoltage0", 2_400_000_000)
            .unwrap();
        mgr.set_channel_enabled("cf-ad9361-lpc", "voltage0", "en", true)
            .unwrap();
        let map = mgr.build_decode_map("cf-ad9361-lpc").unwrap();
        assert_eq!(map.sample_size, 2);
        server.join().unwrap();
    }

    #[test]
    fn convenience_setters_reject_nonzero_status() {
        let (mgr, server) = scripted(|server| {
            serve_print(server);
            assert_eq!(
                read_line_from(server),
                b"WRITE ad9361-phy INPUT voltage0 hardwaregain 2\r\n"
            );
            let mut value = [0u8; 2];
            server.read_exact(&mut value).unwrap();
            server.write_all(b"2\n").unwrap();
        });
        mgr.fetch_xml().unwrap();
        let err = mgr
            .set_hardware_gain("ad9361-phy", "voltage0", 71.0)
            .unwrap_err();
        assert!(format!("{err:#}").contains("status 2"), "{err:#}");
        server.join().unwrap();
    }
}
