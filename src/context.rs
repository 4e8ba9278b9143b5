//! The daemon's self-description XML, parsed into an indexed catalog.
//!
//! The document is retrieved with `PRINT` (ASCII) or opcode 0x01 (binary)
//! and describes every device, channel, and attribute the daemon exposes.
//! The index is rebuilt whenever the XML is re-fetched; name collisions keep
//! the first occurrence.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use color_eyre::eyre::bail;
use color_eyre::Result;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// A catalog lookup that found nothing.
#[derive(Debug, Clone)]
pub struct NotFound(pub String);

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "not found: {}", self.0)
    }
}

impl Error for NotFound {}

/// A structural problem in the daemon's XML.
#[derive(Debug, Clone)]
pub struct XmlError(pub String);

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed context xml: {}", self.0)
    }
}

impl Error for XmlError {}

/// Channel direction as declared by the `type` attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// A capture (ADC-side) channel.
    Input,
    /// An output (DAC-side) channel.
    Output,
}

/// How one channel's samples are packed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanElement {
    /// Position of this channel within a multi-channel sample.
    pub index: u32,
    /// Format string, e.g. `le:S12/16>>0`.
    pub format: String,
}

/// A named attribute, with the sysfs filename when the daemon reports one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    /// Attribute name.
    pub name: String,
    /// Backing filename, channel attributes only.
    pub filename: Option<String>,
}

/// One channel of a device.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel id, e.g. `voltage0`.
    pub id: String,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Input or output.
    pub direction: Direction,
    /// Channel attributes.
    pub attrs: Vec<Attr>,
    /// Wire packing, present on scannable channels.
    pub scan_element: Option<ScanElement>,
}

/// One device of the context.
#[derive(Debug, Clone)]
pub struct Device {
    /// Device id, e.g. `iio:device0`.
    pub id: String,
    /// Device name, e.g. `ad9361-phy`.
    pub name: String,
    /// Optional label.
    pub label: Option<String>,
    /// Channels in document order.
    pub channels: Vec<Channel>,
    /// Device-level attributes.
    pub attrs: Vec<Attr>,
    /// Debug attributes.
    pub debug_attrs: Vec<String>,
    /// Buffer attributes.
    pub buffer_attrs: Vec<String>,
    channel_by_id: HashMap<String, usize>,
}

impl Device {
    /// Look a channel up by id.
    pub fn channel(&self, id: &str) -> Result<&Channel> {
        match self.channel_by_id.get(id) {
            Some(&i) => Ok(&self.channels[i]),
            None => bail!(NotFound(format!("channel {id} on device {}", self.name))),
        }
    }
}

/// The parsed context plus its derived index.
#[derive(Debug, Clone)]
pub struct Context {
    /// Context name, typically `network`.
    pub name: String,
    /// Major protocol version.
    pub version_major: u32,
    /// Minor protocol version.
    pub version_minor: u32,
    /// Version control tag of the daemon build.
    pub version_git: String,
    /// Free-form description.
    pub description: String,
    /// Context attributes as (name, value) pairs.
    pub attrs: Vec<(String, String)>,
    /// Devices in document order; the position is the binary device index.
    pub devices: Vec<Device>,
    device_by_name: HashMap<String, usize>,
    device_by_id: HashMap<String, usize>,
}

fn attr_map(reader: &Reader<&[u8]>, e: &BytesStart) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmlError(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key).into_owned();
        let value = attr
            .unescape_and_decode_value(reader)
            .map_err(|e| XmlError(format!("bad attribute value: {e}")))?;
        out.insert(key, value);
    }
    Ok(out)
}

fn required(attrs: &HashMap<String, String>, key: &str, element: &str) -> Result<String> {
    match attrs.get(key) {
        Some(v) => Ok(v.clone()),
        None => bail!(XmlError(format!("<{element}> is missing `{key}`"))),
    }
}

fn parse_u32(attrs: &HashMap<String, String>, key: &str) -> u32 {
    attrs
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

impl Context {
    /// Parse the daemon's XML and build the index.
    pub fn parse(xml: &[u8]) -> Result<Context> {
        let mut reader = Reader::from_reader(xml);
        reader.trim_text(true);
        let mut buf = Vec::new();

        let mut ctx: Option<Context> = None;
        let mut device: Option<Device> = None;
        let mut channel: Option<Channel> = None;

        loop {
            let event = reader
                .read_event(&mut buf)
                .map_err(|e| XmlError(format!("{e}")))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let empty = matches!(event, Event::Empty(_));
                    let attrs = attr_map(&reader, e)?;
                    match e.name() {
                        b"context" => {
                            ctx = Some(Context {
                                name: attrs.get("name").cloned().unwrap_or_default(),
                                version_major: parse_u32(&attrs, "version-major"),
                                version_minor: parse_u32(&attrs, "version-minor"),
                                version_git: attrs.get("version-git").cloned().unwrap_or_default(),
                                description: attrs
                                    .get("description")
                                    .cloned()
                                    .unwrap_or_default(),
                                attrs: vec![],
                                devices: vec![],
                                device_by_name: HashMap::new(),
                                device_by_id: HashMap::new(),
                            });
                        }
                        b"context-attribute" => {
                            if let Some(ctx) = ctx.as_mut() {
                                ctx.attrs.push((
                                    required(&attrs, "name", "context-attribute")?,
                                    attrs.get("value").cloned().unwrap_or_default(),
                                ));
                            }
                        }
                        b"device" => {
                            let dev = Device {
                                id: required(&attrs, "id", "device")?,
                                name: attrs.get("name").cloned().unwrap_or_default(),
                                label: attrs.get("label").cloned(),
                                channels: vec![],
                                attrs: vec![],
                                debug_attrs: vec![],
                                buffer_attrs: vec![],
                                channel_by_id: HashMap::new(),
                            };
                            if empty {
                                push_device(ctx.as_mut(), dev)?;
                            } else {
                                device = Some(dev);
                            }
                        }
                        b"channel" => {
                            let direction = match attrs.get("type").map(String::as_str) {
                                Some("input") => Direction::Input,
                                Some("output") => Direction::Output,
                                other => bail!(XmlError(format!(
                                    "channel type {other:?} is not input or output"
                                ))),
                            };
                            let chan = Channel {
                                id: required(&attrs, "id", "channel")?,
                                name: attrs.get("name").cloned(),
                                direction,
                                attrs: vec![],
                                scan_element: None,
                            };
                            if empty {
                                if let Some(dev) = device.as_mut() {
                                    push_channel(dev, chan);
                                }
                            } else {
                                channel = Some(chan);
                            }
                        }
                        b"attribute" => {
                            let attr = Attr {
                                name: required(&attrs, "name", "attribute")?,
                                filename: attrs.get("filename").cloned(),
                            };
                            if let Some(chan) = channel.as_mut() {
                                chan.attrs.push(attr);
                            } else if let Some(dev) = device.as_mut() {
                                dev.attrs.push(attr);
                            }
                        }
                        b"debug-attribute" => {
                            if let Some(dev) = device.as_mut() {
                                dev.debug_attrs
                                    .push(required(&attrs, "name", "debug-attribute")?);
                            }
                        }
                        b"buffer-attribute" => {
                            if let Some(dev) = device.as_mut() {
                                dev.buffer_attrs
                                    .push(required(&attrs, "name", "buffer-attribute")?);
                            }
                        }
                        b"scan-element" => {
                            if let Some(chan) = channel.as_mut() {
                                let index: u32 = required(&attrs, "index", "scan-element")?
                                    .parse()
                                    .map_err(|_| {
                                        XmlError("scan-element index is not a number".into())
                                    })?;
                                chan.scan_element = Some(ScanElement {
                                    index,
                                    format: required(&attrs, "format", "scan-element")?,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(ref e) => match e.name() {
                    b"channel" => {
                        if let (Some(dev), Some(chan)) = (device.as_mut(), channel.take()) {
                            push_channel(dev, chan);
                        }
                    }
                    b"device" => {
                        if let Some(dev) = device.take() {
                            push_device(ctx.as_mut(), dev)?;
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        match ctx {
            Some(ctx) => Ok(ctx),
            None => bail!(XmlError("no <context> element".to_string())),
        }
    }

    /// Number of devices.
    pub fn no_devices(&self) -> usize {
        self.devices.len()
    }

    /// Number of channels across all devices.
    pub fn no_channels(&self) -> usize {
        self.devices.iter().map(|d| d.channels.len()).sum()
    }

    /// Look a device up by name.
    pub fn device_by_name(&self, name: &str) -> Result<&Device> {
        match self.device_by_name.get(name) {
            Some(&i) => Ok(&self.devices[i]),
            None => bail!(NotFound(format!("device named {name}"))),
        }
    }

    /// Look a device up by id.
    pub fn device_by_id(&self, id: &str) -> Result<&Device> {
        match self.device_by_id.get(id) {
            Some(&i) => Ok(&self.devices[i]),
            None => bail!(NotFound(format!("device id {id}"))),
        }
    }

    fn device_pos(&self, key: &str) -> Result<usize> {
        if let Some(&i) = self.device_by_name.get(key) {
            return Ok(i);
        }
        if let Some(&i) = self.device_by_id.get(key) {
            return Ok(i);
        }
        bail!(NotFound(format!("device {key}")))
    }

    /// Look a device up by name, falling back to id.
    pub fn device(&self, key: &str) -> Result<&Device> {
        Ok(&self.devices[self.device_pos(key)?])
    }

    /// The binary-dialect device index of a device (its position in the
    /// context).
    pub fn device_index(&self, key: &str) -> Result<u8> {
        Ok(self.device_pos(key)? as u8)
    }

    /// The backing filename of an attribute; `chan` is the channel id or ""
    /// for device-level attributes.
    pub fn attribute_filename(&self, dev: &str, chan: &str, attr: &str) -> Result<Option<&str>> {
        let dev = self.device(dev)?;
        let attrs = if chan.is_empty() {
            &dev.attrs
        } else {
            &dev.channel(chan)?.attrs
        };
        match attrs.iter().find(|a| a.name == attr) {
            Some(a) => Ok(a.filename.as_deref()),
            None => bail!(NotFound(format!("attribute {attr} on {}/{chan}", dev.name))),
        }
    }
}

fn push_channel(dev: &mut Device, chan: Channel) {
    let idx = dev.channels.len();
    dev.channel_by_id.entry(chan.id.clone()).or_insert(idx);
    dev.channels.push(chan);
}

fn push_device(ctx: Option<&mut Context>, dev: Device) -> Result<()> {
    let ctx = match ctx {
        Some(ctx) => ctx,
        None => bail!(XmlError("<device> outside <context>".to_string())),
    };
    let idx = ctx.devices.len();
    if !dev.name.is_empty() {
        ctx.device_by_name.entry(dev.name.clone()).or_insert(idx);
    }
    ctx.device_by_id.entry(dev.id.clone()).or_insert(idx);
    ctx.devices.push(dev);
    Ok(())
}
