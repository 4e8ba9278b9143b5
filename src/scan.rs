//! Scan-format parsing and the per-buffer decode map.
//!
//! Each scannable channel advertises a format string like `le:S12/16>>0`:
//! endianness, signedness, significant bits, storage bits, right shift, and
//! an optional `X<repeat>` element count. The decode map orders the enabled
//! channels by scan-element index (XML order is not wire order) and drives
//! sample extraction from raw transfer blocks.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use color_eyre::eyre::bail;
use color_eyre::Result;
use regex::Regex;

use crate::context::Device;
use crate::proto::{ProtocolError, ValidationError};

/// A parsed scan-element format string.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFormat {
    /// Big-endian storage on the wire.
    pub is_be: bool,
    /// Two's-complement sign extension applies.
    pub is_signed: bool,
    /// Significant bits per value.
    pub bits: u32,
    /// Right shift applied before masking.
    pub shift: u32,
    /// Storage bits per value.
    pub length: u32,
    /// Values per element.
    pub repeat: u32,
    /// Whether a scale factor applies. No daemon format string carries one;
    /// callers may still set it by hand.
    pub with_scale: bool,
    /// Scale factor, multiplied in with truncation toward zero.
    pub scale: f64,
}

fn format_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(be|le):([SsUu])(\d+)/(\d+)>>(\d+)(?:X(\d+))?$").expect("static regex")
    })
}

impl ScanFormat {
    /// Parse a daemon format string.
    pub fn parse(format: &str) -> Result<ScanFormat> {
        let caps = format_re()
            .captures(format)
            .ok_or_else(|| ValidationError(format!("unrecognized scan format {format:?}")))?;
        let bits: u32 = caps[3].parse()?;
        let length: u32 = caps[4].parse()?;
        let shift: u32 = caps[5].parse()?;
        let repeat: u32 = match caps.get(6) {
            Some(m) => m.as_str().parse()?,
            None => 1,
        };
        if bits == 0 || length == 0 || repeat == 0 {
            bail!(ValidationError(format!(
                "scan format {format:?} has a zero field"
            )));
        }
        if length > 64 || bits > length || shift >= length {
            bail!(ValidationError(format!(
                "scan format {format:?} does not fit a 64-bit value"
            )));
        }
        Ok(ScanFormat {
            is_be: &caps[1] == "be",
            is_signed: caps[2].eq_ignore_ascii_case("s"),
            bits,
            shift,
            length,
            repeat,
            with_scale: false,
            scale: 1.0,
        })
    }

    /// Storage bytes per value.
    pub fn element_bytes(&self) -> usize {
        (self.length as usize + 7) / 8
    }

    /// Storage bytes per element (`element_bytes × repeat`).
    pub fn total_bytes(&self) -> usize {
        self.element_bytes() * self.repeat as usize
    }

    fn load_unsigned(&self, raw: &[u8]) -> u64 {
        match raw.len() {
            1 => raw[0] as u64,
            2 if self.is_be => BigEndian::read_u16(raw) as u64,
            2 => LittleEndian::read_u16(raw) as u64,
            4 if self.is_be => BigEndian::read_u32(raw) as u64,
            4 => LittleEndian::read_u32(raw) as u64,
            8 if self.is_be => BigEndian::read_u64(raw),
            8 => LittleEndian::read_u64(raw),
            n if self.is_be => BigEndian::read_uint(raw, n),
            n => LittleEndian::read_uint(raw, n),
        }
    }

    fn store_unsigned(&self, value: u64, out: &mut [u8]) {
        match out.len() {
            1 => out[0] = value as u8,
            2 if self.is_be => BigEndian::write_u16(out, value as u16),
            2 => LittleEndian::write_u16(out, value as u16),
            4 if self.is_be => BigEndian::write_u32(out, value as u32),
            4 => LittleEndian::write_u32(out, value as u32),
            8 if self.is_be => BigEndian::write_u64(out, value),
            8 => LittleEndian::write_u64(out, value),
            n if self.is_be => BigEndian::write_uint(out, value, n),
            n => LittleEndian::write_uint(out, value, n),
        }
    }

    fn mask(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    /// Extract one value from one stored element of [`element_bytes`] bytes.
    ///
    /// [`element_bytes`]: Self::element_bytes
    pub fn extract(&self, raw: &[u8]) -> i64 {
        let mut u = self.load_unsigned(raw);
        u >>= self.shift;
        u &= self.mask();
        let mut value = if self.is_signed && self.bits < 64 && (u >> (self.bits - 1)) & 1 == 1 {
            (u | !self.mask()) as i64
        } else {
            u as i64
        };
        if self.with_scale {
            value = (value as f64 * self.scale).trunc() as i64;
        }
        value
    }

    /// Pack one in-range value into [`element_bytes`] bytes. The inverse of
    /// [`extract`] for values that fit `bits`.
    ///
    /// [`element_bytes`]: Self::element_bytes
    /// [`extract`]: Self::extract
    pub fn encode(&self, value: i64) -> Vec<u8> {
        let u = (value as u64 & self.mask()) << self.shift;
        let mut out = vec![0u8; self.element_bytes()];
        self.store_unsigned(u, &mut out);
        out
    }
}

/// One enabled channel's slot within a multi-channel sample.
#[derive(Debug, Clone)]
pub struct DecodeEntry {
    /// Channel name, falling back to the channel id.
    pub label: String,
    /// Channel id.
    pub channel_id: String,
    /// Parsed format.
    pub format: ScanFormat,
    /// Byte offset within a sample.
    pub offset: usize,
    /// Storage bits per value, as declared.
    pub length: u32,
    /// Bytes this entry occupies per sample.
    pub total_size: usize,
}

/// The derived extraction table for one buffer's enabled channel set.
#[derive(Debug, Clone)]
pub struct DecodeMap {
    /// Entries ordered by scan-element index.
    pub entries: Vec<DecodeEntry>,
    /// Total bytes per multi-channel sample.
    pub sample_size: usize,
}

impl DecodeMap {
    /// Build the map for `device`, taking the channels whose ids appear in
    /// `enabled` and that carry a scan element, ordered by scan-element
    /// index.
    pub fn build(device: &Device, enabled: &BTreeSet<String>) -> Result<DecodeMap> {
        let mut scannable: Vec<_> = device
            .channels
            .iter()
            .filter(|c| enabled.contains(&c.id))
            .filter_map(|c| c.scan_element.as_ref().map(|se| (c, se)))
            .collect();
        if scannable.is_empty() {
            bail!(ValidationError(format!(
                "device {} has no enabled scannable channels",
                device.name
            )));
        }
        scannable.sort_by_key(|(_, se)| se.index);

        let mut entries = Vec::with_capacity(scannable.len());
        let mut offset = 0usize;
        for (chan, se) in scannable {
            let format = ScanFormat::parse(&se.format)?;
            let total_size = format.total_bytes();
            entries.push(DecodeEntry {
                label: chan.name.clone().unwrap_or_else(|| chan.id.clone()),
                channel_id: chan.id.clone(),
                length: format.length,
                format,
                offset,
                total_size,
            });
            offset += total_size;
        }
        Ok(DecodeMap {
            entries,
            sample_size: offset,
        })
    }

    /// Decode a frame holding a whole number of samples. Each sample becomes
    /// a map from channel label to its `repeat` extracted values.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<HashMap<String, Vec<i64>>>> {
        if frame.len() % self.sample_size != 0 {
            bail!(ProtocolError(format!(
                "frame of {} bytes is not a whole number of {}-byte samples",
                frame.len(),
                self.sample_size
            )));
        }
        let mut samples = Vec::with_capacity(frame.len() / self.sample_size);
        for sample in frame.chunks_exact(self.sample_size) {
            let mut values = HashMap::with_capacity(self.entries.len());
            for entry in &self.entries {
                let raw = &sample[entry.offset..entry.offset + entry.total_size];
                let per = entry.format.element_bytes();
                let extracted = raw
                    .chunks_exact(per)
                    .map(|chunk| entry.format.extract(chunk))
                    .collect();
                values.insert(entry.label.clone(), extracted);
            }
            samples.push(values);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::SAMPLE_XML;
    use crate::context::Context;
    use rand::prelude::*;

    #[test]
    fn parses_the_common_formats() {
        let pf = ScanFormat::parse("le:S12/16>>0").unwrap();
        assert!(!pf.is_be);
        assert!(pf.is_signed);
        assert_eq!((pf.bits, pf.length, pf.shift, pf.repeat), (12, 16, 0, 1));
        assert!(!pf.with_scale);

        let pf = ScanFormat::parse("be:u10/16>>6X4").unwrap();
        assert!(pf.is_be);
        assert!(!pf.is_signed);
        assert_eq!((pf.bits, pf.length, pf.shift, pf.repeat), (10, 16, 6, 4));

        let pf = ScanFormat::parse("le:s24/32>>8").unwrap();
        assert_eq!(pf.element_bytes(), 4);
    }

    #[test]
    fn rejects_malformed_formats() {
        for bad in [
            "",
            "le:S12/16",
            "me:S12/16>>0",
            "le:X12/16>>0",
            "le:S12/8>>0",
            "le:S0/16>>0",
            "le:S12/16>>16",
            "le:S12/16>>0X0",
            "le:S12/128>>0",
        ] {
            assert!(ScanFormat::parse(bad).is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn extraction_sign_extends() {
        let pf = ScanFormat::parse("le:S12/16>>0").unwrap();
        assert_eq!(pf.extract(&pf.encode(-2048)), -2048);
        assert_eq!(pf.extract(&pf.encode(-1)), -1);
        assert_eq!(pf.extract(&pf.encode(2047)), 2047);
        // 0x0FFF is -1 in 12-bit two's complement.
        assert_eq!(pf.extract(&[0xFF, 0x0F]), -1);

        let pf = ScanFormat::parse("be:U4/8>>4").unwrap();
        assert_eq!(pf.extract(&[0xA5]), 0xA);
    }

    #[test]
    fn extract_encode_roundtrip_property() {
        let mut rng = rand::thread_rng();
        for _ in 0..300 {
            let bits = rng.gen_range(1..=32u32);
            let length = *[8u32, 16, 24, 32, 40, 64]
                .iter()
                .filter(|&&l| l >= bits)
                .choose(&mut rng)
                .unwrap();
            let shift = rng.gen_range(0..=(length - bits).min(length - 1));
            let signed = rng.gen_bool(0.5);
            let pf = ScanFormat {
                is_be: rng.gen_bool(0.5),
                is_signed: signed,
                bits,
                shift,
                length,
                repeat: 1,
                with_scale: false,
                scale: 1.0,
            };
            let value: i64 = if signed {
                let span = 1i64 << (bits - 1);
                rng.gen_range(-span..span)
            } else {
                rng.gen_range(0..(1i64 << bits))
            };
            assert_eq!(
                pf.extract(&pf.encode(value)),
                value,
                "bits={bits} length={length} shift={shift} signed={signed} value={value}"
            );
        }
    }

    #[test]
    fn decode_map_for_two_channel_iq() {
        let ctx = Context::parse(SAMPLE_XML.as_bytes()).unwrap();
        let dev = ctx.device_by_name("cf-ad9361-lpc").unwrap();
        let enabled: BTreeSet<String> = ["voltage0", "voltage1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = DecodeMap::build(dev, &enabled).unwrap();
        assert_eq!(map.sample_size, 4);
        assert_eq!(map.entries.len(), 2);
        assert_eq!(map.entries[0].offset, 0);
        assert_eq!(map.entries[1].offset, 2);
        assert_eq!(map.entries[0].length, 12);
        assert_eq!(map.entries[0].total_size, 2);

        // Four samples: (1, -1), (100, -100), (2047, -2048), (0, 0).
        let mut frame = Vec::new();
        for (i, q) in [(1i64, -1i64), (100, -100), (2047, -2048), (0, 0)] {
            frame.extend(map.entries[0].format.encode(i));
            frame.extend(map.entries[1].format.encode(q));
        }
        let samples = map.decode(&frame).unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[1]["voltage0"], vec![100]);
        assert_eq!(samples[1]["voltage1"], vec![-100]);
        assert_eq!(samples[2]["voltage0"], vec![2047]);
        assert_eq!(samples[2]["voltage1"], vec![-2048]);
    }

    #[test]
    fn decode_map_skips_disabled_channels() {
        let ctx = Context::parse(SAMPLE_XML.as_bytes()).unwrap();
        let dev = ctx.device_by_name("cf-ad9361-lpc").unwrap();
        let enabled: BTreeSet<String> = std::iter::once("voltage1".to_string()).collect();
        let map = DecodeMap::build(dev, &enabled).unwrap();
        assert_eq!(map.sample_size, 2);
        assert_eq!(map.entries[0].channel_id, "voltage1");
    }

    #[test]
    fn decode_rejects_ragged_frames() {
        let ctx = Context::parse(SAMPLE_XML.as_bytes()).unwrap();
        let dev = ctx.device_by_name("cf-ad9361-lpc").unwrap();
        let enabled: BTreeSet<String> = std::iter::once("voltage0".to_string()).collect();
        let map = DecodeMap::build(dev, &enabled).unwrap();
        assert!(map.decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn repeat_yields_multiple_values_per_sample() {
        let pf = ScanFormat::parse("le:S8/8>>0X3").unwrap();
        assert_eq!(pf.total_bytes(), 3);
        let map = DecodeMap {
            entries: vec![DecodeEntry {
                label: "burst".into(),
                channel_id: "burst".into(),
                length: 8,
                format: pf,
                offset: 0,
                total_size: 3,
            }],
            sample_size: 3,
        };
        let samples = map.decode(&[1, 0xFF, 3]).unwrap();
        assert_eq!(samples[0]["burst"], vec![1, -1, 3]);
    }
}
