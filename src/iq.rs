//! Interleaved I/Q sample helpers.
//!
//! The AD9361-style capture cores deliver 16-bit little-endian interleaved
//! I/Q pairs. These helpers convert between raw buffers, split float
//! vectors normalized to `[-1, 1]`, and complex samples.

use byteorder::{ByteOrder, LittleEndian};
use color_eyre::eyre::bail;
use color_eyre::Result;
use num_complex::Complex32;

use crate::proto::ValidationError;

const SCALE_16: f32 = 32768.0;

/// Parse a little-endian byte buffer into `i16` samples.
pub fn parse_int16_samples(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        bail!(ValidationError(format!(
            "{} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);
    Ok(samples)
}

/// Serialize `i16` samples little-endian. The inverse of
/// [`parse_int16_samples`].
pub fn format_int16_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Split an interleaved 16-bit I/Q buffer into normalized I and Q vectors.
pub fn deinterleave_iq(bytes: &[u8]) -> Result<(Vec<f32>, Vec<f32>)> {
    if bytes.len() % 4 != 0 {
        bail!(ValidationError(format!(
            "{} bytes is not a whole number of I/Q pairs",
            bytes.len()
        )));
    }
    let samples = parse_int16_samples(bytes)?;
    let mut i = Vec::with_capacity(samples.len() / 2);
    let mut q = Vec::with_capacity(samples.len() / 2);
    for pair in samples.chunks_exact(2) {
        i.push(pair[0] as f32 / SCALE_16);
        q.push(pair[1] as f32 / SCALE_16);
    }
    Ok((i, q))
}

fn quantize_16(v: f32) -> i16 {
    let scaled = (v.clamp(-1.0, 1.0) * SCALE_16) as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Interleave normalized I and Q vectors back into a 16-bit buffer, with
/// symmetric clamping to `[-1, 1]`. The inverse of [`deinterleave_iq`].
pub fn interleave_iq(i: &[f32], q: &[f32]) -> Result<Vec<u8>> {
    if i.len() != q.len() {
        bail!(ValidationError(format!(
            "I and Q lengths differ ({} vs {})",
            i.len(),
            q.len()
        )));
    }
    let mut samples = Vec::with_capacity(i.len() * 2);
    for (&iv, &qv) in i.iter().zip(q) {
        samples.push(quantize_16(iv));
        samples.push(quantize_16(qv));
    }
    Ok(format_int16_samples(&samples))
}

/// Split an interleaved buffer into complex samples. `sample_bytes` selects
/// the integer width per component: 1, 2, or 4.
pub fn deinterleave_iq_complex(bytes: &[u8], sample_bytes: usize) -> Result<Vec<Complex32>> {
    let pair = sample_bytes * 2;
    if pair == 0 || bytes.len() % pair != 0 {
        bail!(ValidationError(format!(
            "{} bytes is not a whole number of {sample_bytes}-byte I/Q pairs",
            bytes.len()
        )));
    }
    let scale = (1u64 << (sample_bytes * 8 - 1)) as f32;
    let mut out = Vec::with_capacity(bytes.len() / pair);
    for chunk in bytes.chunks_exact(pair) {
        let (i, q) = match sample_bytes {
            1 => (chunk[0] as i8 as f32, chunk[1] as i8 as f32),
            2 => (
                LittleEndian::read_i16(&chunk[..2]) as f32,
                LittleEndian::read_i16(&chunk[2..]) as f32,
            ),
            4 => (
                LittleEndian::read_i32(&chunk[..4]) as f32,
                LittleEndian::read_i32(&chunk[4..]) as f32,
            ),
            other => bail!(ValidationError(format!(
                "unsupported sample width {other}"
            ))),
        };
        out.push(Complex32::new(i / scale, q / scale));
    }
    Ok(out)
}

/// Interleave complex samples into a 16-bit little-endian buffer. The
/// inverse of [`deinterleave_iq_complex`] for `sample_bytes = 2`.
pub fn interleave_iq_complex(samples: &[Complex32]) -> Vec<u8> {
    let mut flat = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        flat.push(quantize_16(s.re));
        flat.push(quantize_16(s.im));
    }
    format_int16_samples(&flat)
}
