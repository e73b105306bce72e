//! Control-frame codec for the setup, run, gather and close conversations.
//!
//! Frames are flat little-endian buffers: a one-byte kind discriminant
//! followed by fixed fields and, where needed, a length-prefixed body.
//! Signal payloads on pair tags are raw f64 vectors with no header; their
//! length is agreed at build time by both ends of the pair.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::Result;

/// Discriminant of a control frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Coordinator → worker: global timestep + serialized chunk description.
    Setup,
    /// Worker → coordinator: chunk built and finalized.
    SetupAck,
    /// Coordinator → all: step count and run flags.
    Run,
    /// Coordinator → worker: send your probe records.
    Gather,
    /// Worker → coordinator: one probe's accumulated samples.
    ProbeData,
    /// Coordinator → all: tear down.
    Close,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Setup),
            1 => Ok(FrameKind::SetupAck),
            2 => Ok(FrameKind::Run),
            3 => Ok(FrameKind::Gather),
            4 => Ok(FrameKind::ProbeData),
            5 => Ok(FrameKind::Close),
            other => Err(Error::UnexpectedFrame { expected: "known", found: other }),
        }
    }
}

pub fn kind_of(frame: &[u8]) -> Result<FrameKind> {
    let first = *frame.first().ok_or(Error::BadFrame("empty"))?;
    FrameKind::try_from(first)
}

fn expect<'a>(frame: &'a [u8], kind: FrameKind, name: &'static str) -> Result<&'a [u8]> {
    let found = kind_of(frame)?;
    if found != kind {
        return Err(Error::UnexpectedFrame { expected: name, found: found as u8 });
    }
    Ok(&frame[1..])
}

// setup: kind | dt f64 | body_len u32 | body

pub fn encode_setup(dt: f64, chunk_body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 4 + chunk_body.len());
    buf.push(FrameKind::Setup as u8);
    buf.extend_from_slice(&dt.to_le_bytes());
    buf.extend_from_slice(&(chunk_body.len() as u32).to_le_bytes());
    buf.extend_from_slice(chunk_body);
    buf
}

pub fn decode_setup(frame: &[u8]) -> Result<(f64, &[u8])> {
    let rest = expect(frame, FrameKind::Setup, "setup")?;
    if rest.len() < 12 {
        return Err(Error::BadFrame("setup"));
    }
    let dt = f64::from_le_bytes(rest[..8].try_into().unwrap());
    let body_len = LittleEndian::read_u32(&rest[8..12]) as usize;
    let body = &rest[12..];
    if body.len() != body_len {
        return Err(Error::BadFrame("setup"));
    }
    Ok((dt, body))
}

// ack: kind | rank u32

pub fn encode_setup_ack(rank: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(FrameKind::SetupAck as u8);
    buf.extend_from_slice(&(rank as u32).to_le_bytes());
    buf
}

pub fn decode_setup_ack(frame: &[u8]) -> Result<usize> {
    let rest = expect(frame, FrameKind::SetupAck, "setup ack")?;
    if rest.len() != 4 {
        return Err(Error::BadFrame("setup ack"));
    }
    Ok(LittleEndian::read_u32(rest) as usize)
}

// run: kind | steps u64 | progress u8 | collect_timings u8

pub fn encode_run(steps: u64, progress: bool, collect_timings: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.push(FrameKind::Run as u8);
    buf.extend_from_slice(&steps.to_le_bytes());
    buf.push(progress as u8);
    buf.push(collect_timings as u8);
    buf
}

pub fn decode_run(frame: &[u8]) -> Result<(u64, bool, bool)> {
    let rest = expect(frame, FrameKind::Run, "run")?;
    if rest.len() != 10 {
        return Err(Error::BadFrame("run"));
    }
    let steps = LittleEndian::read_u64(&rest[..8]);
    Ok((steps, rest[8] != 0, rest[9] != 0))
}

pub fn encode_gather() -> Vec<u8> {
    vec![FrameKind::Gather as u8]
}

pub fn expect_gather(frame: &[u8]) -> Result<()> {
    expect(frame, FrameKind::Gather, "gather").map(|_| ())
}

pub fn encode_close() -> Vec<u8> {
    vec![FrameKind::Close as u8]
}

pub fn expect_close(frame: &[u8]) -> Result<()> {
    expect(frame, FrameKind::Close, "close").map(|_| ())
}

// probe data: kind | key u64 | rows u32 | cols u32 | count u32 | samples

pub fn encode_probe_data(key: u64, rows: usize, cols: usize, samples: &[Vec<f64>]) -> Vec<u8> {
    let n = rows * cols;
    let mut buf = Vec::with_capacity(1 + 8 + 4 + 4 + 4 + samples.len() * n * 8);
    buf.push(FrameKind::ProbeData as u8);
    buf.extend_from_slice(&key.to_le_bytes());
    buf.extend_from_slice(&(rows as u32).to_le_bytes());
    buf.extend_from_slice(&(cols as u32).to_le_bytes());
    buf.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    for sample in samples {
        for v in sample {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

pub fn decode_probe_data(frame: &[u8]) -> Result<(u64, Vec<Vec<f64>>)> {
    let rest = expect(frame, FrameKind::ProbeData, "probe data")?;
    if rest.len() < 20 {
        return Err(Error::BadFrame("probe data"));
    }
    let key = LittleEndian::read_u64(&rest[..8]);
    let rows = LittleEndian::read_u32(&rest[8..12]) as usize;
    let cols = LittleEndian::read_u32(&rest[12..16]) as usize;
    let count = LittleEndian::read_u32(&rest[16..20]) as usize;
    let n = rows * cols;
    let body = &rest[20..];
    if body.len() != count * n * 8 {
        return Err(Error::BadFrame("probe data"));
    }
    let mut samples = Vec::with_capacity(count);
    if n == 0 {
        // A probe that never sampled reports an empty shape.
        samples.resize(count, Vec::new());
        return Ok((key, samples));
    }
    for chunk in body.chunks_exact(n * 8) {
        let mut sample = Vec::with_capacity(n);
        for v in chunk.chunks_exact(8) {
            sample.push(f64::from_le_bytes(v.try_into().unwrap()));
        }
        samples.push(sample);
    }
    Ok((key, samples))
}

// signal payloads

pub fn encode_values(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub fn decode_values(bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::BadFrame("signal payload"));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_roundtrip() {
        let frame = encode_setup(0.001, b"chunk-bytes");
        let (dt, body) = decode_setup(&frame).unwrap();
        assert_eq!(dt, 0.001);
        assert_eq!(body, b"chunk-bytes");
    }

    #[test]
    fn run_roundtrip() {
        let frame = encode_run(5000, true, false);
        assert_eq!(decode_run(&frame).unwrap(), (5000, true, false));
    }

    #[test]
    fn ack_roundtrip() {
        assert_eq!(decode_setup_ack(&encode_setup_ack(3)).unwrap(), 3);
    }

    #[test]
    fn probe_data_roundtrip() {
        let samples = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let frame = encode_probe_data(0xbeef, 2, 1, &samples);
        let (key, decoded) = decode_probe_data(&frame).unwrap();
        assert_eq!(key, 0xbeef);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn values_roundtrip() {
        let values = [0.0, -1.5, f64::MAX];
        assert_eq!(decode_values(&encode_values(&values)).unwrap(), values);
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let frame = encode_run(1, false, false);
        assert!(matches!(
            decode_setup(&frame),
            Err(Error::UnexpectedFrame { expected: "setup", .. })
        ));
        assert!(expect_close(&frame).is_err());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(kind_of(&[]).is_err());
        assert!(decode_run(&[FrameKind::Run as u8, 1, 2]).is_err());
        assert!(decode_values(&[0u8; 7]).is_err());
    }
}
