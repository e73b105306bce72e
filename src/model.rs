//! Build-plan data model.
//!
//! A plan is produced by an external compiler and consumed read-only here:
//! one chunk description per target rank, each self-contained (a rank never
//! needs another rank's description to build its own chunk). Plans travel
//! as a magic/version header followed by a bincode body, and individual
//! chunk descriptions serialize standalone for the setup channel.

use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::comm::{Rank, Tag, COORDINATOR, FIRST_USER_TAG};
use crate::error::Error;
use crate::Result;

const PLAN_MAGIC: &[u8; 4] = b"SYNP";
const PLAN_VERSION: u32 = 1;

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// A named numeric state vector: stable key, `(rows, cols)` shape, and
/// initial contents stored row-major. The same key on two ranks denotes the
/// same logical signal; each rank keeps its own physical copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub key: u64,
    pub label: String,
    pub rows: usize,
    pub cols: usize,
    pub initial: Vec<f64>,
}

impl SignalSpec {
    /// A `(n, 1)` column vector.
    pub fn vector(key: u64, label: impl Into<String>, initial: Vec<f64>) -> Self {
        Self { key, label: label.into(), rows: initial.len(), cols: 1, initial }
    }

    /// An `(rows, cols)` matrix from row-major data.
    pub fn matrix(
        key: u64,
        label: impl Into<String>,
        rows: usize,
        cols: usize,
        initial: Vec<f64>,
    ) -> Self {
        Self { key, label: label.into(), rows, cols, initial }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// One scheduled unit of per-step work, referencing signals by key.
///
/// `Send`/`Recv`/`Wait` are the communication operators; everything else is
/// an ordinary compute operator whose scheduling order is all the engine
/// guarantees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpSpec {
    Reset { dst: u64, value: f64 },
    Copy { src: u64, dst: u64 },
    DotInc { a: u64, x: u64, y: u64 },
    ElementwiseInc { a: u64, x: u64, y: u64 },
    Lif { tau_rc: f64, tau_ref: f64, j: u64, out: u64 },
    LifRate { tau_rc: f64, tau_ref: f64, j: u64, out: u64 },
    RectifiedLinear { j: u64, out: u64 },
    Sigmoid { tau_ref: f64, j: u64, out: u64 },
    Synapse { input: u64, output: u64, num: Vec<f64>, den: Vec<f64> },
    Send { dst: Rank, tag: Tag, signal: u64 },
    Recv { src: Rank, tag: Tag, signal: u64 },
    Wait { tag: Tag },
}

/// A periodic sampler attached to a signal. `reply_tag` is the unique tag
/// its gather reply travels on, assigned at plan construction from the
/// probe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub key: u64,
    pub signal: u64,
    pub period: u64,
    pub reply_tag: Tag,
}

/// Everything one rank needs to build its chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub rank: Rank,
    pub signals: Vec<SignalSpec>,
    pub ops: Vec<OpSpec>,
    pub probes: Vec<ProbeSpec>,
}

impl ChunkSpec {
    pub fn new(rank: Rank) -> Self {
        Self { rank, signals: Vec::new(), ops: Vec::new(), probes: Vec::new() }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, config())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (spec, _len) = bincode::serde::decode_from_slice(bytes, config())?;
        Ok(spec)
    }

    fn signal(&self, key: u64) -> Option<&SignalSpec> {
        self.signals.iter().find(|s| s.key == key)
    }
}

/// A full partitioned build plan: global timestep plus one chunk per
/// target rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub dt: f64,
    pub chunks: Vec<ChunkSpec>,
}

struct PairEnd {
    rank: Rank,
    peer: Rank,
    shape: (usize, usize),
}

impl PlanSpec {
    pub fn new(dt: f64) -> Self {
        Self { dt, chunks: Vec::new() }
    }

    /// Number of ranks the plan requires, coordinator included.
    pub fn world_size(&self) -> usize {
        self.chunks.iter().map(|c| c.rank + 1).max().unwrap_or(1)
    }

    /// Whether the coordinating rank hosts a chunk itself.
    pub fn merged(&self) -> bool {
        self.chunks.iter().any(|c| c.rank == COORDINATOR)
    }

    pub fn chunk_for(&self, rank: Rank) -> Option<&ChunkSpec> {
        self.chunks.iter().find(|c| c.rank == rank)
    }

    /// Validate the plan as a whole: shapes, key resolution, tag hygiene,
    /// and agreement between the two ends of every communication pair.
    /// Runs on the coordinator before anything is distributed, so a bad
    /// plan fails before any rank blocks.
    pub fn validate(&self) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(Error::EmptyPlan);
        }

        let mut ranks = HashSet::new();
        for chunk in &self.chunks {
            if !ranks.insert(chunk.rank) {
                return Err(Error::DuplicateRank(chunk.rank));
            }
            validate_chunk(chunk)?;
        }

        // Every rank of the world must host a chunk (except the
        // coordinator, when it only orchestrates); a gap would leave a
        // worker blocked on a setup message that never comes.
        let world = self.world_size();
        let expected = if self.merged() { world } else { world - 1 };
        if self.chunks.len() != expected {
            return Err(Error::RankGap { world, chunks: self.chunks.len() });
        }

        // Pair ends, keyed by tag, across the whole plan.
        let mut sends: HashMap<Tag, PairEnd> = HashMap::new();
        let mut recvs: HashMap<Tag, PairEnd> = HashMap::new();
        let mut probe_keys = HashSet::new();
        let mut reply_tags = HashSet::new();
        for chunk in &self.chunks {
            for op in &chunk.ops {
                let (tag, peer, signal, ends) = match op {
                    OpSpec::Send { dst, tag, signal } => (*tag, *dst, *signal, &mut sends),
                    OpSpec::Recv { src, tag, signal } => (*tag, *src, *signal, &mut recvs),
                    _ => continue,
                };
                if tag < FIRST_USER_TAG {
                    return Err(Error::ReservedTag(tag));
                }
                if peer == chunk.rank {
                    return Err(Error::SelfPair(tag));
                }
                let shape = chunk
                    .signal(signal)
                    .ok_or(Error::UnknownSignal { rank: chunk.rank, key: signal })?
                    .shape();
                let end = PairEnd { rank: chunk.rank, peer, shape };
                if ends.insert(tag, end).is_some() {
                    return Err(Error::DuplicateTag(tag));
                }
            }
            for probe in &chunk.probes {
                if probe.period == 0 {
                    return Err(Error::BadProbePeriod { key: probe.key });
                }
                if probe.reply_tag < FIRST_USER_TAG {
                    return Err(Error::ReservedTag(probe.reply_tag));
                }
                if !probe_keys.insert(probe.key) {
                    return Err(Error::DuplicateProbe(probe.key));
                }
                if !reply_tags.insert(probe.reply_tag) {
                    return Err(Error::DuplicateTag(probe.reply_tag));
                }
                chunk
                    .signal(probe.signal)
                    .ok_or(Error::UnknownSignal { rank: chunk.rank, key: probe.signal })?;
            }
        }

        for (tag, send) in &sends {
            let recv = recvs.get(tag).ok_or(Error::UnpairedTag(*tag))?;
            if send.peer != recv.rank {
                return Err(Error::PeerMismatch {
                    tag: *tag,
                    declared: send.peer,
                    actual: recv.rank,
                });
            }
            if recv.peer != send.rank {
                return Err(Error::PeerMismatch {
                    tag: *tag,
                    declared: recv.peer,
                    actual: send.rank,
                });
            }
            if send.shape != recv.shape {
                return Err(Error::ShapeMismatch {
                    tag: *tag,
                    send: send.shape,
                    recv: recv.shape,
                });
            }
        }
        for tag in recvs.keys() {
            if !sends.contains_key(tag) {
                return Err(Error::UnpairedTag(*tag));
            }
            if reply_tags.contains(tag) {
                return Err(Error::DuplicateTag(*tag));
            }
        }
        for tag in sends.keys() {
            if reply_tags.contains(tag) {
                return Err(Error::DuplicateTag(*tag));
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(self, config())?;
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.extend_from_slice(PLAN_MAGIC);
        let mut version = [0u8; 4];
        LittleEndian::write_u32(&mut version, PLAN_VERSION);
        buf.extend_from_slice(&version);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != PLAN_MAGIC {
            return Err(Error::BadMagic);
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != PLAN_VERSION {
            return Err(Error::VersionMismatch { found: version, expected: PLAN_VERSION });
        }
        let (plan, _len) = bincode::serde::decode_from_slice(&bytes[8..], config())?;
        Ok(plan)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(fs::write(path, self.to_bytes()?)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

/// Per-chunk structural checks: signal shapes and uniqueness, key
/// resolution, and the wait pairing the scheduling contract relies on
/// (every communication operator has exactly one wait with its tag,
/// scheduled strictly before it).
fn validate_chunk(chunk: &ChunkSpec) -> Result<()> {
    let mut keys = HashSet::new();
    for signal in &chunk.signals {
        if !keys.insert(signal.key) {
            return Err(Error::DuplicateSignal { rank: chunk.rank, key: signal.key });
        }
        if signal.rows == 0
            || signal.cols == 0
            || signal.initial.len() != signal.rows * signal.cols
        {
            return Err(Error::BadShape {
                key: signal.key,
                rows: signal.rows,
                cols: signal.cols,
                len: signal.initial.len(),
            });
        }
    }

    let resolve = |key: u64| -> Result<()> {
        if keys.contains(&key) {
            Ok(())
        } else {
            Err(Error::UnknownSignal { rank: chunk.rank, key })
        }
    };

    let mut waits: HashMap<Tag, usize> = HashMap::new();
    let mut comm_ops: HashMap<Tag, usize> = HashMap::new();
    for (position, op) in chunk.ops.iter().enumerate() {
        match op {
            OpSpec::Reset { dst, .. } => resolve(*dst)?,
            OpSpec::Copy { src, dst } => {
                resolve(*src)?;
                resolve(*dst)?;
            }
            OpSpec::DotInc { a, x, y } | OpSpec::ElementwiseInc { a, x, y } => {
                resolve(*a)?;
                resolve(*x)?;
                resolve(*y)?;
            }
            OpSpec::Lif { j, out, .. }
            | OpSpec::LifRate { j, out, .. }
            | OpSpec::RectifiedLinear { j, out }
            | OpSpec::Sigmoid { j, out, .. } => {
                resolve(*j)?;
                resolve(*out)?;
            }
            OpSpec::Synapse { input, output, .. } => {
                resolve(*input)?;
                resolve(*output)?;
            }
            OpSpec::Send { tag, signal, .. } | OpSpec::Recv { tag, signal, .. } => {
                resolve(*signal)?;
                if comm_ops.insert(*tag, position).is_some() {
                    return Err(Error::DuplicateTag(*tag));
                }
            }
            OpSpec::Wait { tag } => {
                if waits.insert(*tag, position).is_some() {
                    return Err(Error::DuplicateTag(*tag));
                }
            }
        }
    }

    for (tag, comm_position) in &comm_ops {
        let wait_position = waits.get(tag).ok_or(Error::MissingWait(*tag))?;
        if wait_position > comm_position {
            return Err(Error::WaitOutOfOrder(*tag));
        }
    }
    for tag in waits.keys() {
        if !comm_ops.contains_key(tag) {
            return Err(Error::OrphanWait(*tag));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_rank_plan() -> PlanSpec {
        let mut producer = ChunkSpec::new(0);
        producer.signals.push(SignalSpec::vector(1, "gain", vec![1.0]));
        producer.signals.push(SignalSpec::vector(2, "drive", vec![1.0]));
        producer.signals.push(SignalSpec::vector(3, "boundary", vec![0.0]));
        producer.ops.push(OpSpec::Wait { tag: 16 });
        producer.ops.push(OpSpec::DotInc { a: 1, x: 2, y: 3 });
        producer.ops.push(OpSpec::Send { dst: 1, tag: 16, signal: 3 });

        let mut consumer = ChunkSpec::new(1);
        consumer.signals.push(SignalSpec::vector(3, "boundary", vec![0.0]));
        consumer.signals.push(SignalSpec::vector(4, "held", vec![0.0]));
        consumer.ops.push(OpSpec::Wait { tag: 16 });
        consumer.ops.push(OpSpec::Copy { src: 3, dst: 4 });
        consumer.ops.push(OpSpec::Recv { src: 0, tag: 16, signal: 3 });
        consumer.probes.push(ProbeSpec { key: 100, signal: 4, period: 1, reply_tag: 17 });

        PlanSpec { dt: 0.001, chunks: vec![producer, consumer] }
    }

    #[test]
    fn valid_plan_passes() {
        two_rank_plan().validate().unwrap();
    }

    #[test]
    fn world_size_and_merged() {
        let plan = two_rank_plan();
        assert_eq!(plan.world_size(), 2);
        assert!(plan.merged());
    }

    #[test]
    fn rank_gaps_fail() {
        let mut plan = two_rank_plan();
        plan.chunks[1].rank = 3;
        for op in &mut plan.chunks[0].ops {
            if let OpSpec::Send { dst, .. } = op {
                *dst = 3;
            }
        }
        assert!(matches!(plan.validate(), Err(Error::RankGap { world: 4, chunks: 2 })));
    }

    #[test]
    fn mismatched_pair_tags_fail() {
        let mut plan = two_rank_plan();
        // The consumer listens on a different tag than the producer sends.
        for op in &mut plan.chunks[1].ops {
            match op {
                OpSpec::Recv { tag, .. } | OpSpec::Wait { tag } => *tag = 18,
                _ => {}
            }
        }
        assert!(matches!(plan.validate(), Err(Error::UnpairedTag(_))));
    }

    #[test]
    fn mismatched_shapes_fail() {
        let mut plan = two_rank_plan();
        plan.chunks[1].signals[0] = SignalSpec::vector(3, "boundary", vec![0.0, 0.0]);
        assert!(matches!(plan.validate(), Err(Error::ShapeMismatch { tag: 16, .. })));
    }

    #[test]
    fn wrong_peer_rank_fails() {
        let mut plan = two_rank_plan();
        if let OpSpec::Send { dst, .. } = &mut plan.chunks[0].ops[2] {
            *dst = 5;
        }
        assert!(matches!(plan.validate(), Err(Error::PeerMismatch { tag: 16, .. })));
    }

    #[test]
    fn reserved_tags_fail() {
        let mut plan = two_rank_plan();
        // Move the producer's whole pair end into the reserved range.
        for op in &mut plan.chunks[0].ops {
            match op {
                OpSpec::Send { tag, .. } | OpSpec::Wait { tag } => *tag = 2,
                _ => {}
            }
        }
        assert!(matches!(plan.validate(), Err(Error::ReservedTag(2))));
    }

    #[test]
    fn missing_wait_fails() {
        let mut plan = two_rank_plan();
        plan.chunks[0].ops.remove(0);
        assert!(matches!(plan.validate(), Err(Error::MissingWait(16))));
    }

    #[test]
    fn wait_after_its_operator_fails() {
        let mut plan = two_rank_plan();
        let wait = plan.chunks[0].ops.remove(0);
        plan.chunks[0].ops.push(wait);
        assert!(matches!(plan.validate(), Err(Error::WaitOutOfOrder(16))));
    }

    #[test]
    fn unknown_signal_fails() {
        let mut plan = two_rank_plan();
        plan.chunks[0].ops[1] = OpSpec::DotInc { a: 1, x: 99, y: 3 };
        assert!(matches!(
            plan.validate(),
            Err(Error::UnknownSignal { rank: 0, key: 99 })
        ));
    }

    #[test]
    fn bad_signal_shape_fails() {
        let mut plan = two_rank_plan();
        plan.chunks[0].signals[0].rows = 7;
        assert!(matches!(plan.validate(), Err(Error::BadShape { key: 1, .. })));
    }

    #[test]
    fn duplicate_probe_key_fails() {
        let mut plan = two_rank_plan();
        let mut probe = plan.chunks[1].probes[0].clone();
        probe.reply_tag = 18;
        plan.chunks[1].probes.push(probe);
        assert!(matches!(plan.validate(), Err(Error::DuplicateProbe(100))));
    }

    #[test]
    fn plan_bytes_roundtrip() {
        let plan = two_rank_plan();
        let bytes = plan.to_bytes().unwrap();
        assert_eq!(PlanSpec::from_bytes(&bytes).unwrap(), plan);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let plan = two_rank_plan();
        let mut bytes = plan.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(PlanSpec::from_bytes(&bytes), Err(Error::BadMagic)));

        let mut bytes = plan.to_bytes().unwrap();
        bytes[4] = 0xff;
        assert!(matches!(
            PlanSpec::from_bytes(&bytes),
            Err(Error::VersionMismatch { .. })
        ));
    }

    #[test]
    fn chunk_bytes_roundtrip() {
        let chunk = &two_rank_plan().chunks[1];
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(&ChunkSpec::from_bytes(&bytes).unwrap(), chunk);
    }
}
