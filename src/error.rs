use std::fmt;
use std::io;

use crate::comm::{Rank, Tag};

/// Every failure the engine reports.
///
/// Setup variants surface before any step runs; protocol variants indicate a
/// build-plan/schedule mismatch observed mid-conversation and are fatal to
/// the whole run.
pub enum Error {
    Io(io::Error),
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),

    // plan file
    BadMagic,
    VersionMismatch { found: u32, expected: u32 },

    // plan validation
    EmptyPlan,
    DuplicateRank(Rank),
    DuplicateSignal { rank: Rank, key: u64 },
    UnknownSignal { rank: Rank, key: u64 },
    BadShape { key: u64, rows: usize, cols: usize, len: usize },
    BadProbePeriod { key: u64 },
    DuplicateProbe(u64),
    ReservedTag(Tag),
    DuplicateTag(Tag),
    UnpairedTag(Tag),
    SelfPair(Tag),
    PeerMismatch { tag: Tag, declared: Rank, actual: Rank },
    ShapeMismatch { tag: Tag, send: (usize, usize), recv: (usize, usize) },
    MissingWait(Tag),
    OrphanWait(Tag),
    WaitOutOfOrder(Tag),

    RankGap { world: usize, chunks: usize },

    // lifecycle
    MergedFlag { merged: bool },
    WorldSize { needed: usize, actual: usize },
    WrongRank { declared: Rank, actual: Rank },
    Finalized,
    NotFinalized,
    Lifecycle { expected: &'static str, call: &'static str },

    // protocol
    UnexpectedFrame { expected: &'static str, found: u8 },
    BadFrame(&'static str),
    PayloadShape { tag: Tag, expected: usize, found: usize },
    ProbeKeyMismatch { tag: Tag, expected: u64, found: u64 },
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Io(e) => write!(f, "io error: {e}"),
            Encode(e) => write!(f, "encode error: {e}"),
            Decode(e) => write!(f, "decode error: {e}"),
            BadMagic => write!(f, "not a plan file (bad magic)"),
            VersionMismatch { found, expected } => {
                write!(f, "plan version {found}, this engine reads {expected}")
            }
            EmptyPlan => write!(f, "plan declares no chunks"),
            DuplicateRank(r) => write!(f, "two chunks target rank {r}"),
            DuplicateSignal { rank, key } => {
                write!(f, "chunk on rank {rank} declares signal {key:#x} twice")
            }
            UnknownSignal { rank, key } => {
                write!(f, "chunk on rank {rank} references unknown signal {key:#x}")
            }
            BadShape { key, rows, cols, len } => write!(
                f,
                "signal {key:#x} is {rows}x{cols} but carries {len} values"
            ),
            BadProbePeriod { key } => {
                write!(f, "probe {key:#x} has a zero sampling period")
            }
            DuplicateProbe(key) => write!(f, "probe key {key:#x} declared twice"),
            ReservedTag(t) => write!(f, "tag {t} is inside the reserved range"),
            DuplicateTag(t) => write!(f, "tag {t} used by more than one pair"),
            UnpairedTag(t) => write!(f, "tag {t} has only one end declared"),
            SelfPair(t) => write!(f, "pair {t} sends a chunk to itself"),
            PeerMismatch { tag, declared, actual } => write!(
                f,
                "pair {tag} names peer rank {declared} but its other end is on rank {actual}"
            ),
            ShapeMismatch { tag, send, recv } => write!(
                f,
                "pair {tag} connects a {}x{} buffer to a {}x{} buffer",
                send.0, send.1, recv.0, recv.1
            ),
            MissingWait(t) => write!(f, "no wait scheduled for pair {t}"),
            OrphanWait(t) => write!(f, "wait for pair {t} has no send or receive"),
            WaitOutOfOrder(t) => {
                write!(f, "wait for pair {t} is scheduled after its operator")
            }
            RankGap { world, chunks } => write!(
                f,
                "a world of {world} ranks leaves some without a chunk ({chunks} declared)"
            ),
            MergedFlag { merged } => {
                if *merged {
                    write!(f, "merged simulator but the plan hosts no chunk on rank 0")
                } else {
                    write!(f, "plan hosts a chunk on rank 0 but the simulator is not merged")
                }
            }
            WorldSize { needed, actual } => {
                write!(f, "plan needs a world of {needed} ranks, have {actual}")
            }
            WrongRank { declared, actual } => {
                write!(f, "chunk built for rank {declared} arrived on rank {actual}")
            }
            Finalized => write!(f, "chunk is already finalized"),
            NotFinalized => write!(f, "chunk stepped before finalize"),
            Lifecycle { expected, call } => {
                write!(f, "{call} called while the simulator is {expected}")
            }
            UnexpectedFrame { expected, found } => {
                write!(f, "expected a {expected} frame, got kind {found}")
            }
            BadFrame(what) => write!(f, "malformed {what} frame"),
            PayloadShape { tag, expected, found } => write!(
                f,
                "pair {tag} delivered {found} values into a buffer of {expected}"
            ),
            ProbeKeyMismatch { tag, expected, found } => write!(
                f,
                "reply on tag {tag} carries probe {found:#x}, plan says {expected:#x}"
            ),
            Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Encode(e) => Some(e),
            Error::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Decode(e)
    }
}
