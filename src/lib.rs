//! Distributed lockstep execution engine for timestep-driven operator graphs.
//!
//! A coordinating rank distributes per-rank chunk descriptions of a
//! pre-partitioned operator graph over a tag-addressed messaging layer, every
//! rank then steps its local operator schedule in lockstep, and boundary
//! signal values cross rank boundaries through non-blocking send/receive
//! pairs completed by explicit wait operators. After the run, sampled probe
//! histories are gathered back to the coordinator.
//!
//! The messaging layer is abstracted behind [`comm::Communicator`]: the
//! default backend runs every rank as a thread of one process connected by
//! channels, and the `mpi` feature provides an MPI-backed implementation for
//! cluster runs. Engine semantics are identical on both.

pub mod comm;
pub mod error;
pub mod model;
pub mod sim;

pub use error::Error;
pub use model::{ChunkSpec, OpSpec, PlanSpec, ProbeSpec, SignalSpec};
pub use sim::{run_worker, Chunk, Simulator};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
