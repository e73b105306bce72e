//! The execution engine: chunks, operators, signal buffers, probes, and
//! the coordinator/worker protocol halves that drive them.

pub mod chunk;
pub mod coordinator;
pub mod operator;
pub mod probe;
pub mod signal;
pub mod worker;

pub use chunk::Chunk;
pub use coordinator::Simulator;
pub use worker::run_worker;
