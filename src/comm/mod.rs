//! Messaging layer: a reliable, ordered, tag-addressed point-to-point and
//! broadcast transport, abstracted so the engine runs unchanged over
//! in-process channels or MPI.

pub mod channel;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod wire;

use crate::Result;

/// Index of a process in the world. Rank 0 is always the coordinator.
pub type Rank = usize;

/// Message tag. Tags below [`FIRST_USER_TAG`] are reserved for the engine's
/// own protocol traffic; the build plan assigns pair and probe-reply tags
/// from the user range.
pub type Tag = u32;

/// The coordinating rank.
pub const COORDINATOR: Rank = 0;

/// Setup-phase chunk distribution and acknowledgements.
pub const SETUP_TAG: Tag = 1;
/// Probe-gather requests.
pub const GATHER_TAG: Tag = 2;
/// Broadcast control frames (run parameters, close).
pub const CTRL_TAG: Tag = 3;
/// First tag available to build plans.
pub const FIRST_USER_TAG: Tag = 16;

/// Handle to an in-flight non-blocking transfer.
///
/// Created by [`Communicator::isend`]/[`Communicator::irecv`], owned by the
/// issuing communication operator's paired wait until retired through
/// [`Communicator::wait`]. The send half is already buffered by the transport
/// when the handle is created; the receive half completes at wait time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Send { dst: Rank, tag: Tag },
    Recv { src: Rank, tag: Tag },
}

/// One process's endpoint of the messaging layer.
///
/// Constructed once at process start and passed explicitly to everything
/// that communicates; there is no ambient global communicator. Blocking
/// calls are `send`/`recv`/`broadcast_recv` and `wait`; `isend`/`irecv`
/// never block the caller.
pub trait Communicator: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Blocking tagged send of an opaque control payload.
    fn send(&self, dst: Rank, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Blocking tagged receive from a specific source. Messages from the
    /// same source with the same tag arrive in the order they were sent.
    fn recv(&self, src: Rank, tag: Tag) -> Result<Vec<u8>>;

    /// Broadcast a control payload from the coordinator to every other rank.
    /// Call only on rank [`COORDINATOR`].
    fn broadcast(&self, payload: &[u8]) -> Result<()>;

    /// Receive the coordinator's next broadcast. Call only on ranks other
    /// than [`COORDINATOR`].
    fn broadcast_recv(&self) -> Result<Vec<u8>>;

    /// Issue a non-blocking transmission of signal values.
    fn isend(&self, dst: Rank, tag: Tag, values: &[f64]) -> Result<PendingRequest>;

    /// Issue a non-blocking reception of signal values.
    fn irecv(&self, src: Rank, tag: Tag) -> Result<PendingRequest>;

    /// Block until `request` completes. Returns the delivered values for a
    /// receive half, `None` for a send half.
    fn wait(&self, request: PendingRequest) -> Result<Option<Vec<f64>>>;
}
