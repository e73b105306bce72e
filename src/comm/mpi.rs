//! MPI-backed transport for cluster runs. Compiled only with the `mpi`
//! feature; requires an MPI installation and an `mpirun` launch.
//!
//! The send half of a pair is buffered eagerly at issue time and the
//! receive half performs its blocking receive inside `wait`. Under the
//! engine's scheduling contract (waits retire a pair's previous transfer
//! before the buffer is touched again) this is observationally identical to
//! true isend/irecv overlap.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{wire, Communicator, PendingRequest, Rank, Tag, COORDINATOR};
use crate::Result;

/// World-communicator endpoint. Construct after `mpi::initialize()` and
/// keep the returned `Universe` alive for the duration of the run.
pub struct MpiCommunicator {
    world: SimpleCommunicator,
}

impl MpiCommunicator {
    pub fn new() -> Self {
        Self { world: SimpleCommunicator::world() }
    }
}

impl Default for MpiCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> Rank {
        self.world.rank() as Rank
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn send(&self, dst: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.world
            .process_at_rank(dst as i32)
            .send_with_tag(payload, tag as i32);
        Ok(())
    }

    fn recv(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let (bytes, _status) = self
            .world
            .process_at_rank(src as i32)
            .receive_vec_with_tag::<u8>(tag as i32);
        Ok(bytes)
    }

    fn broadcast(&self, payload: &[u8]) -> Result<()> {
        let root = self.world.process_at_rank(COORDINATOR as i32);
        let mut len = payload.len() as u64;
        root.broadcast_into(&mut len);
        let mut buf = payload.to_vec();
        root.broadcast_into(&mut buf[..]);
        Ok(())
    }

    fn broadcast_recv(&self) -> Result<Vec<u8>> {
        let root = self.world.process_at_rank(COORDINATOR as i32);
        let mut len = 0u64;
        root.broadcast_into(&mut len);
        let mut buf = vec![0u8; len as usize];
        root.broadcast_into(&mut buf[..]);
        Ok(buf)
    }

    fn isend(&self, dst: Rank, tag: Tag, values: &[f64]) -> Result<PendingRequest> {
        let bytes = wire::encode_values(values);
        self.world
            .process_at_rank(dst as i32)
            .send_with_tag(&bytes[..], tag as i32);
        Ok(PendingRequest::Send { dst, tag })
    }

    fn irecv(&self, src: Rank, tag: Tag) -> Result<PendingRequest> {
        Ok(PendingRequest::Recv { src, tag })
    }

    fn wait(&self, request: PendingRequest) -> Result<Option<Vec<f64>>> {
        match request {
            PendingRequest::Send { .. } => Ok(None),
            PendingRequest::Recv { src, tag } => {
                let (bytes, _status) = self
                    .world
                    .process_at_rank(src as i32)
                    .receive_vec_with_tag::<u8>(tag as i32);
                wire::decode_values(&bytes).map(Some)
            }
        }
    }
}
