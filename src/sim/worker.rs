//! The worker half of the coordinator's protocols: build from the setup
//! frame, acknowledge, run on broadcast, reply to the gather request, and
//! return on close. Each phase expects exactly one conversation shape; an
//! unexpected frame means the build plan and the schedule disagree, which
//! is fatal (the ordering contract is already lost).

use tracing::{debug, debug_span};

use crate::comm::{wire, Communicator, COORDINATOR, GATHER_TAG, SETUP_TAG};
use crate::error::Error;
use crate::model::ChunkSpec;
use crate::sim::chunk::Chunk;
use crate::Result;

/// Drive one worker rank through its whole lifecycle. Returns when the
/// coordinator closes the run, or with the first fatal error.
pub fn run_worker(comm: &dyn Communicator) -> Result<()> {
    let span = debug_span!("worker", rank = comm.rank());
    let _guard = span.enter();

    // setup
    let frame = comm.recv(COORDINATOR, SETUP_TAG)?;
    let (dt, body) = wire::decode_setup(&frame)?;
    let spec = ChunkSpec::from_bytes(body)?;
    if spec.rank != comm.rank() {
        return Err(Error::WrongRank { declared: spec.rank, actual: comm.rank() });
    }
    debug!(
        dt,
        ops = spec.ops.len(),
        signals = spec.signals.len(),
        probes = spec.probes.len(),
        "received chunk description"
    );
    let mut chunk = Chunk::from_spec(&spec, dt)?;
    chunk.finalize()?;
    comm.send(COORDINATOR, SETUP_TAG, &wire::encode_setup_ack(comm.rank()))?;

    // run
    let frame = comm.broadcast_recv()?;
    let (steps, progress, collect_timings) = wire::decode_run(&frame)?;
    chunk.run_steps(comm, steps, progress, collect_timings)?;

    // gather: one reply per owned probe, on the probe's own reply tag;
    // a chunk with no probes sends nothing.
    let frame = comm.recv(COORDINATOR, GATHER_TAG)?;
    wire::expect_gather(&frame)?;
    for probe in chunk.probes_mut() {
        let reply_tag = probe.reply_tag();
        let key = probe.key();
        let samples = probe.take_samples();
        let rows = samples.first().map_or(0, Vec::len);
        let frame = wire::encode_probe_data(key, rows, 1, &samples);
        debug!(key, samples = samples.len(), "replying with probe history");
        comm.send(COORDINATOR, reply_tag, &frame)?;
    }

    // close
    let frame = comm.broadcast_recv()?;
    wire::expect_close(&frame)?;
    debug!("worker closed");
    Ok(())
}
