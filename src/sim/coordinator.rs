//! The coordinator: distributes a validated build plan to worker ranks,
//! triggers the lockstep run, gathers probe histories, and tears the world
//! down. In merged mode it also hosts and steps the rank-0 chunk itself.
//!
//! Lifecycle calls are strictly linear (build, finalize, run, gather,
//! close) and each either completes fully or reports failure; there is no
//! partial-progress resumption, so out-of-order calls are errors rather
//! than undefined protocol states.

use std::path::Path;

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::comm::{wire, Communicator, Rank, GATHER_TAG, SETUP_TAG};
use crate::error::Error;
use crate::model::PlanSpec;
use crate::sim::chunk::Chunk;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Built,
    Finalized,
    Ran,
    Gathered,
    Closed,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Built => "built",
            Phase::Finalized => "finalized",
            Phase::Ran => "run",
            Phase::Gathered => "gathered",
            Phase::Closed => "closed",
        }
    }
}

pub struct Simulator {
    comm: Box<dyn Communicator>,
    plan: PlanSpec,
    merged: bool,
    chunk: Option<Chunk>,
    results: HashMap<u64, Vec<Vec<f64>>>,
    phase: Phase,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("merged", &self.merged)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Take in a build plan and validate it in full. Every setup error the
    /// plan can carry is reported here, before any rank is contacted.
    pub fn from_plan(plan: PlanSpec, comm: Box<dyn Communicator>, merged: bool) -> Result<Self> {
        plan.validate()?;
        if plan.merged() != merged {
            return Err(Error::MergedFlag { merged });
        }
        let needed = plan.world_size();
        if comm.size() != needed {
            return Err(Error::WorldSize { needed, actual: comm.size() });
        }
        Ok(Self {
            comm,
            plan,
            merged,
            chunk: None,
            results: HashMap::new(),
            phase: Phase::Built,
        })
    }

    /// Read a plan from storage and take it in.
    pub fn from_file(
        path: impl AsRef<Path>,
        comm: Box<dyn Communicator>,
        merged: bool,
    ) -> Result<Self> {
        Self::from_plan(PlanSpec::from_file(path)?, comm, merged)
    }

    fn expect_phase(&self, phase: Phase, call: &'static str) -> Result<()> {
        if self.phase != phase {
            return Err(Error::Lifecycle { expected: self.phase.name(), call });
        }
        Ok(())
    }

    fn worker_ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        self.plan
            .chunks
            .iter()
            .map(|c| c.rank)
            .filter(|&r| r != self.comm.rank())
    }

    /// Distribute each worker's chunk description over the setup channel,
    /// build the coordinator's own chunk in merged mode, and wait for every
    /// worker's acknowledgement.
    pub fn finalize_build(&mut self) -> Result<()> {
        self.expect_phase(Phase::Built, "finalize_build")?;
        let workers: Vec<Rank> = self.worker_ranks().collect();

        for &rank in &workers {
            let spec = self.plan.chunk_for(rank).expect("rank taken from the plan");
            let frame = wire::encode_setup(self.plan.dt, &spec.to_bytes()?);
            debug!(rank, bytes = frame.len(), "sending chunk description");
            self.comm.send(rank, SETUP_TAG, &frame)?;
        }

        for &rank in &workers {
            let frame = self.comm.recv(rank, SETUP_TAG)?;
            let acked = wire::decode_setup_ack(&frame)?;
            if acked != rank {
                return Err(Error::WrongRank { declared: acked, actual: rank });
            }
        }

        // With every worker acknowledged, build the coordinator's own chunk
        // the same way the workers built theirs.
        if self.merged {
            let spec = self
                .plan
                .chunk_for(self.comm.rank())
                .expect("merged plans host a chunk on the coordinator");
            let mut chunk = Chunk::from_spec(spec, self.plan.dt)?;
            chunk.finalize()?;
            self.chunk = Some(chunk);
        }

        info!(
            world = self.comm.size(),
            chunks = self.plan.chunks.len(),
            merged = self.merged,
            "build finalized"
        );
        self.phase = Phase::Finalized;
        Ok(())
    }

    /// Broadcast the run parameters, then step the local chunk (if any) in
    /// lockstep with the workers. No further coordination happens during
    /// stepping beyond the pairs' own send/receive/wait traffic.
    pub fn run_n_steps(&mut self, steps: u64, progress: bool, collect_timings: bool) -> Result<()> {
        self.expect_phase(Phase::Finalized, "run_n_steps")?;
        info!(steps, progress, collect_timings, "starting run");
        self.comm
            .broadcast(&wire::encode_run(steps, progress, collect_timings))?;
        if let Some(chunk) = &mut self.chunk {
            chunk.run_steps(self.comm.as_ref(), steps, progress, collect_timings)?;
        }
        self.phase = Phase::Ran;
        Ok(())
    }

    /// Request every worker's probe records and merge them, with the
    /// coordinator's own probes, into one mapping from probe key to sample
    /// sequence. A worker owning no probes receives the request and sends
    /// no reply.
    pub fn gather_probe_data(&mut self) -> Result<&HashMap<u64, Vec<Vec<f64>>>> {
        self.expect_phase(Phase::Ran, "gather_probe_data")?;

        if let Some(chunk) = &mut self.chunk {
            for probe in chunk.probes_mut() {
                self.results.insert(probe.key(), probe.take_samples());
            }
        }

        let workers: Vec<Rank> = self.worker_ranks().collect();
        for &rank in &workers {
            self.comm.send(rank, GATHER_TAG, &wire::encode_gather())?;
        }
        for &rank in &workers {
            let probes = self
                .plan
                .chunk_for(rank)
                .expect("rank taken from the plan")
                .probes
                .clone();
            for probe_spec in probes {
                let frame = self.comm.recv(rank, probe_spec.reply_tag)?;
                let (key, samples) = wire::decode_probe_data(&frame)?;
                if key != probe_spec.key {
                    return Err(Error::ProbeKeyMismatch {
                        tag: probe_spec.reply_tag,
                        expected: probe_spec.key,
                        found: key,
                    });
                }
                debug!(rank, key, samples = samples.len(), "gathered probe");
                self.results.insert(key, samples);
            }
        }

        self.phase = Phase::Gathered;
        Ok(&self.results)
    }

    /// The merged mapping from probe key to sample sequence, available
    /// after [`Self::gather_probe_data`].
    pub fn probe_data(&self) -> &HashMap<u64, Vec<Vec<f64>>> {
        &self.results
    }

    /// Broadcast the close frame and end the run.
    pub fn close(&mut self) -> Result<()> {
        self.expect_phase(Phase::Gathered, "close")?;
        self.comm.broadcast(&wire::encode_close())?;
        self.phase = Phase::Closed;
        info!("simulation closed");
        Ok(())
    }

    /// The coordinator-hosted chunk, present in merged mode once the build
    /// is finalized.
    pub fn chunk(&self) -> Option<&Chunk> {
        self.chunk.as_ref()
    }
}
