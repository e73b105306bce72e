//! A chunk: one rank's partition of the operator graph. Owns an ordered
//! operator schedule, the signal buffers those operators touch, the
//! pending-request slots its communication pairs hand off through, a local
//! clock, and the probes sampling its signals.
//!
//! Structure is frozen by [`Chunk::finalize`]; after that the only mutation
//! is executing the schedule, one pass per step, single-threaded and in
//! fixed order. Cross-rank ordering comes exclusively from the
//! send/receive/wait pairing; there is no barrier between steps.

use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::comm::{Communicator, PendingRequest, Rank, Tag};
use crate::error::Error;
use crate::model::{ChunkSpec, OpSpec};
use crate::sim::operator::{
    CopyOp, DotInc, ElementwiseInc, Lif, LifRate, Operator, RecvOp, Reset, RectifiedLinear,
    SendOp, Sigmoid, StepContext, Synapse, WaitOp,
};
use crate::sim::probe::Probe;
use crate::sim::signal::SignalBuffer;
use crate::Result;

#[derive(Debug)]
pub struct Chunk {
    rank: Rank,
    dt: f64,
    time: f64,
    steps_run: u64,
    signals: Vec<SignalBuffer>,
    index: HashMap<u64, usize>,
    ops: Vec<Operator>,
    requests: Vec<Option<PendingRequest>>,
    probes: Vec<Probe>,
    // schedule positions kept from build for the finalize pairing check
    wait_positions: HashMap<Tag, usize>,
    comm_positions: HashMap<Tag, usize>,
    finalized: bool,
}

impl Chunk {
    /// Build a chunk from its self-contained description. Resolves every
    /// signal reference, assigns one request slot per communication pair,
    /// and wires each wait to its pair's slot.
    pub fn from_spec(spec: &ChunkSpec, dt: f64) -> Result<Self> {
        let mut signals = Vec::with_capacity(spec.signals.len());
        let mut index = HashMap::with_capacity(spec.signals.len());
        for signal_spec in &spec.signals {
            if index.contains_key(&signal_spec.key) {
                return Err(Error::DuplicateSignal { rank: spec.rank, key: signal_spec.key });
            }
            index.insert(signal_spec.key, signals.len());
            signals.push(SignalBuffer::from_spec(signal_spec)?);
        }

        let resolve = |key: u64| -> Result<usize> {
            index
                .get(&key)
                .copied()
                .ok_or(Error::UnknownSignal { rank: spec.rank, key })
        };

        // One slot per pair, assigned before operators are built so that a
        // wait scheduled ahead of its send/receive finds its slot.
        let mut slots: HashMap<Tag, (usize, Option<usize>)> = HashMap::new();
        for op in &spec.ops {
            let (tag, delivery) = match op {
                OpSpec::Send { tag, .. } => (*tag, None),
                OpSpec::Recv { tag, signal, .. } => (*tag, Some(resolve(*signal)?)),
                _ => continue,
            };
            let slot = slots.len();
            if slots.insert(tag, (slot, delivery)).is_some() {
                return Err(Error::DuplicateTag(tag));
            }
        }

        let mut ops = Vec::with_capacity(spec.ops.len());
        let mut wait_positions = HashMap::new();
        let mut comm_positions = HashMap::new();
        for (position, op_spec) in spec.ops.iter().enumerate() {
            let op = match op_spec {
                OpSpec::Reset { dst, value } => {
                    Operator::Reset(Reset::new(resolve(*dst)?, *value))
                }
                OpSpec::Copy { src, dst } => {
                    let src = resolve(*src)?;
                    Operator::Copy(CopyOp::new(src, resolve(*dst)?, signals[src].len()))
                }
                OpSpec::DotInc { a, x, y } => {
                    let y = resolve(*y)?;
                    Operator::DotInc(DotInc::new(resolve(*a)?, resolve(*x)?, y, signals[y].len()))
                }
                OpSpec::ElementwiseInc { a, x, y } => {
                    let y = resolve(*y)?;
                    Operator::ElementwiseInc(ElementwiseInc::new(
                        resolve(*a)?,
                        resolve(*x)?,
                        y,
                        signals[y].len(),
                    ))
                }
                OpSpec::Lif { tau_rc, tau_ref, j, out } => {
                    let j = resolve(*j)?;
                    Operator::Lif(Lif::new(*tau_rc, *tau_ref, j, resolve(*out)?, signals[j].len()))
                }
                OpSpec::LifRate { tau_rc, tau_ref, j, out } => {
                    let j = resolve(*j)?;
                    Operator::LifRate(LifRate::new(
                        *tau_rc,
                        *tau_ref,
                        j,
                        resolve(*out)?,
                        signals[j].len(),
                    ))
                }
                OpSpec::RectifiedLinear { j, out } => {
                    let j = resolve(*j)?;
                    Operator::RectifiedLinear(RectifiedLinear::new(
                        j,
                        resolve(*out)?,
                        signals[j].len(),
                    ))
                }
                OpSpec::Sigmoid { tau_ref, j, out } => {
                    let j = resolve(*j)?;
                    Operator::Sigmoid(Sigmoid::new(*tau_ref, j, resolve(*out)?, signals[j].len()))
                }
                OpSpec::Synapse { input, output, num, den } => {
                    let input = resolve(*input)?;
                    Operator::Synapse(Synapse::new(
                        input,
                        resolve(*output)?,
                        num.clone(),
                        den.clone(),
                        signals[input].len(),
                    ))
                }
                OpSpec::Send { dst, tag, signal } => {
                    comm_positions.insert(*tag, position);
                    let (slot, _) = slots[tag];
                    Operator::Send(SendOp::new(*dst, *tag, resolve(*signal)?, slot))
                }
                OpSpec::Recv { src, tag, .. } => {
                    comm_positions.insert(*tag, position);
                    let (slot, _) = slots[tag];
                    Operator::Recv(RecvOp::new(*src, *tag, slot))
                }
                OpSpec::Wait { tag } => {
                    if wait_positions.insert(*tag, position).is_some() {
                        return Err(Error::DuplicateTag(*tag));
                    }
                    let (slot, delivery) = *slots.get(tag).ok_or(Error::OrphanWait(*tag))?;
                    Operator::Wait(WaitOp::new(*tag, slot, delivery))
                }
            };
            ops.push(op);
        }

        let mut probes = Vec::with_capacity(spec.probes.len());
        for probe_spec in &spec.probes {
            if probe_spec.period == 0 {
                return Err(Error::BadProbePeriod { key: probe_spec.key });
            }
            probes.push(Probe::new(probe_spec, resolve(probe_spec.signal)?));
        }

        Ok(Self {
            rank: spec.rank,
            dt,
            time: 0.0,
            steps_run: 0,
            requests: vec![None; slots.len()],
            signals,
            index,
            ops,
            probes,
            wait_positions,
            comm_positions,
            finalized: false,
        })
    }

    /// Freeze the chunk and validate the local half of the scheduling
    /// contract: every communication operator has exactly one wait with its
    /// tag, scheduled strictly before it. Must run before the first step.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        for (tag, comm_position) in &self.comm_positions {
            let wait_position =
                self.wait_positions.get(tag).ok_or(Error::MissingWait(*tag))?;
            if wait_position > comm_position {
                return Err(Error::WaitOutOfOrder(*tag));
            }
        }
        for tag in self.wait_positions.keys() {
            if !self.comm_positions.contains_key(tag) {
                return Err(Error::OrphanWait(*tag));
            }
        }
        self.finalized = true;
        debug!(
            rank = self.rank,
            ops = self.ops.len(),
            signals = self.signals.len(),
            probes = self.probes.len(),
            "chunk finalized"
        );
        Ok(())
    }

    /// Execute one pass of the schedule, then sample due probes and advance
    /// the clock.
    pub fn step(&mut self, comm: &dyn Communicator) -> Result<()> {
        if !self.finalized {
            return Err(Error::NotFinalized);
        }
        let dt = self.dt;
        for op in &mut self.ops {
            let mut ctx = StepContext {
                signals: self.signals.as_mut_slice(),
                requests: self.requests.as_mut_slice(),
                comm,
                dt,
            };
            op.step(&mut ctx)?;
        }
        self.steps_run += 1;
        self.time += dt;
        let step = self.steps_run;
        for probe in &mut self.probes {
            if probe.due(step) {
                probe.record(self.signals[probe.signal()].read());
            }
        }
        Ok(())
    }

    /// Step `steps` times. `progress` logs at coarse intervals;
    /// `collect_timings` logs the loop's wall-clock duration at the end.
    pub fn run_steps(
        &mut self,
        comm: &dyn Communicator,
        steps: u64,
        progress: bool,
        collect_timings: bool,
    ) -> Result<()> {
        let started = Instant::now();
        let report_every = (steps / 10).max(1);
        for k in 1..=steps {
            self.step(comm)?;
            if progress && k % report_every == 0 {
                debug!(rank = self.rank, step = k, total = steps, "stepping");
            }
        }
        if collect_timings {
            info!(
                rank = self.rank,
                steps,
                elapsed_s = started.elapsed().as_secs_f64(),
                "step loop finished"
            );
        }
        Ok(())
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn steps_run(&self) -> u64 {
        self.steps_run
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Tags of this chunk's communication pairs, in no particular order.
    pub fn pair_tags(&self) -> Vec<Tag> {
        self.comm_positions.keys().copied().collect()
    }

    pub fn shape_of(&self, key: u64) -> Option<(usize, usize)> {
        self.index.get(&key).map(|&slot| self.signals[slot].shape())
    }

    pub fn signal_values(&self, key: u64) -> Option<&[f64]> {
        self.index.get(&key).map(|&slot| self.signals[slot].read())
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn probes_mut(&mut self) -> &mut [Probe] {
        &mut self.probes
    }
}
