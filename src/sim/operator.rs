//! Operators: the units of per-step work a chunk schedules in fixed order.
//!
//! A closed set of variants: the ordinary compute operators plus the three
//! communication operators. Each exposes one entry point, [`Operator::step`],
//! and touches only the buffers it was wired to at build time. The engine
//! guarantees nothing about what compute operators calculate, only the order
//! they run in.
//!
//! The communication trio implements the boundary-exchange contract:
//! `Send` and `Recv` issue non-blocking transfers and park the resulting
//! request in a chunk-owned slot; the paired `Wait` (scheduled earlier in
//! the step order) retires the previous step's request from the same slot.
//! An empty slot is the primed state, so a wait's first invocation and any
//! invocation without an intervening issue are no-ops.

use crate::comm::{Communicator, PendingRequest, Rank, Tag};
use crate::error::Error;
use crate::sim::signal::SignalBuffer;
use crate::Result;

/// Everything an operator may touch during one step.
pub struct StepContext<'a> {
    pub signals: &'a mut [SignalBuffer],
    pub requests: &'a mut [Option<PendingRequest>],
    pub comm: &'a dyn Communicator,
    pub dt: f64,
}

/// One scheduled unit of per-step work.
#[derive(Debug)]
pub enum Operator {
    Reset(Reset),
    Copy(CopyOp),
    DotInc(DotInc),
    ElementwiseInc(ElementwiseInc),
    Lif(Lif),
    LifRate(LifRate),
    RectifiedLinear(RectifiedLinear),
    Sigmoid(Sigmoid),
    Synapse(Synapse),
    Send(SendOp),
    Recv(RecvOp),
    Wait(WaitOp),
}

impl Operator {
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        match self {
            Operator::Reset(op) => op.step(ctx),
            Operator::Copy(op) => op.step(ctx),
            Operator::DotInc(op) => op.step(ctx),
            Operator::ElementwiseInc(op) => op.step(ctx),
            Operator::Lif(op) => op.step(ctx),
            Operator::LifRate(op) => op.step(ctx),
            Operator::RectifiedLinear(op) => op.step(ctx),
            Operator::Sigmoid(op) => op.step(ctx),
            Operator::Synapse(op) => op.step(ctx),
            Operator::Send(op) => op.step(ctx),
            Operator::Recv(op) => op.step(ctx),
            Operator::Wait(op) => op.step(ctx),
        }
    }
}

/// dst ← constant.
#[derive(Debug)]
pub struct Reset {
    dst: usize,
    value: f64,
}

impl Reset {
    pub fn new(dst: usize, value: f64) -> Self {
        Self { dst, value }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        ctx.signals[self.dst].values_mut().fill(self.value);
        Ok(())
    }
}

/// dst ← src.
#[derive(Debug)]
pub struct CopyOp {
    src: usize,
    dst: usize,
    scratch: Vec<f64>,
}

impl CopyOp {
    pub fn new(src: usize, dst: usize, len: usize) -> Self {
        Self { src, dst, scratch: vec![0.0; len] }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.scratch.copy_from_slice(ctx.signals[self.src].read());
        ctx.signals[self.dst].write(&self.scratch)
    }
}

/// y += A * x, with A an (m, n) buffer, x (n, 1), y (m, 1).
#[derive(Debug)]
pub struct DotInc {
    a: usize,
    x: usize,
    y: usize,
    acc: Vec<f64>,
}

impl DotInc {
    pub fn new(a: usize, x: usize, y: usize, rows: usize) -> Self {
        Self { a, x, y, acc: vec![0.0; rows] }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        {
            let a = ctx.signals[self.a].read();
            let x = ctx.signals[self.x].read();
            let cols = x.len();
            for (r, acc) in self.acc.iter_mut().enumerate() {
                let row = &a[r * cols..(r + 1) * cols];
                *acc = row.iter().zip(x).map(|(a, x)| a * x).sum();
            }
        }
        let y = ctx.signals[self.y].values_mut();
        for (y, acc) in y.iter_mut().zip(&self.acc) {
            *y += acc;
        }
        Ok(())
    }
}

/// y += a * x, element-wise; a scalar `a` broadcasts.
#[derive(Debug)]
pub struct ElementwiseInc {
    a: usize,
    x: usize,
    y: usize,
    acc: Vec<f64>,
}

impl ElementwiseInc {
    pub fn new(a: usize, x: usize, y: usize, len: usize) -> Self {
        Self { a, x, y, acc: vec![0.0; len] }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        {
            let a = ctx.signals[self.a].read();
            let x = ctx.signals[self.x].read();
            for (i, acc) in self.acc.iter_mut().enumerate() {
                let a = if a.len() == 1 { a[0] } else { a[i] };
                *acc = a * x[i];
            }
        }
        let y = ctx.signals[self.y].values_mut();
        for (y, acc) in y.iter_mut().zip(&self.acc) {
            *y += acc;
        }
        Ok(())
    }
}

/// Leaky integrate-and-fire neurons, spiking mode. Spikes are emitted as
/// 1/dt impulses; a fired neuron holds at zero for the refractory period.
#[derive(Debug)]
pub struct Lif {
    tau_rc: f64,
    tau_ref: f64,
    j: usize,
    out: usize,
    voltage: Vec<f64>,
    refractory: Vec<f64>,
    scratch: Vec<f64>,
}

impl Lif {
    pub fn new(tau_rc: f64, tau_ref: f64, j: usize, out: usize, n: usize) -> Self {
        Self {
            tau_rc,
            tau_ref,
            j,
            out,
            voltage: vec![0.0; n],
            refractory: vec![0.0; n],
            scratch: vec![0.0; n],
        }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let dt = ctx.dt;
        self.scratch.copy_from_slice(ctx.signals[self.j].read());
        let out = ctx.signals[self.out].values_mut();
        for i in 0..self.scratch.len() {
            out[i] = 0.0;
            if self.refractory[i] > 0.0 {
                self.refractory[i] -= dt;
                self.voltage[i] = 0.0;
                continue;
            }
            let v = &mut self.voltage[i];
            *v += (dt / self.tau_rc) * (self.scratch[i] - *v);
            if *v < 0.0 {
                *v = 0.0;
            } else if *v > 1.0 {
                out[i] = 1.0 / dt;
                *v = 0.0;
                self.refractory[i] = self.tau_ref;
            }
        }
        Ok(())
    }
}

/// Leaky integrate-and-fire neurons, rate mode.
#[derive(Debug)]
pub struct LifRate {
    tau_rc: f64,
    tau_ref: f64,
    j: usize,
    out: usize,
    scratch: Vec<f64>,
}

impl LifRate {
    pub fn new(tau_rc: f64, tau_ref: f64, j: usize, out: usize, n: usize) -> Self {
        Self { tau_rc, tau_ref, j, out, scratch: vec![0.0; n] }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.scratch.copy_from_slice(ctx.signals[self.j].read());
        let out = ctx.signals[self.out].values_mut();
        for (i, &j) in self.scratch.iter().enumerate() {
            out[i] = if j > 1.0 {
                1.0 / (self.tau_ref + self.tau_rc * (1.0 + 1.0 / (j - 1.0)).ln())
            } else {
                0.0
            };
        }
        Ok(())
    }
}

/// out = max(j, 0).
#[derive(Debug)]
pub struct RectifiedLinear {
    j: usize,
    out: usize,
    scratch: Vec<f64>,
}

impl RectifiedLinear {
    pub fn new(j: usize, out: usize, n: usize) -> Self {
        Self { j, out, scratch: vec![0.0; n] }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.scratch.copy_from_slice(ctx.signals[self.j].read());
        let out = ctx.signals[self.out].values_mut();
        for (i, &j) in self.scratch.iter().enumerate() {
            out[i] = j.max(0.0);
        }
        Ok(())
    }
}

/// out = 1 / (tau_ref * (1 + exp(-j))).
#[derive(Debug)]
pub struct Sigmoid {
    tau_ref: f64,
    j: usize,
    out: usize,
    scratch: Vec<f64>,
}

impl Sigmoid {
    pub fn new(tau_ref: f64, j: usize, out: usize, n: usize) -> Self {
        Self { tau_ref, j, out, scratch: vec![0.0; n] }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.scratch.copy_from_slice(ctx.signals[self.j].read());
        let out = ctx.signals[self.out].values_mut();
        for (i, &j) in self.scratch.iter().enumerate() {
            out[i] = 1.0 / (self.tau_ref * (1.0 + (-j).exp()));
        }
        Ok(())
    }
}

/// Discrete linear filter applied element-wise:
/// y[n] = sum(num[k] * x[n-k]) - sum(den[k] * y[n-1-k]), the denominator
/// normalized with its leading coefficient dropped.
#[derive(Debug)]
pub struct Synapse {
    input: usize,
    output: usize,
    num: Vec<f64>,
    den: Vec<f64>,
    x_hist: Vec<Vec<f64>>,
    y_hist: Vec<Vec<f64>>,
    scratch: Vec<f64>,
}

impl Synapse {
    pub fn new(input: usize, output: usize, num: Vec<f64>, den: Vec<f64>, n: usize) -> Self {
        Self {
            x_hist: vec![vec![0.0; num.len()]; n],
            y_hist: vec![vec![0.0; den.len()]; n],
            input,
            output,
            num,
            den,
            scratch: vec![0.0; n],
        }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.scratch.copy_from_slice(ctx.signals[self.input].read());
        let out = ctx.signals[self.output].values_mut();
        for i in 0..self.scratch.len() {
            let xh = &mut self.x_hist[i];
            if !xh.is_empty() {
                xh.rotate_right(1);
                xh[0] = self.scratch[i];
            }
            let yh = &self.y_hist[i];
            let mut y = 0.0;
            for (k, b) in self.num.iter().enumerate() {
                y += b * xh[k];
            }
            for (k, a) in self.den.iter().enumerate() {
                y -= a * yh[k];
            }
            let yh = &mut self.y_hist[i];
            if !yh.is_empty() {
                yh.rotate_right(1);
                yh[0] = y;
            }
            out[i] = y;
        }
        Ok(())
    }
}

/// Issues a non-blocking transmission of its buffer's current contents and
/// parks the request in the slot shared with its wait. Scheduled after the
/// operator that produces the buffer and after its wait.
#[derive(Debug)]
pub struct SendOp {
    dst: Rank,
    tag: Tag,
    signal: usize,
    slot: usize,
}

impl SendOp {
    pub fn new(dst: Rank, tag: Tag, signal: usize, slot: usize) -> Self {
        Self { dst, tag, signal, slot }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        debug_assert!(
            ctx.requests[self.slot].is_none(),
            "pair {} reissued before its wait retired the previous transfer",
            self.tag
        );
        let request = ctx.comm.isend(self.dst, self.tag, ctx.signals[self.signal].read())?;
        ctx.requests[self.slot] = Some(request);
        Ok(())
    }
}

/// Issues a non-blocking reception into its buffer, priming the next step's
/// data. Scheduled after every consumer of the buffer.
#[derive(Debug)]
pub struct RecvOp {
    src: Rank,
    tag: Tag,
    slot: usize,
}

impl RecvOp {
    pub fn new(src: Rank, tag: Tag, slot: usize) -> Self {
        Self { src, tag, slot }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        debug_assert!(
            ctx.requests[self.slot].is_none(),
            "pair {} reissued before its wait retired the previous transfer",
            self.tag
        );
        ctx.requests[self.slot] = Some(ctx.comm.irecv(self.src, self.tag)?);
        Ok(())
    }
}

/// Retires the outstanding request in its slot, blocking until it
/// completes; a receive's delivered values land in the target buffer here.
/// An empty slot (first step, or no issue since the last retirement) is a
/// no-op.
#[derive(Debug)]
pub struct WaitOp {
    tag: Tag,
    slot: usize,
    delivery: Option<usize>,
}

impl WaitOp {
    pub fn new(tag: Tag, slot: usize, delivery: Option<usize>) -> Self {
        Self { tag, slot, delivery }
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let Some(request) = ctx.requests[self.slot].take() else {
            return Ok(());
        };
        if let Some(values) = ctx.comm.wait(request)? {
            debug_assert!(self.delivery.is_some(), "send wait delivered values");
            if let Some(target) = self.delivery {
                let buffer = &mut ctx.signals[target];
                if values.len() != buffer.len() {
                    return Err(Error::PayloadShape {
                        tag: self.tag,
                        expected: buffer.len(),
                        found: values.len(),
                    });
                }
                buffer.write(&values)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::channel::mesh;
    use crate::model::SignalSpec;

    fn buffers(specs: &[SignalSpec]) -> Vec<SignalBuffer> {
        specs.iter().map(|s| SignalBuffer::from_spec(s).unwrap()).collect()
    }

    fn step_one(
        op: &mut Operator,
        signals: &mut [SignalBuffer],
        requests: &mut [Option<PendingRequest>],
        comm: &dyn Communicator,
        dt: f64,
    ) {
        let mut ctx = StepContext { signals, requests, comm, dt };
        op.step(&mut ctx).unwrap();
    }

    #[test]
    fn reset_fills() {
        let comms = mesh(1);
        let mut signals = buffers(&[SignalSpec::vector(1, "v", vec![3.0, 4.0])]);
        let mut op = Operator::Reset(Reset::new(0, 0.5));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        assert_eq!(signals[0].read(), &[0.5, 0.5]);
    }

    #[test]
    fn copy_moves_values() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::vector(1, "src", vec![1.0, 2.0]),
            SignalSpec::vector(2, "dst", vec![0.0, 0.0]),
        ]);
        let mut op = Operator::Copy(CopyOp::new(0, 1, 2));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        assert_eq!(signals[1].read(), &[1.0, 2.0]);
    }

    #[test]
    fn dot_inc_accumulates() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::matrix(1, "a", 2, 2, vec![1.0, 2.0, 3.0, 4.0]),
            SignalSpec::vector(2, "x", vec![1.0, 1.0]),
            SignalSpec::vector(3, "y", vec![10.0, 20.0]),
        ]);
        let mut op = Operator::DotInc(DotInc::new(0, 1, 2, 2));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        assert_eq!(signals[2].read(), &[13.0, 27.0]);
    }

    #[test]
    fn elementwise_inc_broadcasts_scalars() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::vector(1, "a", vec![2.0]),
            SignalSpec::vector(2, "x", vec![1.0, 2.0, 3.0]),
            SignalSpec::vector(3, "y", vec![0.0, 0.0, 1.0]),
        ]);
        let mut op = Operator::ElementwiseInc(ElementwiseInc::new(0, 1, 2, 3));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        assert_eq!(signals[2].read(), &[2.0, 4.0, 7.0]);
    }

    #[test]
    fn lif_spikes_under_constant_drive() {
        let comms = mesh(1);
        let dt = 0.001;
        let mut signals = buffers(&[
            SignalSpec::vector(1, "j", vec![10.0]),
            SignalSpec::vector(2, "out", vec![0.0]),
        ]);
        let mut op = Operator::Lif(Lif::new(0.02, 0.002, 0, 1, 1));
        let mut spikes = 0;
        for _ in 0..1000 {
            step_one(&mut op, &mut signals, &mut [], &comms[0], dt);
            if signals[1].read()[0] > 0.0 {
                assert_eq!(signals[1].read()[0], 1.0 / dt);
                spikes += 1;
            }
        }
        assert!(spikes > 10, "constant suprathreshold drive must spike, got {spikes}");
    }

    #[test]
    fn lif_is_silent_below_threshold() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::vector(1, "j", vec![0.5]),
            SignalSpec::vector(2, "out", vec![0.0]),
        ]);
        let mut op = Operator::Lif(Lif::new(0.02, 0.002, 0, 1, 1));
        for _ in 0..1000 {
            step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
            assert_eq!(signals[1].read()[0], 0.0);
        }
    }

    #[test]
    fn lif_rate_matches_closed_form() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::vector(1, "j", vec![2.0, 0.5]),
            SignalSpec::vector(2, "out", vec![0.0, 0.0]),
        ]);
        let (tau_rc, tau_ref) = (0.02, 0.002);
        let mut op = Operator::LifRate(LifRate::new(tau_rc, tau_ref, 0, 1, 2));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        let expected = 1.0 / (tau_ref + tau_rc * 2.0f64.ln());
        assert!((signals[1].read()[0] - expected).abs() < 1e-9);
        assert_eq!(signals[1].read()[1], 0.0);
    }

    #[test]
    fn rectified_linear_clamps() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::vector(1, "j", vec![-1.0, 2.0]),
            SignalSpec::vector(2, "out", vec![0.0, 0.0]),
        ]);
        let mut op = Operator::RectifiedLinear(RectifiedLinear::new(0, 1, 2));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        assert_eq!(signals[1].read(), &[0.0, 2.0]);
    }

    #[test]
    fn sigmoid_saturates() {
        let comms = mesh(1);
        let mut signals = buffers(&[
            SignalSpec::vector(1, "j", vec![0.0]),
            SignalSpec::vector(2, "out", vec![0.0]),
        ]);
        let mut op = Operator::Sigmoid(Sigmoid::new(0.002, 0, 1, 1));
        step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
        assert!((signals[1].read()[0] - 1.0 / (0.002 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn synapse_lowpass_converges() {
        let comms = mesh(1);
        // y[n] = 0.1 * x[n] + 0.9 * y[n-1]: a one-pole lowpass toward 1.0.
        let mut signals = buffers(&[
            SignalSpec::vector(1, "in", vec![1.0]),
            SignalSpec::vector(2, "out", vec![0.0]),
        ]);
        let mut op = Operator::Synapse(Synapse::new(0, 1, vec![0.1], vec![-0.9], 1));
        let mut last = 0.0;
        for _ in 0..100 {
            step_one(&mut op, &mut signals, &mut [], &comms[0], 0.001);
            let y = signals[1].read()[0];
            assert!(y > last, "lowpass output must rise monotonically");
            last = y;
        }
        assert!(last > 0.99 && last < 1.0);
    }

    #[test]
    fn send_recv_wait_one_step_pipeline() {
        let comms = mesh(2);
        let mut send_signals = buffers(&[SignalSpec::vector(1, "out", vec![7.0])]);
        let mut recv_signals = buffers(&[SignalSpec::vector(1, "in", vec![0.0])]);
        let mut send_requests = [None];
        let mut recv_requests = [None];

        let mut send = Operator::Send(SendOp::new(1, 20, 0, 0));
        let mut send_wait = Operator::Wait(WaitOp::new(20, 0, None));
        let mut recv = Operator::Recv(RecvOp::new(0, 20, 0));
        let mut recv_wait = Operator::Wait(WaitOp::new(20, 0, Some(0)));

        // Step 1: waits are primed no-ops; issue both halves.
        step_one(&mut send_wait, &mut send_signals, &mut send_requests, &comms[0], 0.001);
        step_one(&mut send, &mut send_signals, &mut send_requests, &comms[0], 0.001);
        step_one(&mut recv_wait, &mut recv_signals, &mut recv_requests, &comms[1], 0.001);
        assert_eq!(recv_signals[0].read(), &[0.0], "nothing delivered in step 1");
        step_one(&mut recv, &mut recv_signals, &mut recv_requests, &comms[1], 0.001);

        // Step 2: the waits retire step 1's transfers; delivery happens now.
        step_one(&mut send_wait, &mut send_signals, &mut send_requests, &comms[0], 0.001);
        step_one(&mut recv_wait, &mut recv_signals, &mut recv_requests, &comms[1], 0.001);
        assert_eq!(recv_signals[0].read(), &[7.0]);
    }

    #[test]
    fn wait_without_outstanding_request_is_a_noop() {
        let comms = mesh(2);
        let mut signals = buffers(&[SignalSpec::vector(1, "in", vec![0.0])]);
        let mut requests = [None];
        let mut wait = Operator::Wait(WaitOp::new(20, 0, Some(0)));
        // Never blocks, twice in a row, with no request ever issued.
        step_one(&mut wait, &mut signals, &mut requests, &comms[1], 0.001);
        step_one(&mut wait, &mut signals, &mut requests, &comms[1], 0.001);
        assert!(requests[0].is_none());
    }

    #[test]
    fn shape_mismatch_at_delivery_is_fatal() {
        let comms = mesh(2);
        comms[0].send(1, 20, &wire_values(&[1.0, 2.0])).unwrap();
        let mut signals = buffers(&[SignalSpec::vector(1, "in", vec![0.0])]);
        let mut requests = [Some(PendingRequest::Recv { src: 0, tag: 20 })];
        let mut wait = Operator::Wait(WaitOp::new(20, 0, Some(0)));
        let mut ctx = StepContext {
            signals: &mut signals,
            requests: &mut requests,
            comm: &comms[1],
            dt: 0.001,
        };
        assert!(matches!(
            wait.step(&mut ctx),
            Err(Error::PayloadShape { tag: 20, expected: 1, found: 2 })
        ));
    }

    fn wire_values(values: &[f64]) -> Vec<u8> {
        crate::comm::wire::encode_values(values)
    }
}
