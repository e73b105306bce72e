use std::env;
use std::process::exit;

use synapse::sim::{run_worker, Simulator};
use synapse::PlanSpec;
use tracing::info;

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let (Some(plan_path), Some(steps)) = (args.next(), args.next()) else {
        eprintln!("usage: synapse <plan-file> <steps>");
        exit(2);
    };
    let steps: u64 = match steps.parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("steps must be an integer");
            exit(2);
        }
    };

    if let Err(e) = run(&plan_path, steps) {
        eprintln!("run failed: {e}");
        exit(1);
    }
}

/// Threads-as-ranks launch: every rank of the plan's world runs as a thread
/// of this process over the in-process mesh.
#[cfg(not(feature = "mpi"))]
fn run(plan_path: &str, steps: u64) -> synapse::Result<()> {
    use std::thread;
    use synapse::comm::{channel, Communicator};

    let plan = PlanSpec::from_file(plan_path)?;
    let merged = plan.merged();
    let mut comms = channel::mesh(plan.world_size());
    let coordinator_comm = comms.remove(0);

    let workers: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::Builder::new()
                .name(format!("rank-{}", comm.rank()))
                .spawn(move || run_worker(&comm))
                .expect("spawning a worker rank")
        })
        .collect();

    let mut sim = Simulator::from_plan(plan, Box::new(coordinator_comm), merged)?;
    sim.finalize_build()?;
    sim.run_n_steps(steps, true, true)?;
    let data = sim.gather_probe_data()?;
    let mut keys: Vec<_> = data.keys().copied().collect();
    keys.sort_unstable();
    for key in keys {
        let samples = &data[&key];
        let tail = samples.last().map(|s| format!("{s:?}")).unwrap_or_default();
        info!(probe = key, samples = samples.len(), last = %tail);
    }
    sim.close()?;

    for worker in workers {
        worker.join().expect("worker rank panicked")?;
    }
    Ok(())
}

/// MPI launch: dispatch on world rank under `mpirun`.
#[cfg(feature = "mpi")]
fn run(plan_path: &str, steps: u64) -> synapse::Result<()> {
    use synapse::comm::mpi::MpiCommunicator;
    use synapse::comm::{Communicator, COORDINATOR};

    let _universe = mpi::initialize().expect("MPI initialization");
    let comm = MpiCommunicator::new();

    if comm.rank() == COORDINATOR {
        let plan = PlanSpec::from_file(plan_path)?;
        let merged = plan.merged();
        let mut sim = Simulator::from_plan(plan, Box::new(comm), merged)?;
        sim.finalize_build()?;
        sim.run_n_steps(steps, true, true)?;
        let data = sim.gather_probe_data()?;
        info!(probes = data.len(), "gather complete");
        sim.close()?;
    } else {
        run_worker(&comm)?;
    }
    Ok(())
}
