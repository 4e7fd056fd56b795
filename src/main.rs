// src/main.rs
//
// =============================================================================
// ATOMFLOW: COMMANDER & ENTRY POINT (v 0.1)
// =============================================================================
//
// The CLI surface is deliberately small: `compute` drives a batch through
// submit -> poll -> retrieve against a Worker, and `run-candidate` is the
// internal entrypoint scheduler-written scripts invoke (one process per
// scheduled job, local or queued) to actually run the driver. A user never
// calls `run-candidate` directly.

use anyhow::{Context, Result};
use atomflow::core::DriverSetting;
use atomflow::scheduler::{LocalScheduler, QueueScheduler};
use atomflow::worker::{Candidate, Worker};
use atomflow::{CodeDriver, DriverFactory, Scheduler};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "atomflow", about = "HPC orchestrator for atomistic simulation campaigns")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a campaign for the structures in `STRUCTURE` to completion.
    Compute {
        /// Extended-XYZ file (or, inside a Worker root, a `stru_id` key) of
        /// input structures.
        structure: PathBuf,
        /// Candidates per scheduler job; defaults to one job per candidate.
        #[arg(long)]
        batch: Option<usize>,
        /// Whether to print only the last frame or the full trajectory per
        /// candidate.
        #[arg(long, value_enum, default_value = "last")]
        output: OutputMode,
        /// Worker root directory; defaults to the current directory.
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Use the HPC queue scheduler instead of running locally.
        #[arg(long)]
        queue: bool,
    },
    /// Internal: executes the candidates listed in `INDEX` sequentially.
    /// Invoked by scheduler-written scripts, never directly by a user.
    RunCandidate { index: PathBuf },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputMode {
    Last,
    Traj,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let exit_ok = match cli.command {
        Commands::Compute {
            structure,
            batch,
            output,
            root,
            queue,
        } => run_compute(&structure, batch, output, &root, queue).await?,
        Commands::RunCandidate { index } => {
            run_candidates(&index).await?;
            true
        }
    };

    if exit_ok {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_compute(
    structure_path: &PathBuf,
    batch: Option<usize>,
    output: OutputMode,
    root: &PathBuf,
    queue: bool,
) -> Result<bool> {
    let scheduler: Arc<dyn Scheduler> = if queue {
        Arc::new(QueueScheduler::new("sbatch", "squeue -h -j {job_id}", "scancel {job_id}"))
    } else {
        Arc::new(LocalScheduler::new())
    };

    let worker = Worker::open(root, scheduler).context("opening Worker root")?;

    let file = std::fs::File::open(structure_path)
        .with_context(|| format!("opening {structure_path:?}"))?;
    let structures = atomflow::structure_io::read_frames(std::io::BufReader::new(file), None)
        .context("parsing input structures")?;

    let potentials = vec![atomflow::worker::PotentialSpec {
        engine: "lammps".to_string(),
        command: "lmp_mpi".to_string(),
    }];
    let settings = vec![default_min_setting()];

    let (stru_id, candidates) = worker.plan_batch(&structures, &potentials, &settings)?;
    if candidates.is_empty() {
        return Ok(true);
    }

    let pending: std::collections::HashSet<String> = worker
        .submit(&stru_id, &candidates, batch.unwrap_or(1))
        .await
        .context("submitting batch")?
        .into_iter()
        .collect();

    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut all_ok = true;
    while seen.len() < pending.len() {
        worker.inspect(true).await.context("polling scheduler")?;
        let retrieved = worker.retrieve(false).await.context("retrieving results")?;
        for (batch_id, results) in retrieved {
            for (wdir, result) in results {
                match result {
                    Ok(trajectory) => {
                        all_ok &= print_result(&batch_id, &wdir, &trajectory, output);
                    }
                    Err(e) => {
                        log::error!("{batch_id}/{wdir} failed: {e}");
                        all_ok = false;
                    }
                }
            }
            seen.insert(batch_id);
        }
        if seen.len() < pending.len() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    Ok(all_ok)
}

fn print_result(
    batch_id: &str,
    wdir: &str,
    trajectory: &atomflow::Trajectory,
    output: OutputMode,
) -> bool {
    let converged = trajectory.last().map(|f| f.annotations.error.is_none()).unwrap_or(false);
    match output {
        OutputMode::Last => {
            if let Some(frame) = trajectory.last() {
                println!(
                    "{batch_id}/{wdir}: energy={:.6} max_force={:.6}",
                    frame.energy,
                    frame.max_force()
                );
            }
        }
        OutputMode::Traj => {
            for frame in &trajectory.frames {
                println!(
                    "{batch_id}/{wdir} step={} energy={:.6}",
                    frame.annotations.step, frame.energy
                );
            }
        }
    }
    converged
}

fn default_min_setting() -> DriverSetting {
    use atomflow::core::{CommonSettings, MinSettings};
    DriverSetting::Min(MinSettings {
        common: CommonSettings {
            dump_period: 1,
            ckpt_period: 1,
            steps: 200,
            constraint: None,
            random_seed: None,
        },
        min_style: "bfgs".to_string(),
        fmax: 0.05,
        cell_filter: None,
        maxstep: None,
        ignore_convergence: false,
    })
}

/// Runs every candidate in `index` (a serialized `Vec<Candidate>`)
/// sequentially; one process per scheduler job, so there is no benefit to
/// intra-job concurrency beyond what each driver already does internally.
async fn run_candidates(index: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(index).with_context(|| format!("reading {index:?}"))?;
    let candidates: Vec<Candidate> = serde_json::from_slice(&bytes)?;
    let dir = index.parent().unwrap_or_else(|| std::path::Path::new("."));

    for candidate in candidates {
        let cand_dir = dir.join(&candidate.wdir);
        let structure: atomflow::Structure =
            serde_json::from_slice(&std::fs::read(cand_dir.join("structure.json"))?)?;
        let setting: DriverSetting =
            serde_json::from_slice(&std::fs::read(cand_dir.join("setting.json"))?)?;

        let driver: Box<dyn CodeDriver> =
            DriverFactory::build(&candidate.potential.engine, &candidate.potential.command)?;

        match driver.run(&cand_dir, &structure, &setting).await {
            Ok(_) => log::info!("{} finished", candidate.wdir),
            Err(e) => log::error!("{} failed: {e}", candidate.wdir),
        }
    }
    Ok(())
}
