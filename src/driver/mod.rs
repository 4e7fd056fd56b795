// src/driver/mod.rs
//
// =============================================================================
// ATOMFLOW: DRIVER CONTRACT & CHECKPOINT/RESTART PROTOCOL (v 0.1)
// =============================================================================
//
// Capability-interface redesign (§9): the teacher's `AbstractDriver` base
// class with virtual dispatch becomes a trait plus free functions shared by
// every concrete engine. Checkpoint numbering, the closed
// `saved_fnames`/`removed_fnames` sets, and segment stitching are grounded on
// GDPy's `driver.py::run/_verify_checkpoint/_save_checkpoint` and
// `asedriver.py::_irun/read_trajectory`.

pub mod abinitio;
pub mod classical;
pub mod mlip;

use crate::core::{DriverSetting, Frame, Structure, Trajectory};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub use abinitio::AbInitioDriver;
pub use classical::ClassicalDriver;
pub use mlip::MlipDriver;

const SYSTEM_CHANGE_TOL: f64 = 1e-15;

/// One computational engine, addressed through the task-agnostic surface the
/// Worker drives. `run` owns the full checkpoint/restart protocol for a
/// single `NNNN.run/` attempt; engines differ only in how a step is actually
/// executed and how a trajectory is read back.
#[async_trait]
pub trait CodeDriver: Send + Sync {
    /// Engine identifier used in `DriverFactory` lookups and log lines.
    fn name(&self) -> &'static str;

    /// Runs `setting` against `structure` inside `wdir`, returning the full
    /// trajectory produced (including any frames recovered from a prior
    /// checkpoint). Never panics on engine non-convergence; see
    /// `read_convergence`.
    async fn run(&self, wdir: &Path, structure: &Structure, setting: &DriverSetting) -> CoreResult<Trajectory>;

    /// Reads back the trajectory already on disk in `wdir` without running
    /// anything (used by `Worker::retrieve`).
    async fn read_trajectory(&self, wdir: &Path, setting: &DriverSetting) -> CoreResult<Trajectory>;

    /// Whether the engine's own convergence criterion was met on the last
    /// completed step. `false` is not an error (§7): a non-converged SCF
    /// step still returns its trajectory, annotated via `Frame::annotations`.
    fn read_convergence(&self, wdir: &Path) -> CoreResult<bool>;

    /// Filenames this engine writes that must survive a checkpoint rotation.
    fn saved_fnames(&self) -> &'static [&'static str];

    /// Filenames this engine writes that must be deleted before a restart
    /// (stale lock files, scratch space).
    fn removed_fnames(&self) -> &'static [&'static str];

    /// Whether `read_trajectory` re-emits the restart frame already present
    /// as the last frame of the previous segment. Engines that reload a full
    /// atomic state each step (classical/ab initio "sandwich" drivers)
    /// duplicate it; persistent daemons that resume in-memory do not.
    fn duplicates_boundary_frame(&self) -> bool;
}

/// Maps an engine name from `DriverSetting`/config to a constructed driver.
/// Replaces the teacher's `if/else` chain over driver type strings (§9: an
/// explicit map is easier to extend and to unit test than branching code).
pub struct DriverFactory;

impl DriverFactory {
    pub fn build(engine_name: &str, command: &str) -> CoreResult<Box<dyn CodeDriver>> {
        match engine_name {
            "lammps" | "classical" => Ok(Box::new(ClassicalDriver::new(command))),
            "vasp" | "cp2k" | "abinitio" => Ok(Box::new(AbInitioDriver::new(command))),
            "janus" | "mlip" | "deepmd" => Ok(Box::new(MlipDriver::new(command))),
            other => Err(CoreError::Configuration(format!(
                "unknown engine '{other}'"
            ))),
        }
    }
}

/// One numbered checkpoint directory, `NNNN.run` under the candidate's
/// working directory.
pub struct Checkpoint {
    pub index: u32,
    pub path: PathBuf,
}

/// Finds the highest-numbered `NNNN.run` directory under `wdir`, if any.
pub fn latest_checkpoint(wdir: &Path) -> CoreResult<Option<Checkpoint>> {
    let mut best: Option<Checkpoint> = None;
    if !wdir.exists() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(wdir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".run") {
            if let Ok(index) = stem.parse::<u32>() {
                let path = entry.path();
                if path.is_dir() && best.as_ref().map_or(true, |b| index > b.index) {
                    best = Some(Checkpoint { index, path });
                }
            }
        }
    }
    Ok(best)
}

/// Allocates the next checkpoint directory, creating it.
pub fn next_checkpoint(wdir: &Path) -> CoreResult<Checkpoint> {
    let index = latest_checkpoint(wdir)?.map(|c| c.index + 1).unwrap_or(0);
    let path = wdir.join(format!("{index:04}.run"));
    std::fs::create_dir_all(&path)?;
    Ok(Checkpoint { index, path })
}

/// Every `NNNN.run` checkpoint directory under `wdir`, in ascending order.
/// Used to reconstruct a full trajectory from outside a `run` call (e.g.
/// `Worker::retrieve`), where each checkpoint holds one segment's frames.
pub fn all_checkpoints(wdir: &Path) -> CoreResult<Vec<Checkpoint>> {
    let mut found = Vec::new();
    if !wdir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(wdir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".run") {
            if let Ok(index) = stem.parse::<u32>() {
                let path = entry.path();
                if path.is_dir() {
                    found.push(Checkpoint { index, path });
                }
            }
        }
    }
    found.sort_by_key(|c| c.index);
    Ok(found)
}

/// Moves `saved_fnames` out of `from` into the new checkpoint directory and
/// deletes `removed_fnames`, preparing a clean slate for the next step
/// while keeping everything needed to resume it.
pub fn rotate_checkpoint_files(
    from: &Path,
    to: &Path,
    saved_fnames: &[&'static str],
    removed_fnames: &[&'static str],
) -> CoreResult<()> {
    for fname in saved_fnames {
        let src = from.join(fname);
        if src.exists() {
            std::fs::rename(&src, to.join(fname))?;
        }
    }
    for fname in removed_fnames {
        let stale = from.join(fname);
        if stale.exists() {
            std::fs::remove_file(stale)?;
        }
    }
    Ok(())
}

/// True iff `candidate` differs from `previous` beyond floating-point noise
/// in cell, symbols, positions, or pbc — any of which invalidates a
/// checkpoint and forces a fresh run rather than a restart.
pub fn system_changed(previous: &Structure, candidate: &Structure) -> bool {
    if previous.symbols != candidate.symbols || previous.pbc != candidate.pbc {
        return true;
    }
    if previous.positions.len() != candidate.positions.len() {
        return true;
    }
    let cell_changed = previous
        .cell
        .iter()
        .zip(candidate.cell.iter())
        .flat_map(|(a, b)| a.iter().zip(b.iter()))
        .any(|(a, b)| (a - b).abs() > SYSTEM_CHANGE_TOL);
    if cell_changed {
        return true;
    }
    previous
        .positions
        .iter()
        .zip(candidate.positions.iter())
        .any(|(a, b)| {
            a.iter()
                .zip(b.iter())
                .any(|(x, y)| (x - y).abs() > SYSTEM_CHANGE_TOL)
        })
}

/// Stitches trajectory segments read from successive checkpoint directories,
/// dropping the duplicated boundary frame from every segment after the
/// first when the engine re-emits its restart frame (§4.2 step 6).
pub fn stitch_segments(segments: Vec<Vec<Frame>>, duplicates_boundary_frame: bool) -> Vec<Frame> {
    let mut out = Vec::new();
    for (i, mut segment) in segments.into_iter().enumerate() {
        if i > 0 && duplicates_boundary_frame && !segment.is_empty() {
            segment.remove(0);
        }
        out.append(&mut segment);
    }
    out
}

/// Asserts strictly increasing `annotations.step` across a stitched
/// trajectory (§8 invariant).
pub fn assert_monotonic_steps(frames: &[Frame]) -> CoreResult<()> {
    let mut last: Option<i64> = None;
    for frame in frames {
        if let Some(prev) = last {
            if frame.annotations.step <= prev {
                return Err(CoreError::StateConflict(format!(
                    "non-monotonic step: {} after {}",
                    frame.annotations.step, prev
                )));
            }
        }
        last = Some(frame.annotations.step);
    }
    Ok(())
}

/// The closed set of filenames a checkpoint rotation must account for;
/// used by tests and by drivers to validate their own constants don't drift.
pub fn validate_fname_sets(saved: &[&'static str], removed: &[&'static str]) -> bool {
    let saved_set: HashSet<&str> = saved.iter().copied().collect();
    let removed_set: HashSet<&str> = removed.iter().copied().collect();
    saved_set.is_disjoint(&removed_set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DriverSetting, FrameAnnotations, MinSettings, CommonSettings};
    use std::collections::HashMap;

    fn structure() -> Structure {
        Structure {
            cell: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
            pbc: [true, true, true],
            symbols: vec!["Pt".into()],
            positions: vec![[0.0, 0.0, 0.0]],
            velocities: None,
            tags: None,
            move_mask: vec![true],
            info: HashMap::new(),
        }
    }

    fn frame(step: i64) -> Frame {
        Frame {
            structure: structure(),
            energy: -1.0,
            forces: vec![[0.0, 0.0, 0.0]],
            stress: None,
            annotations: FrameAnnotations {
                step,
                wdir: "cand0".into(),
                fmax: None,
                time: None,
                error: None,
                deviation: Default::default(),
            },
        }
    }

    #[test]
    fn system_changed_detects_position_drift() {
        let a = structure();
        let mut b = structure();
        b.positions[0][0] += 1e-10;
        assert!(system_changed(&a, &b));

        let mut c = structure();
        c.positions[0][0] += 1e-16;
        assert!(!system_changed(&a, &c));
    }

    #[test]
    fn stitch_drops_duplicate_boundary_frame_when_requested() {
        let seg_a = vec![frame(0), frame(1)];
        let seg_b = vec![frame(1), frame(2)];
        let stitched = stitch_segments(vec![seg_a, seg_b], true);
        let steps: Vec<i64> = stitched.iter().map(|f| f.annotations.step).collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[test]
    fn stitch_keeps_all_frames_when_no_duplication() {
        let seg_a = vec![frame(0), frame(1)];
        let seg_b = vec![frame(2), frame(3)];
        let stitched = stitch_segments(vec![seg_a, seg_b], false);
        assert_eq!(stitched.len(), 4);
    }

    #[test]
    fn monotonic_check_rejects_repeats() {
        let frames = vec![frame(0), frame(0)];
        assert!(assert_monotonic_steps(&frames).is_err());
    }

    #[test]
    fn driver_factory_rejects_unknown_engine() {
        assert!(DriverFactory::build("nonexistent", "cmd").is_err());
    }

    #[allow(dead_code)]
    fn unused_setting() -> DriverSetting {
        DriverSetting::Min(MinSettings {
            common: CommonSettings {
                dump_period: 1,
                ckpt_period: 1,
                steps: 0,
                constraint: None,
                random_seed: None,
            },
            min_style: "bfgs".into(),
            fmax: 0.05,
            cell_filter: None,
            maxstep: None,
            ignore_convergence: false,
        })
    }
}
