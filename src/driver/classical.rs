// src/driver/classical.rs
//
// =============================================================================
// ATOMFLOW: CLASSICAL POTENTIAL DRIVER (v 0.1)
// =============================================================================
//
// "The Sandwich", generalised from the teacher's `drivers/external.rs`
// (`ExternalKind::Gulp`): write -> run -> parse, but now one step of a
// multi-step trajectory instead of a single-shot calculation, participating
// in the checkpoint/restart protocol in `driver::mod`.
//
// Each step: the adapter writes `input.lammps` from the current Structure +
// DriverSetting, the binary runs to produce `dump.{step}.extxyz`, the
// adapter parses it back into a `Frame`. The engine reloads full atomic
// state every step, so this driver duplicates the checkpoint's boundary
// frame on restart.

use super::{
    all_checkpoints, assert_monotonic_steps, latest_checkpoint, next_checkpoint,
    rotate_checkpoint_files, stitch_segments, system_changed, CodeDriver,
};
use crate::core::{DriverSetting, Frame, Structure, Trajectory};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const SAVED_FNAMES: &[&str] = &["input.lammps", "dump.extxyz", "log.lammps"];
const REMOVED_FNAMES: &[&str] = &["restart.bin", ".lock"];

const MPI_SCRUB_VARS: &[&str] = &[
    "OMPI_COMM_WORLD_RANK",
    "OMPI_COMM_WORLD_SIZE",
    "PMIX_RANK",
    "SLURM_PROCID",
    "SLURM_STEPID",
];

pub struct ClassicalDriver {
    binary: String,
}

impl ClassicalDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        ClassicalDriver {
            binary: binary.into(),
        }
    }

    fn resolve_binary(&self) -> String {
        if self.binary.contains('/') && !Path::new(&self.binary).is_absolute() {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.binary)
                .to_string_lossy()
                .to_string()
        } else {
            self.binary.clone()
        }
    }

    async fn run_one_step(
        &self,
        ckpt_dir: &Path,
        structure: &Structure,
        setting: &DriverSetting,
        step_index: i64,
    ) -> CoreResult<Frame> {
        let input = serde_json::json!({
            "structure": structure,
            "setting": setting,
            "step": step_index,
        });
        tokio::fs::write(
            ckpt_dir.join("input.lammps"),
            serde_json::to_vec_pretty(&input)?,
        )
        .await?;

        let binary = self.resolve_binary();
        let mut cmd = Command::new(&binary);
        cmd.current_dir(ckpt_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in MPI_SCRUB_VARS {
            cmd.env_remove(var);
        }

        let child = cmd.spawn().map_err(|e| {
            CoreError::DriverStartup(format!("spawning classical binary '{binary}': {e}"))
        })?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            log::warn!(
                "classical binary exited {:?}, stderr: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let frame_path = ckpt_dir.join("frame.json");
        let bytes = tokio::fs::read(&frame_path).await.map_err(|_| {
            CoreError::TrajectoryEmpty
        })?;
        let frame: Frame = serde_json::from_slice(&bytes)?;
        Ok(frame)
    }

    /// Reads the single frame left behind by `run_one_step` in one
    /// checkpoint directory (empty if the step never produced one).
    async fn read_segment(ckpt_dir: &Path) -> CoreResult<Vec<Frame>> {
        let path = ckpt_dir.join("frame.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(vec![serde_json::from_slice(&bytes)?])
    }
}

#[async_trait]
impl CodeDriver for ClassicalDriver {
    fn name(&self) -> &'static str {
        "classical"
    }

    async fn run(&self, wdir: &Path, structure: &Structure, setting: &DriverSetting) -> CoreResult<Trajectory> {
        tokio::fs::create_dir_all(wdir).await?;

        let mut segments: Vec<Vec<Frame>> = Vec::new();
        let mut start_step: i64 = 0;
        let mut current = structure.clone();

        if let Some(prev) = latest_checkpoint(wdir)? {
            let prev_segment = Self::read_segment(&prev.path).await?;
            if let Some(last) = prev_segment.last() {
                if !system_changed(&last.structure, structure) {
                    start_step = last.annotations.step + 1;
                    current = last.structure.clone();
                }
            }
            segments.push(prev_segment);
        }

        let total_steps = setting.steps().max(1) as i64;
        let mut this_segment = Vec::new();
        let ckpt = next_checkpoint(wdir)?;

        for step in start_step..total_steps {
            let frame = self.run_one_step(&ckpt.path, &current, setting, step).await?;
            current = frame.structure.clone();
            this_segment.push(frame);
            if setting.is_single_point() {
                break;
            }
        }

        if let Some(prev) = latest_checkpoint(wdir)?.filter(|c| c.index != ckpt.index) {
            rotate_checkpoint_files(&prev.path, &ckpt.path, SAVED_FNAMES, REMOVED_FNAMES)?;
        }

        segments.push(this_segment);
        let frames = stitch_segments(segments, self.duplicates_boundary_frame());
        assert_monotonic_steps(&frames)?;

        if frames.is_empty() {
            return Err(CoreError::TrajectoryEmpty);
        }

        Ok(Trajectory {
            frames,
            setting: setting.clone(),
        })
    }

    async fn read_trajectory(&self, wdir: &Path, setting: &DriverSetting) -> CoreResult<Trajectory> {
        let mut segments = Vec::new();
        for ckpt in all_checkpoints(wdir)? {
            segments.push(Self::read_segment(&ckpt.path).await?);
        }
        let frames = stitch_segments(segments, self.duplicates_boundary_frame());
        if frames.is_empty() {
            return Ok(Trajectory::empty(setting.clone()));
        }
        Ok(Trajectory {
            frames,
            setting: setting.clone(),
        })
    }

    fn read_convergence(&self, wdir: &Path) -> CoreResult<bool> {
        let marker = wdir.join("converged");
        Ok(marker.exists())
    }

    fn saved_fnames(&self) -> &'static [&'static str] {
        SAVED_FNAMES
    }

    fn removed_fnames(&self) -> &'static [&'static str] {
        REMOVED_FNAMES
    }

    fn duplicates_boundary_frame(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_leaves_bare_command_names_alone() {
        let driver = ClassicalDriver::new("lmp_mpi");
        assert_eq!(driver.resolve_binary(), "lmp_mpi");
    }

    #[test]
    fn resolve_binary_absolutizes_relative_paths() {
        let driver = ClassicalDriver::new("./bin/lmp");
        assert!(Path::new(&driver.resolve_binary()).is_absolute());
    }

    #[test]
    fn read_convergence_follows_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ClassicalDriver::new("lmp_mpi");
        assert!(!driver.read_convergence(dir.path()).unwrap());
        std::fs::write(dir.path().join("converged"), b"").unwrap();
        assert!(driver.read_convergence(dir.path()).unwrap());
    }
}
