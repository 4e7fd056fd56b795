// src/driver/abinitio.rs
//
// =============================================================================
// ATOMFLOW: AB INITIO DRIVER (v 0.1)
// =============================================================================
//
// MPI-aware "sandwich" driver, generalised from the teacher's
// `drivers/external.rs` (`ExternalKind::Vasp`/`Cp2k`): `mpirun -np {ranks}
// --cpu-set {cores} --bind-to cpu-list {binary}` on Linux, a bare binary on
// macOS (OpenMPI's strict binding crashes there). `rxn` settings translate
// to the NEB parameters GDPy's `reactor/vasp.py` writes into INCAR
// (`ibrion=3 potim=0 isif=2 ichain=0 iopt=1 spring=-5`), with `ediffg`
// derived from `fmax`.

use super::{
    all_checkpoints, assert_monotonic_steps, latest_checkpoint, next_checkpoint,
    rotate_checkpoint_files, stitch_segments, system_changed, CodeDriver,
};
use crate::core::{DriverSetting, Frame, Structure, Trajectory};
use crate::error::{CoreError, CoreResult};
use crate::resources::Sandbox;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const SAVED_FNAMES: &[&str] = &["INCAR", "POSCAR", "OUTCAR", "vasprun.xml", "WAVECAR"];
const REMOVED_FNAMES: &[&str] = &["CHG", "CHGCAR", ".lock"];

const MPI_SCRUB_VARS: &[&str] = &[
    "OMPI_COMM_WORLD_RANK",
    "OMPI_COMM_WORLD_SIZE",
    "PMIX_RANK",
    "PMIX_SERVER_URI",
    "PMIX_NAMESPACE",
    "SLURM_JOBID",
    "SLURM_PROCID",
    "SLURM_STEPID",
    "SLURM_GTIDS",
    "HYDRA_RANK",
];

pub struct AbInitioDriver {
    binary: String,
    ranks: usize,
}

impl AbInitioDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        AbInitioDriver {
            binary: binary.into(),
            ranks: 1,
        }
    }

    pub fn with_ranks(mut self, ranks: usize) -> Self {
        self.ranks = ranks;
        self
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

    fn build_command(&self, sandbox: Option<&Sandbox>) -> (String, Vec<String>) {
        let binary = self.resolve_binary();
        let is_macos = std::env::consts::OS == "macos";

        if self.ranks > 1 {
            let mut args = vec!["-np".to_string(), self.ranks.to_string()];
            if !is_macos {
                if let Some(sandbox) = sandbox {
                    if !sandbox.cores.is_empty() {
                        args.push("--cpu-set".to_string());
                        args.push(
                            sandbox
                                .cores
                                .iter()
                                .map(usize::to_string)
                                .collect::<Vec<_>>()
                                .join(","),
                        );
                        args.push("--bind-to".to_string());
                        args.push("cpu-list".to_string());
                    }
                }
            }
            args.push(binary);
            ("mpirun".to_string(), args)
        } else {
            (binary, Vec::new())
        }
    }

    /// NEB INCAR parameters GDPy's `reactor/vasp.py` fixes for a climbing
    /// image chain, derived from `RxnSettings`.
    fn neb_incar_overrides(setting: &DriverSetting) -> serde_json::Value {
        match setting {
            DriverSetting::Rxn(rxn) => serde_json::json!({
                "ibrion": 3,
                "potim": 0,
                "isif": 2,
                "ichain": 0,
                "lclimb": rxn.climb,
                "images": rxn.nimages.saturating_sub(2),
                "iopt": 1,
                "spring": -rxn.spring_constant.abs(),
                "ediffg": -rxn.fmax.abs(),
            }),
            _ => serde_json::Value::Null,
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
            "incar_overrides": Self::neb_incar_overrides(setting),
        });
        tokio::fs::write(ckpt_dir.join("POSCAR.json"), serde_json::to_vec_pretty(&input)?).await?;

        let (prog, args) = self.build_command(None);
        let mut cmd = Command::new(&prog);
        cmd.args(&args)
            .current_dir(ckpt_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in MPI_SCRUB_VARS {
            cmd.env_remove(var);
        }

        let child = cmd
            .spawn()
            .map_err(|e| CoreError::DriverStartup(format!("spawning ab initio engine: {e}")))?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            log::warn!(
                "ab initio engine exited {:?}, stderr: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let frame_path = ckpt_dir.join("frame.json");
        let bytes = tokio::fs::read(&frame_path)
            .await
            .map_err(|_| CoreError::TrajectoryEmpty)?;
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
impl CodeDriver for AbInitioDriver {
    fn name(&self) -> &'static str {
        "abinitio"
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
            let non_converged = frame.annotations.error.is_some();
            this_segment.push(frame);
            if setting.is_single_point() || non_converged {
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
        // GDPy's `_verify_checkpoint` globs for `*vasprun.xml`; we check the
        // same marker rather than parsing the XML, the adapter already did.
        Ok(wdir.join("vasprun.xml").exists() && wdir.join("converged").exists())
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
    use crate::core::{CommonSettings, RxnSettings};

    fn rxn_setting(nimages: usize, climb: bool, spring: f64) -> DriverSetting {
        DriverSetting::Rxn(RxnSettings {
            common: CommonSettings {
                dump_period: 1,
                ckpt_period: 1,
                steps: 100,
                constraint: None,
                random_seed: None,
            },
            nimages,
            climb,
            spring_constant: spring,
            fmax: 0.05,
        })
    }

    #[test]
    fn neb_overrides_match_fixed_vasp_conventions() {
        let setting = rxn_setting(7, true, 5.0);
        let overrides = AbInitioDriver::neb_incar_overrides(&setting);
        assert_eq!(overrides["ibrion"], 3);
        assert_eq!(overrides["potim"], 0);
        assert_eq!(overrides["isif"], 2);
        assert_eq!(overrides["ichain"], 0);
        assert_eq!(overrides["iopt"], 1);
        assert_eq!(overrides["spring"], -5.0);
        assert_eq!(overrides["images"], 5);
        assert_eq!(overrides["lclimb"], true);
    }

    #[test]
    fn build_command_wraps_multi_rank_with_mpirun() {
        let driver = AbInitioDriver::new("vasp_std").with_ranks(4);
        let (prog, args) = driver.build_command(None);
        assert_eq!(prog, "mpirun");
        assert!(args.contains(&"-np".to_string()));
        assert!(args.contains(&"4".to_string()));
    }

    #[test]
    fn build_command_skips_mpirun_for_single_rank() {
        let driver = AbInitioDriver::new("vasp_gam");
        let (prog, _) = driver.build_command(None);
        assert_eq!(prog, "vasp_gam");
    }
}
