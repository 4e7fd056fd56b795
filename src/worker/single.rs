// src/worker/single.rs
//
// =============================================================================
// ATOMFLOW: SINGLE WORKER (COMPACT MODE) (v 0.1)
// =============================================================================
//
// Collapses an entire batch into one `_shared/` working directory instead of
// one directory per candidate: every structure runs sequentially through the
// same driver instance, and each converged final frame is appended to
// `_shared/cached.xyz`, tagged by `wdir` in its comment line. `inspect`
// completeness is then a set-difference between the expected `wdir_names`
// and the wdirs actually present in `cached.xyz`, rather than a per-candidate
// scheduler poll. Grounded on GDPy `drive.py`'s "compact" driving mode used
// for large screening batches where one directory per candidate would
// exhaust inode quotas on shared HPC filesystems.

use crate::core::{DriverSetting, Frame, Structure};
use crate::driver::CodeDriver;
use crate::error::{CoreError, CoreResult};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct SingleWorker {
    shared_dir: PathBuf,
    driver: Box<dyn CodeDriver>,
}

impl SingleWorker {
    pub fn open(root: impl AsRef<Path>, driver: Box<dyn CodeDriver>) -> CoreResult<Self> {
        let shared_dir = root.as_ref().join("_shared");
        std::fs::create_dir_all(&shared_dir)?;
        Ok(SingleWorker { shared_dir, driver })
    }

    fn cached_path(&self) -> PathBuf {
        self.shared_dir.join("cached.xyz")
    }

    /// Runs every `(wdir, structure)` pair sequentially through the shared
    /// driver/working directory, appending each run's last frame to
    /// `cached.xyz`. A structure whose `wdir` already appears in the cache
    /// is skipped (resuming a partially completed compact batch).
    pub async fn run_all(
        &self,
        pairs: &[(String, Structure)],
        setting: &DriverSetting,
    ) -> CoreResult<Vec<CoreResult<Frame>>> {
        let already_done = self.completed_wdirs()?;
        let mut results = Vec::with_capacity(pairs.len());

        for (wdir, structure) in pairs {
            if already_done.contains(wdir) {
                continue;
            }
            let trajectory = self.driver.run(&self.shared_dir, structure, setting).await;
            match trajectory {
                Ok(traj) => {
                    if let Some(last) = traj.last() {
                        self.append_cached(wdir, last)?;
                        results.push(Ok(last.clone()));
                    } else {
                        results.push(Err(CoreError::TrajectoryEmpty));
                    }
                }
                Err(e) => results.push(Err(e)),
            }
        }
        Ok(results)
    }

    fn append_cached(&self, wdir: &str, frame: &Frame) -> CoreResult<()> {
        let mut structure = frame.structure.clone();
        structure.info.insert(
            "wdir".to_string(),
            serde_json::Value::String(wdir.to_string()),
        );
        structure.info.insert(
            "energy".to_string(),
            serde_json::json!(frame.energy),
        );

        let mut buf = Vec::new();
        crate::structure_io::write_frame(&mut buf, &structure)?;

        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cached_path())?;
        f.write_all(&buf)?;
        Ok(())
    }

    fn completed_wdirs(&self) -> CoreResult<HashSet<String>> {
        let path = self.cached_path();
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let file = std::fs::File::open(&path)?;
        let frames = crate::structure_io::read_frames(std::io::BufReader::new(file), None)?;
        Ok(frames
            .into_iter()
            .filter_map(|s| s.info.get("wdir").and_then(|v| v.as_str().map(str::to_string)))
            .collect())
    }

    /// True once every name in `expected_wdirs` has a cached frame.
    pub fn is_complete(&self, expected_wdirs: &[String]) -> CoreResult<bool> {
        let done = self.completed_wdirs()?;
        Ok(expected_wdirs.iter().all(|w| done.contains(w)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviationInfo, FrameAnnotations};
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

    fn frame() -> Frame {
        Frame {
            structure: structure(),
            energy: -1.23,
            forces: vec![[0.0, 0.0, 0.0]],
            stress: None,
            annotations: FrameAnnotations {
                step: 0,
                wdir: "cand0".into(),
                fmax: None,
                time: None,
                error: None,
                deviation: DeviationInfo::default(),
            },
        }
    }

    #[test]
    fn completeness_check_is_a_set_difference() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("_shared");
        std::fs::create_dir_all(&shared).unwrap();

        let mut structure = frame().structure;
        structure
            .info
            .insert("wdir".to_string(), serde_json::Value::String("cand0".into()));
        let mut buf = Vec::new();
        crate::structure_io::write_frame(&mut buf, &structure).unwrap();
        std::fs::write(shared.join("cached.xyz"), buf).unwrap();

        let worker = SingleWorker {
            shared_dir: shared,
            driver: Box::new(crate::driver::ClassicalDriver::new("lmp_mpi")),
        };
        assert!(worker.is_complete(&["cand0".to_string()]).unwrap());
        assert!(!worker.is_complete(&["cand0".to_string(), "cand1".to_string()]).unwrap());
    }
}
