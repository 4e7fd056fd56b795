// src/core.rs
//
// =============================================================================
// ATOMFLOW: CORE DATA MODEL (v 0.1)
// =============================================================================
//
// The "Esperanto" of the orchestrator: Structure, DriverSetting, Trajectory
// and BatchRecord. Every other module speaks these types, never a raw
// engine-specific representation.
//
// Design Principles:
// 1. Tagged records over string-typed discriminators (task, md_style).
// 2. `info`/`extras` side channels for unknown keys instead of a free-form
//    dict living on the hot-path type.
// 3. Equality that matches the physics, not the bytes (tolerance-based,
//    `info` excluded).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// 1. STRUCTURE (one atomic configuration)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    pub cell: [[f64; 3]; 3],
    pub pbc: [bool; 3],
    pub symbols: Vec<String>,
    pub positions: Vec<[f64; 3]>,
    #[serde(default)]
    pub velocities: Option<Vec<[f64; 3]>>,
    #[serde(default)]
    pub tags: Option<Vec<i32>>,
    /// Per-atom mobility mask: `true` means the atom is free to move.
    pub move_mask: Vec<bool>,
    /// Free-form metadata. Excluded from equality and from the canonical
    /// batch representation (see `canonicalize`).
    #[serde(default)]
    pub info: HashMap<String, Value>,
}

const EQ_TOL: f64 = 1e-8;

impl Structure {
    pub fn natoms(&self) -> usize {
        self.symbols.len()
    }

    /// Strips `info`, the side channel that makes two otherwise-identical
    /// structures hash differently. Used by the content-addressed store.
    pub fn canonicalize(&self) -> Structure {
        Structure {
            cell: self.cell,
            pbc: self.pbc,
            symbols: self.symbols.clone(),
            positions: self.positions.clone(),
            velocities: self.velocities.clone(),
            tags: self.tags.clone(),
            move_mask: self.move_mask.clone(),
            info: HashMap::new(),
        }
    }
}

impl PartialEq for Structure {
    fn eq(&self, other: &Self) -> bool {
        if self.symbols != other.symbols || self.pbc != other.pbc {
            return false;
        }
        if self.positions.len() != other.positions.len() {
            return false;
        }
        let cell_close = self
            .cell
            .iter()
            .zip(other.cell.iter())
            .all(|(a, b)| a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < EQ_TOL));
        if !cell_close {
            return false;
        }
        self.positions.iter().zip(other.positions.iter()).all(|(a, b)| {
            a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < EQ_TOL)
        })
    }
}

// ============================================================================
// 2. DRIVER SETTING (tagged by task)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonSettings {
    /// Steps between trajectory frames being dumped.
    pub dump_period: usize,
    /// Steps between checkpoint saves.
    pub ckpt_period: usize,
    pub steps: usize,
    /// Index-range text, LAMMPS-style 1-based or explicit 0-based.
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub random_seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MdStyle {
    Nve,
    Nvt,
    Npt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub min_style: String,
    /// Force-convergence threshold, eV/Å.
    pub fmax: f64,
    #[serde(default)]
    pub cell_filter: Option<String>,
    /// Max displacement per optimiser step, Å (GDPy `asedriver.py`).
    #[serde(default)]
    pub maxstep: Option<f64>,
    /// When set, a finished step budget always counts as converged,
    /// regardless of `fmax` (fixed-step relaxations; GDPy `asedriver.py`).
    #[serde(default)]
    pub ignore_convergence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub md_style: MdStyle,
    /// fs.
    pub timestep: f64,
    /// K.
    pub temp: f64,
    /// fs.
    pub tdamp: f64,
    /// bar.
    pub press: f64,
    /// fs.
    pub pdamp: f64,
    /// Ramped-ensemble end set points (GDPy `asedriver.py`); `None` means
    /// hold `temp`/`press` constant.
    #[serde(default)]
    pub tend: Option<f64>,
    #[serde(default)]
    pub pend: Option<f64>,
    #[serde(default)]
    pub velocity_seed: Option<u64>,
    #[serde(default)]
    pub ignore_atoms_velocities: bool,
    #[serde(default)]
    pub remove_rotation: bool,
    #[serde(default)]
    pub remove_translation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxnSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub nimages: usize,
    pub climb: bool,
    pub spring_constant: f64,
    /// Force-convergence threshold, eV/Å (drives `ediffg = -fmax` in VASP's
    /// NEB INCAR).
    pub fmax: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpcSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum DriverSetting {
    Min(MinSettings),
    Md(MdSettings),
    Rxn(RxnSettings),
    Spc(SpcSettings),
}

impl DriverSetting {
    pub fn task_name(&self) -> &'static str {
        match self {
            DriverSetting::Min(_) => "min",
            DriverSetting::Md(_) => "md",
            DriverSetting::Rxn(_) => "rxn",
            DriverSetting::Spc(_) => "spc",
        }
    }

    pub fn common(&self) -> &CommonSettings {
        match self {
            DriverSetting::Min(s) => &s.common,
            DriverSetting::Md(s) => &s.common,
            DriverSetting::Rxn(s) => &s.common,
            DriverSetting::Spc(s) => &s.common,
        }
    }

    pub fn steps(&self) -> usize {
        self.common().steps
    }

    /// `min` with `steps == 0` is a single-point evaluation: run the engine
    /// exactly once, no geometry updates, no restart checkpointing (§4.6).
    pub fn is_single_point(&self) -> bool {
        matches!(self, DriverSetting::Spc(_))
            || matches!(self, DriverSetting::Min(s) if s.common.steps == 0)
    }

    /// Parses loose JSON parameters into a validated DriverSetting,
    /// enforcing the resolution rules: reject unknown tasks, enforce
    /// per-task required keys via the target struct's own deserialization.
    pub fn from_value(value: Value) -> Result<DriverSetting, crate::error::CoreError> {
        let task = value
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| crate::error::CoreError::Configuration("missing 'task' field".into()))?
            .to_string();

        match task.as_str() {
            "min" | "md" | "rxn" | "spc" => {}
            other => {
                return Err(crate::error::CoreError::Configuration(format!(
                    "UnknownTask: '{other}'"
                )))
            }
        }

        serde_json::from_value(value)
            .map_err(|e| crate::error::CoreError::Configuration(format!("{task}: {e}")))
    }
}

// ============================================================================
// 3. TRAJECTORY
// ============================================================================

/// The closed set of per-frame deviation keys (committee uncertainty).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devi_te: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_devi_v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_devi_v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_devi_v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_devi_f: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_devi_f: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_devi_f: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_devi_ae: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_devi_ae: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_devi_ae: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devi_f: Option<Vec<f64>>,
}

impl DeviationInfo {
    pub fn is_empty(&self) -> bool {
        *self == DeviationInfo::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameAnnotations {
    pub step: i64,
    pub wdir: String,
    #[serde(default)]
    pub fmax: Option<f64>,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, flatten)]
    pub deviation: DeviationInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub structure: Structure,
    pub energy: f64,
    pub forces: Vec<[f64; 3]>,
    #[serde(default)]
    pub stress: Option<[[f64; 3]; 3]>,
    pub annotations: FrameAnnotations,
}

impl Frame {
    pub fn max_force(&self) -> f64 {
        self.forces
            .iter()
            .map(|f| (f[0] * f[0] + f[1] * f[1] + f[2] * f[2]).sqrt())
            .fold(0.0_f64, f64::max)
    }
}

/// Ordered sequence of frames produced by one Driver run, carrying the
/// setting that produced it so consumers can recover `task`, `timestep`, etc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub frames: Vec<Frame>,
    pub setting: DriverSetting,
}

impl Trajectory {
    pub fn empty(setting: DriverSetting) -> Self {
        Trajectory {
            frames: Vec::new(),
            setting,
        }
    }

    pub fn last(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// ============================================================================
// 4. BATCH RECORD (one row in the JobDatabase)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// UUIDv1 (time-based) assigned at submission.
    pub uid: Uuid,
    /// Content hash of the input structure batch.
    pub stru_id: String,
    /// `"{uid}-group-{k}"`.
    pub batch_id: String,
    /// Identifier the scheduler itself returned from `submit` (a local
    /// script stem, or a queue job id); this, not `batch_id`, is what
    /// `Scheduler::is_finished`/`cancel` are queried with.
    #[serde(default)]
    pub job_id: String,
    /// Wall-clock time of the initial submission, for operator-facing job
    /// listings; untouched by resubmission.
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
    /// Ordered per-structure working-directory names (`cand{global_index}`).
    pub wdir_names: Vec<String>,

    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub retrieved: bool,

    /// Resubmission attempts so far; bounded by `scheduler::queue`.
    #[serde(default)]
    pub resubmit_count: u32,

    /// Readers must tolerate extra fields (§6).
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl BatchRecord {
    pub fn new(uid: Uuid, stru_id: String, batch_id: String, wdir_names: Vec<String>) -> Self {
        BatchRecord {
            uid,
            stru_id,
            batch_id,
            job_id: String::new(),
            submitted_at: Utc::now(),
            wdir_names,
            queued: true,
            finished: false,
            retrieved: false,
            resubmit_count: 0,
            extra: HashMap::new(),
        }
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn mark_retrieved(&mut self) {
        self.retrieved = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pos_noise: f64, with_info: bool) -> Structure {
        let mut info = HashMap::new();
        if with_info {
            info.insert("confid".to_string(), Value::from(42));
        }
        Structure {
            cell: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
            pbc: [true, true, true],
            symbols: vec!["Pt".into(), "Pt".into()],
            positions: vec![[0.0, 0.0, 0.0], [1.0 + pos_noise, 0.0, 0.0]],
            velocities: None,
            tags: None,
            move_mask: vec![true, true],
            info,
        }
    }

    #[test]
    fn equality_ignores_info() {
        let a = sample(0.0, false);
        let b = sample(0.0, true);
        assert_eq!(a, b);
    }

    #[test]
    fn equality_respects_tolerance() {
        let a = sample(0.0, false);
        let b = sample(1e-9, false);
        let c = sample(1e-6, false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn driver_setting_rejects_unknown_task() {
        let v = serde_json::json!({"task": "bogus"});
        let err = DriverSetting::from_value(v).unwrap_err();
        assert!(matches!(err, crate::error::CoreError::Configuration(_)));
    }

    #[test]
    fn driver_setting_md_requires_timestep() {
        let v = serde_json::json!({
            "task": "md",
            "dump_period": 1, "ckpt_period": 1, "steps": 10,
            "md_style": "nvt", "temp": 300.0, "tdamp": 100.0,
            "press": 1.0, "pdamp": 1000.0
            // timestep missing
        });
        assert!(DriverSetting::from_value(v).is_err());
    }

    #[test]
    fn single_point_detection() {
        let min = DriverSetting::Min(MinSettings {
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
        });
        assert!(min.is_single_point());
    }
}
