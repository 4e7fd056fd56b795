// src/worker/mod.rs
//
// =============================================================================
// ATOMFLOW: WORKER (v 0.1)
// =============================================================================
//
// Orchestrates one campaign: content-addresses the input batch, plans
// candidates as the Cartesian product of potentials x driver settings,
// submits chunks of `batch_size` candidates as scheduler jobs, and retrieves
// finished trajectories. Grounded on GDPy `drive.py`'s `_prepare_batches`
// (wdir naming, uniqueness check) and its tinydb-backed submit/inspect/
// retrieve cycle, re-expressed against `jobdb::JobDatabase`.
//
// Candidate directories live under `_work/{batch_id}/cand{global_id}/` and
// carry everything a `run-candidate` invocation needs to reconstruct the
// driver call without talking back to the Worker: `structure.json`,
// `setting.json`, `potential.json`.

pub mod reactor;
pub mod single;

use crate::core::{BatchRecord, DriverSetting, Trajectory};
use crate::driver::DriverFactory;
use crate::error::{CoreError, CoreResult};
use crate::jobdb::JobDatabase;
use crate::scheduler::Scheduler;
use crate::store::InputStructureStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// One entry in a potential roster: an engine name plus the command used to
/// invoke it (binary path, daemon launch command, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PotentialSpec {
    pub engine: String,
    pub command: String,
}

/// One planned unit of work: a structure (by content hash + index into the
/// batch) crossed with one potential and one driver setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub global_id: usize,
    pub wdir: String,
    pub stru_id: String,
    pub structure_index: usize,
    pub potential: PotentialSpec,
    pub setting: DriverSetting,
}

pub struct Worker {
    root: PathBuf,
    store: InputStructureStore,
    jobdb: JobDatabase,
    scheduler: Arc<dyn Scheduler>,
    /// Held for the Worker's lifetime; never released explicitly, dropped
    /// (and thus unlocked) when the Worker goes out of scope.
    _lock_file: std::fs::File,
}

impl Worker {
    /// Opens (creating if needed) the Worker's root directory and takes an
    /// advisory exclusive lock on `.worker.lock`. Two Workers contending for
    /// the same directory is a `StateConflict`, not a silent race (Open
    /// Question, resolved in DESIGN.md): this only protects against two
    /// *processes*, the in-process JobDatabase lock in `jobdb.rs` already
    /// serialises concurrent tasks within one.
    pub fn open(root: impl AsRef<Path>, scheduler: Arc<dyn Scheduler>) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let lock_path = root.join(".worker.lock");
        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            CoreError::StateConflict(format!("{:?} is already locked by another Worker", lock_path))
        })?;

        let store = InputStructureStore::open(&root)?;
        let jobdb = JobDatabase::open(&root, scheduler.kind())?;
        Ok(Worker {
            root,
            store,
            jobdb,
            scheduler,
            _lock_file: lock_file,
        })
    }

    /// Commits `structures` to the content-addressed store and plans the
    /// Cartesian product against `potentials` x `settings`, naming each
    /// candidate `cand{global_id}` with a contiguous, store-wide id.
    /// Duplicate (potential, setting) pairs are a hard configuration error
    /// (§4.3.2): they would silently overwrite one another's wdir. Appends
    /// one `InfoRow` per candidate to `{stru_id}_info.txt` and refreshes
    /// `inp-{stru_id}.json` (§4.3.1 step 3, §6) so that `next_global_id`
    /// advances across successive calls against the same store.
    pub fn plan_batch(
        &self,
        structures: &[crate::core::Structure],
        potentials: &[PotentialSpec],
        settings: &[DriverSetting],
    ) -> CoreResult<(String, Vec<Candidate>)> {
        let mut seen = HashSet::new();
        for p in potentials {
            for s in settings {
                let key = (p.engine.clone(), p.command.clone(), s.task_name().to_string());
                if !seen.insert(key) {
                    return Err(CoreError::Configuration(format!(
                        "duplicate (potential={}, task={}) combination in batch plan",
                        p.engine,
                        s.task_name()
                    )));
                }
            }
        }

        let stru_id = self.store.commit_batch(structures)?;
        let mut next_id = self.store.next_global_id(&stru_id)?;

        let mut candidates = Vec::new();
        for (idx, _structure) in structures.iter().enumerate() {
            for potential in potentials {
                for setting in settings {
                    let global_id = next_id;
                    next_id += 1;
                    candidates.push(Candidate {
                        global_id,
                        wdir: format!("cand{global_id}"),
                        stru_id: stru_id.clone(),
                        structure_index: idx,
                        potential: potential.clone(),
                        setting: setting.clone(),
                    });
                }
            }
        }

        let rows: Vec<crate::store::InfoRow> = candidates
            .iter()
            .map(|c| crate::store::InfoRow {
                global_id: c.global_id,
                confid: -1,
                step: 0,
                wdir: c.wdir.clone(),
            })
            .collect();
        self.store.append_info(&stru_id, &rows)?;
        self.store.write_inp_json(
            &stru_id,
            &serde_json::json!({ "potentials": potentials, "settings": settings }),
        )?;

        Ok((stru_id, candidates))
    }

    fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.root.join("_work").join(batch_id)
    }

    fn find_script(dir: &Path) -> CoreResult<PathBuf> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("run-") && name.ends_with(".script") {
                return Ok(entry.path());
            }
        }
        Err(CoreError::Scheduler(format!("no job script found in {dir:?}")))
    }

    /// Submits `candidates` in chunks of `batch_size`, one scheduler job per
    /// chunk, idempotently: a chunk whose `(stru_id, batch_index)` is
    /// already queued is skipped rather than resubmitted (§4.3.3).
    pub async fn submit(
        &self,
        stru_id: &str,
        candidates: &[Candidate],
        batch_size: usize,
    ) -> CoreResult<Vec<String>> {
        let batch_size = batch_size.max(1);
        let uid = Uuid::now_v1(&[0, 1, 2, 3, 4, 5]);
        let mut batch_ids = Vec::new();

        for (chunk_index, chunk) in candidates.chunks(batch_size).enumerate() {
            if self
                .jobdb
                .find_queued_for(stru_id, chunk_index)?
                .is_some()
            {
                log::info!("batch {stru_id}-group-{chunk_index} already queued, skipping resubmit");
                continue;
            }

            let batch_id = format!("{uid}-group-{chunk_index}");
            let dir = self.batch_dir(&batch_id);
            std::fs::create_dir_all(&dir)?;

            for candidate in chunk {
                let cand_dir = dir.join(&candidate.wdir);
                std::fs::create_dir_all(&cand_dir)?;
                let structure = self.read_structure(&candidate.stru_id, candidate.structure_index)?;
                std::fs::write(cand_dir.join("structure.json"), serde_json::to_vec(&structure)?)?;
                std::fs::write(cand_dir.join("setting.json"), serde_json::to_vec(&candidate.setting)?)?;
                std::fs::write(
                    cand_dir.join("potential.json"),
                    serde_json::to_vec(&candidate.potential)?,
                )?;
            }

            let index_path = dir.join("index.json");
            std::fs::write(&index_path, serde_json::to_vec(chunk)?)?;

            let script_path = dir.join(format!("run-{uid}.script"));
            let user_command = format!(
                "atomflow run-candidate {}",
                index_path.to_string_lossy()
            );
            self.scheduler
                .write(&script_path, &batch_id, &user_command)
                .await
                .map_err(|e| CoreError::Scheduler(e.to_string()))?;
            let job_id = self
                .scheduler
                .submit(&script_path)
                .await
                .map_err(|e| CoreError::Scheduler(e.to_string()))?;

            let wdir_names = chunk.iter().map(|c| c.wdir.clone()).collect();
            let mut record = BatchRecord::new(uid, stru_id.to_string(), batch_id.clone(), wdir_names);
            record.job_id = job_id;
            self.jobdb.insert(record)?;
            batch_ids.push(batch_id);
        }

        Ok(batch_ids)
    }

    fn read_structure(&self, stru_id: &str, index: usize) -> CoreResult<crate::core::Structure> {
        let path = self.store.batch_path(stru_id);
        let file = std::fs::File::open(&path)?;
        let reader = std::io::BufReader::new(file);
        let frames = crate::structure_io::read_frames(reader, Some(index + 1))?;
        frames
            .into_iter()
            .nth(index)
            .ok_or(CoreError::TrajectoryEmpty)
    }

    /// Polls every queued-but-unfinished batch. When the scheduler reports a
    /// job is no longer running, validates that every `wdir_name` it promised
    /// actually materialised (§4.3.3); a batch whose job vanished without
    /// producing its directories is either left queued with a diagnostic
    /// (`resubmit=false`) or resubmitted against the same script, up to
    /// `scheduler::queue::MAX_RESUBMIT_ATTEMPTS`.
    pub async fn inspect(&self, resubmit: bool) -> CoreResult<Vec<String>> {
        let mut newly_finished = Vec::new();
        for record in self.jobdb.search_queued_unfinished()? {
            let done = self
                .scheduler
                .is_finished(&record.job_id)
                .await
                .unwrap_or(false);
            if !done {
                continue;
            }

            let dir = self.batch_dir(&record.batch_id);
            let all_present = record.wdir_names.iter().all(|w| dir.join(w).is_dir());

            if all_present {
                self.jobdb.update(&record.batch_id, |r| r.mark_finished())?;
                newly_finished.push(record.batch_id);
                continue;
            }

            log::warn!(
                "batch {} finished but {} wdirs missing",
                record.batch_id,
                record.wdir_names.iter().filter(|w| !dir.join(w).is_dir()).count()
            );

            if !resubmit || record.resubmit_count >= crate::scheduler::queue::MAX_RESUBMIT_ATTEMPTS {
                continue;
            }

            let script_path = match Self::find_script(&dir) {
                Ok(p) => p,
                Err(e) => {
                    log::error!("cannot resubmit {}: {e}", record.batch_id);
                    continue;
                }
            };
            match self.scheduler.submit(&script_path).await {
                Ok(job_id) => {
                    self.jobdb.update(&record.batch_id, |r| {
                        r.job_id = job_id.clone();
                        r.resubmit_count += 1;
                    })?;
                    log::info!("resubmitted batch {} (attempt {})", record.batch_id, record.resubmit_count + 1);
                }
                Err(e) => log::error!("resubmit of {} failed: {e}", record.batch_id),
            }
        }
        Ok(newly_finished)
    }

    /// Reads back every finished-but-unretrieved batch's trajectories
    /// concurrently (one task per candidate directory, §4.3.4) and marks
    /// each batch retrieved, whether or not every candidate converged.
    pub async fn retrieve(
        &self,
        include_retrieved: bool,
    ) -> CoreResult<Vec<(String, Vec<(String, CoreResult<Trajectory>)>)>> {
        let mut out = Vec::new();
        for record in self.jobdb.search_finished(include_retrieved)? {
            let dir = self.batch_dir(&record.batch_id);
            let index_path = dir.join("index.json");
            let candidates: Vec<Candidate> = if index_path.exists() {
                serde_json::from_slice(&std::fs::read(&index_path)?)?
            } else {
                Vec::new()
            };

            let mut tasks = Vec::new();
            for candidate in candidates {
                let cand_dir = dir.join(&candidate.wdir);
                let wdir_name = candidate.wdir.clone();
                tasks.push(tokio::spawn(async move {
                    let driver = DriverFactory::build(&candidate.potential.engine, &candidate.potential.command);
                    let result = match driver {
                        Ok(driver) => driver.read_trajectory(&cand_dir, &candidate.setting).await,
                        Err(e) => Err(e),
                    };
                    (wdir_name, result)
                }));
            }

            let mut results = Vec::new();
            for task in tasks {
                match task.await {
                    Ok(pair) => results.push(pair),
                    Err(e) => results.push(("<join-error>".to_string(), Err(CoreError::Configuration(e.to_string())))),
                }
            }

            self.jobdb.update(&record.batch_id, |r| r.mark_retrieved())?;
            out.push((record.batch_id, results));
        }
        Ok(out)
    }
}
