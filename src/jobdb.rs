// src/jobdb.rs
//
// =============================================================================
// ATOMFLOW: JOB DATABASE (v 0.1)
// =============================================================================
//
// A document store keyed by `batch_id`, persisted as one JSON file per
// scheduler kind (`_{scheduler}_jobs.json`). Grounded on the teacher's
// CheckpointStore API shape (open/insert/search-by-predicate), re-expressed
// over a flat JSON map instead of rusqlite because the on-disk contract
// fixes the format. Concurrent writers within one process serialise on an
// `fs2` exclusive lock over the backing file (§5).

use crate::core::BatchRecord;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

pub struct JobDatabase {
    path: PathBuf,
}

impl JobDatabase {
    /// `dir` is the Worker's root directory; `scheduler_kind` is e.g.
    /// `"local"` or `"queue"`, producing `_{scheduler_kind}_jobs.json`.
    pub fn open(dir: impl AsRef<Path>, scheduler_kind: &str) -> CoreResult<Self> {
        let path = dir.as_ref().join(format!("_{scheduler_kind}_jobs.json"));
        if !path.exists() {
            fs::write(&path, b"{}\n")?;
        }
        Ok(JobDatabase { path })
    }

    /// Acquires an exclusive lock, loads the document map, hands it to `f`,
    /// writes the (possibly mutated) result back, then releases the lock.
    fn with_locked<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut HashMap<String, BatchRecord>) -> CoreResult<T>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive().map_err(CoreError::Io)?;

        let result = (|| {
            let bytes = fs::read(&self.path)?;
            let mut docs: HashMap<String, BatchRecord> = if bytes.is_empty() {
                HashMap::new()
            } else {
                serde_json::from_slice(&bytes).unwrap_or_default()
            };
            let out = f(&mut docs)?;
            let serialized = serde_json::to_vec_pretty(&docs)?;
            fs::write(&self.path, serialized)?;
            Ok(out)
        })();

        let _ = FileExt::unlock(&file);
        result
    }

    pub fn insert(&self, record: BatchRecord) -> CoreResult<()> {
        self.with_locked(|docs| {
            docs.insert(record.batch_id.clone(), record);
            Ok(())
        })
    }

    pub fn update<F>(&self, batch_id: &str, mutate: F) -> CoreResult<bool>
    where
        F: FnOnce(&mut BatchRecord),
    {
        self.with_locked(|docs| {
            Ok(if let Some(rec) = docs.get_mut(batch_id) {
                mutate(rec);
                true
            } else {
                false
            })
        })
    }

    pub fn find_by_batch_id(&self, batch_id: &str) -> CoreResult<Option<BatchRecord>> {
        self.with_locked(|docs| Ok(docs.get(batch_id).cloned()))
    }

    /// A `queued` record for this `stru_id`/batch index already exists
    /// (used by `submit`'s idempotency check, §4.3.3).
    pub fn find_queued_for(
        &self,
        stru_id: &str,
        batch_index: usize,
    ) -> CoreResult<Option<BatchRecord>> {
        let suffix = format!("-group-{batch_index}");
        self.with_locked(|docs| {
            Ok(docs
                .values()
                .find(|r| r.stru_id == stru_id && r.batch_id.ends_with(&suffix))
                .cloned())
        })
    }

    pub fn search_queued_unfinished(&self) -> CoreResult<Vec<BatchRecord>> {
        self.with_locked(|docs| {
            Ok(docs
                .values()
                .filter(|r| r.queued && !r.finished)
                .cloned()
                .collect())
        })
    }

    pub fn search_finished(&self, include_retrieved: bool) -> CoreResult<Vec<BatchRecord>> {
        self.with_locked(|docs| {
            Ok(docs
                .values()
                .filter(|r| r.finished && (include_retrieved || !r.retrieved))
                .cloned()
                .collect())
        })
    }

    pub fn all(&self) -> CoreResult<Vec<BatchRecord>> {
        self.with_locked(|docs| Ok(docs.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rec(stru_id: &str, idx: usize, wdirs: &[&str]) -> BatchRecord {
        BatchRecord::new(
            Uuid::now_v1(&[0, 1, 2, 3, 4, 5]),
            stru_id.to_string(),
            format!("abc-group-{idx}"),
            wdirs.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = JobDatabase::open(dir.path(), "local").unwrap();
        let r = rec("abc123", 0, &["cand0", "cand1"]);
        db.insert(r.clone()).unwrap();

        let found = db.find_by_batch_id(&r.batch_id).unwrap().unwrap();
        assert_eq!(found.stru_id, "abc123");
        assert!(found.queued);
        assert!(!found.finished);
    }

    #[test]
    fn idempotent_submit_is_detectable() {
        let dir = tempfile::tempdir().unwrap();
        let db = JobDatabase::open(dir.path(), "local").unwrap();
        db.insert(rec("abc123", 0, &["cand0"])).unwrap();

        assert!(db.find_queued_for("abc123", 0).unwrap().is_some());
        assert!(db.find_queued_for("abc123", 1).unwrap().is_none());
    }

    #[test]
    fn monotonic_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let db = JobDatabase::open(dir.path(), "local").unwrap();
        let r = rec("abc123", 0, &["cand0"]);
        db.insert(r.clone()).unwrap();

        db.update(&r.batch_id, |rec| rec.mark_finished()).unwrap();
        let reloaded = db.find_by_batch_id(&r.batch_id).unwrap().unwrap();
        assert!(reloaded.finished && !reloaded.retrieved);

        db.update(&r.batch_id, |rec| rec.mark_retrieved()).unwrap();
        let reloaded = db.find_by_batch_id(&r.batch_id).unwrap().unwrap();
        assert!(reloaded.finished && reloaded.retrieved);
    }
}
