// src/store.rs
//
// =============================================================================
// ATOMFLOW: INPUT STRUCTURE STORE (v 0.1)
// =============================================================================
//
// Content-addressed store for input structure batches. Grounded on the
// teacher's `ArtifactStore::commit` (hash -> scratch file -> atomic rename,
// fsync for Lustre/GPFS durability) but keyed by MD5 over the canonical
// Extended-XYZ serialisation (the batch's `stru_id`), not SHA256, and with a
// flat (non-sharded) layout: `_data/{stru_id}.xyz`.

use crate::core::Structure;
use crate::error::CoreResult;
use crate::structure_io;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub struct InputStructureStore {
    root: PathBuf,
}

/// One row of the `{stru_id}_info.txt` side table.
#[derive(Debug, Clone)]
pub struct InfoRow {
    pub global_id: usize,
    /// Caller-provided integer tag; -1 if absent.
    pub confid: i64,
    pub step: i64,
    pub wdir: String,
}

impl InputStructureStore {
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let root = dir.as_ref().join("_data");
        fs::create_dir_all(&root)?;
        Ok(InputStructureStore { root })
    }

    fn xyz_path(&self, stru_id: &str) -> PathBuf {
        self.root.join(format!("{stru_id}.xyz"))
    }

    fn info_path(&self, stru_id: &str) -> PathBuf {
        self.root.join(format!("{stru_id}_info.txt"))
    }

    fn inp_json_path(&self, stru_id: &str) -> PathBuf {
        self.root.join(format!("inp-{stru_id}.json"))
    }

    /// Canonicalises the batch (strips `info`), writes a scratch XYZ, hashes
    /// it, and renames into place. If `{stru_id}.xyz` already exists it is
    /// kept untouched (write-once, §3 invariant).
    pub fn commit_batch(&self, structures: &[Structure]) -> CoreResult<String> {
        let canonical: Vec<Structure> = structures.iter().map(Structure::canonicalize).collect();

        let mut buf = Vec::new();
        structure_io::write_batch(&mut buf, &canonical)?;
        let digest = md5::compute(&buf);
        let stru_id = format!("{digest:x}");

        let final_path = self.xyz_path(&stru_id);
        if !final_path.exists() {
            let tmp_path = self.root.join(format!(".{stru_id}.xyz.tmp"));
            {
                let mut tmp = File::create(&tmp_path)?;
                tmp.write_all(&buf)?;
                tmp.sync_all()?;
            }
            if fs::rename(&tmp_path, &final_path).is_err() {
                fs::copy(&tmp_path, &final_path)?;
                fs::remove_file(&tmp_path)?;
            }
            if let Ok(dir) = File::open(&self.root) {
                let _ = dir.sync_all();
            }
        }

        Ok(stru_id)
    }

    /// Contiguous global id for the next rows to be appended to this
    /// `stru_id`'s info table (one count of non-header, non-blank lines).
    pub fn next_global_id(&self, stru_id: &str) -> CoreResult<usize> {
        let path = self.info_path(stru_id);
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut count = 0usize;
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Appends rows to `{stru_id}_info.txt`, writing the `#`-prefixed header
    /// once if the file is new.
    pub fn append_info(&self, stru_id: &str, rows: &[InfoRow]) -> CoreResult<()> {
        let path = self.info_path(stru_id);
        let is_new = !path.exists();
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        if is_new {
            writeln!(f, "# id MD5 confid step wdir")?;
        }
        for row in rows {
            writeln!(
                f,
                "{} {} {} {} {}",
                row.global_id, stru_id, row.confid, row.step, row.wdir
            )?;
        }
        Ok(())
    }

    /// Writes `inp-{stru_id}.json`, the full run spec kept for human review.
    pub fn write_inp_json(&self, stru_id: &str, spec: &Value) -> CoreResult<()> {
        let path = self.inp_json_path(stru_id);
        let bytes = serde_json::to_vec_pretty(spec)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn batch_path(&self, stru_id: &str) -> PathBuf {
        self.xyz_path(stru_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Structure;
    use std::collections::HashMap;

    fn sample() -> Structure {
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

    #[test]
    fn content_hash_is_stable_across_info_churn() {
        let dir = tempfile::tempdir().unwrap();
        let store = InputStructureStore::open(dir.path()).unwrap();

        let mut s1 = sample();
        s1.info.insert("confid".into(), serde_json::Value::from(1));
        let mut s2 = sample();
        s2.info.insert("noise".into(), serde_json::Value::from("x"));

        let id1 = store.commit_batch(&[s1]).unwrap();
        let id2 = store.commit_batch(&[s2]).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn global_id_is_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let store = InputStructureStore::open(dir.path()).unwrap();
        let stru_id = store.commit_batch(&[sample()]).unwrap();

        assert_eq!(store.next_global_id(&stru_id).unwrap(), 0);
        store
            .append_info(
                &stru_id,
                &[InfoRow {
                    global_id: 0,
                    confid: -1,
                    step: 0,
                    wdir: "cand0".into(),
                }],
            )
            .unwrap();
        assert_eq!(store.next_global_id(&stru_id).unwrap(), 1);
    }
}
