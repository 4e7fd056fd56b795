// src/scheduler/queue.rs
//
// =============================================================================
// ATOMFLOW: QUEUE SCHEDULER (v 0.1)
// =============================================================================
//
// Writes an HPC batch script (`run-{uid}.script`), submits it through an
// external submit command, and polls job state through an external query
// command. Both commands are configurable so the same code serves Slurm,
// PBS, or any queue that exposes a submit/query CLI (the teacher hard-codes
// neither; see `resources.rs::ClusterType` for the same split).
//
// `is_finished` treats a query failure as "still running", never "finished"
// (§4.1): a flaky `squeue`/`qstat` must not cause the Worker to retrieve a
// job that is, in fact, still queued.

use super::Scheduler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Resubmissions are capped; beyond this the Worker must surface the batch
/// as failed rather than loop forever against a broken queue (Open Question,
/// resolved in DESIGN.md).
pub const MAX_RESUBMIT_ATTEMPTS: u32 = 3;

pub struct QueueScheduler {
    /// e.g. `"sbatch"`.
    submit_cmd: String,
    /// e.g. `"squeue -h -j {job_id}"`; `{job_id}` is substituted.
    query_cmd: String,
    /// e.g. `"scancel {job_id}"`.
    cancel_cmd: String,
    /// Lines inserted verbatim after the shebang (`#SBATCH ...` etc.).
    resource_directives: Vec<String>,
}

impl QueueScheduler {
    pub fn new(submit_cmd: impl Into<String>, query_cmd: impl Into<String>, cancel_cmd: impl Into<String>) -> Self {
        QueueScheduler {
            submit_cmd: submit_cmd.into(),
            query_cmd: query_cmd.into(),
            cancel_cmd: cancel_cmd.into(),
            resource_directives: Vec::new(),
        }
    }

    pub fn with_directives(mut self, directives: Vec<String>) -> Self {
        self.resource_directives = directives;
        self
    }

    fn substitute(template: &str, job_id: &str) -> String {
        template.replace("{job_id}", job_id)
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    fn kind(&self) -> &'static str {
        "queue"
    }

    async fn write(&self, script_path: &Path, job_name: &str, user_command: &str) -> Result<()> {
        let mut content = String::from("#!/bin/sh\n");
        content.push_str(&format!("#JOBNAME {job_name}\n"));
        for d in &self.resource_directives {
            content.push_str(d);
            content.push('\n');
        }
        content.push_str(user_command);
        content.push('\n');
        tokio::fs::write(script_path, content)
            .await
            .with_context(|| format!("writing queue job script {:?}", script_path))?;
        Ok(())
    }

    async fn submit(&self, script_path: &Path) -> Result<String> {
        let mut parts = self.submit_cmd.split_whitespace();
        let prog = parts.next().context("empty submit_cmd")?;
        let output = Command::new(prog)
            .args(parts)
            .arg(script_path)
            .output()
            .await
            .with_context(|| format!("spawning submit command for {:?}", script_path))?;

        if !output.status.success() {
            anyhow::bail!(
                "submit command failed ({:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // Batch systems typically print the job id as the last whitespace
        // token or last line's trailing number; take the last token.
        let job_id = stdout
            .split_whitespace()
            .last()
            .map(str::to_string)
            .with_context(|| format!("no job id parsed from submit output: {stdout}"))?;
        Ok(job_id)
    }

    async fn is_finished(&self, job_name: &str) -> Result<bool> {
        // `job_name` here is the job id returned by `submit`.
        let template = Self::substitute(&self.query_cmd, job_name);
        let mut parts = template.split_whitespace();
        let prog = match parts.next() {
            Some(p) => p,
            None => return Ok(false),
        };
        let output = Command::new(prog).args(parts).output().await;

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                log::warn!("queue query for job {job_name} failed transiently: {e}; treating as still running");
                return Ok(false);
            }
        };

        if !output.status.success() {
            log::warn!(
                "queue query for job {job_name} exited {:?}; treating as still running",
                output.status.code()
            );
            return Ok(false);
        }

        // Empty output from a "list running/pending jobs" query means the
        // job is no longer in the queue, i.e. finished (success or failure).
        Ok(String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn cancel(&self, job_name: &str) -> Result<()> {
        let template = Self::substitute(&self.cancel_cmd, job_name);
        let mut parts = template.split_whitespace();
        let prog = match parts.next() {
            Some(p) => p,
            None => return Ok(()),
        };
        let _ = Command::new(prog).args(parts).output().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_job_id_placeholder() {
        let out = QueueScheduler::substitute("squeue -h -j {job_id}", "12345");
        assert_eq!(out, "squeue -h -j 12345");
    }
}
