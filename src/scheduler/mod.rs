// src/scheduler/mod.rs
//
// =============================================================================
// ATOMFLOW: SCHEDULER CONTRACT (v 0.1)
// =============================================================================
//
// Abstraction over "run this batch somewhere": a local process or an HPC
// batch queue. The Worker never assumes ordering between submissions and
// must tolerate an unreliable `is_finished` (transient query errors count as
// "still running", never as "failed").

pub mod local;
pub mod queue;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use local::LocalScheduler;
pub use queue::QueueScheduler;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// The JobDatabase file for this scheduler kind is `_{kind}_jobs.json`.
    fn kind(&self) -> &'static str;

    /// Materialises the job description to disk.
    async fn write(&self, script_path: &Path, job_name: &str, user_command: &str) -> Result<()>;

    /// Enqueues a job; returns a scheduler-defined identifier.
    async fn submit(&self, script_path: &Path) -> Result<String>;

    /// True iff the job is no longer queued/running (success or failure
    /// alike). Must tolerate transient query errors by reporting `false`.
    async fn is_finished(&self, job_name: &str) -> Result<bool>;

    /// Best-effort cancellation: delete the script, ask the native queue to
    /// drop the job. Never called by the Worker automatically (§5: no
    /// first-class cancellation primitive).
    async fn cancel(&self, job_name: &str) -> Result<()>;
}
