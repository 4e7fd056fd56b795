// src/scheduler/local.rs
//
// =============================================================================
// ATOMFLOW: LOCAL SCHEDULER (v 0.1)
// =============================================================================
//
// Runs the user command synchronously in the caller's process, with
// Sandbox-based resource isolation (core/GPU bitmask, env var scrubbing)
// exactly as the teacher's `drivers.rs::utils::apply_sandbox` applies it.
// `is_finished` returns true the instant `submit` returns: the Worker does
// not distinguish a non-zero exit from silent failure here, it inspects
// trajectory content afterwards (§4.1).

use super::Scheduler;
use crate::resources::ResourceLedger;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;

pub struct LocalScheduler {
    ledger: Mutex<ResourceLedger>,
    /// job_name -> (finished, exit success). Populated synchronously by
    /// `submit`; `is_finished` only ever reads it back.
    finished: Mutex<HashMap<String, bool>>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        LocalScheduler {
            ledger: Mutex::new(ResourceLedger::detect()),
            finished: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn write(&self, script_path: &Path, job_name: &str, user_command: &str) -> Result<()> {
        // Kept for parity with the queue scheduler and for post-mortem
        // review; the local scheduler does not execute this file, it runs
        // `user_command` directly.
        let content = format!("#!/bin/sh\n# job: {job_name}\n{user_command}\n");
        tokio::fs::write(script_path, content)
            .await
            .with_context(|| format!("writing local job script {:?}", script_path))?;
        Ok(())
    }

    async fn submit(&self, script_path: &Path) -> Result<String> {
        let job_name = script_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "job".to_string());

        let command_line = tokio::fs::read_to_string(script_path)
            .await
            .with_context(|| format!("reading local job script {:?}", script_path))?;
        // The user command is the script's last non-empty, non-comment line.
        let user_command = command_line
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .unwrap_or_default()
            .to_string();

        let work_dir: PathBuf = script_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let sandbox = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.try_allocate(1, 0)
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&user_command).current_dir(&work_dir);
        if let Some(sandbox) = &sandbox {
            sandbox.apply(&mut cmd);
        }

        let status = cmd
            .status()
            .await
            .with_context(|| format!("spawning local command '{user_command}'"))?;

        if let Some(sandbox) = sandbox {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.free(&sandbox);
        }

        if !status.success() {
            log::warn!(
                "local job '{}' exited with {:?}; Worker will inspect trajectory content",
                job_name,
                status.code()
            );
        }

        self.finished
            .lock()
            .unwrap()
            .insert(job_name.clone(), true);
        Ok(job_name)
    }

    async fn is_finished(&self, job_name: &str) -> Result<bool> {
        Ok(self
            .finished
            .lock()
            .unwrap()
            .get(job_name)
            .copied()
            .unwrap_or(false))
    }

    async fn cancel(&self, job_name: &str) -> Result<()> {
        self.finished.lock().unwrap().remove(job_name);
        Ok(())
    }
}
