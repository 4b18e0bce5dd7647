//! Runs one claimed job as a child process and writes the result back.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::LauncherConfig;
use crate::storage::{JobOutcome, JobResult, JobStore};

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    launcher: LauncherConfig,
    max_output: usize,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, launcher: LauncherConfig, max_output: usize) -> Self {
        Self {
            store,
            launcher,
            max_output,
        }
    }

    /// Execute job `id`: mark it running, spawn the launcher, capture output,
    /// write the final row. A storage error on the final write is logged and
    /// the job still counts as finished; reconciliation is external.
    pub async fn run(&self, id: u64) -> JobOutcome {
        if let Err(e) = self.store.mark_running(id).await {
            tracing::error!(job_id = id, error = %e, "failed to mark job running");
            let outcome = JobOutcome::failed(format!("storage error before launch: {e}"));
            self.write_back(id, &outcome).await;
            return outcome;
        }

        let outcome = self.launch(id).await;
        tracing::info!(
            job_id = id,
            result = outcome.result.as_str(),
            exit_code = ?outcome.code,
            signal = ?outcome.signal,
            "job finished"
        );
        self.write_back(id, &outcome).await;
        outcome
    }

    async fn write_back(&self, id: u64, outcome: &JobOutcome) {
        if let Err(e) = self.store.mark_done(id, outcome).await {
            tracing::error!(job_id = id, error = %e, "failed to write job result");
        }
    }

    async fn launch(&self, id: u64) -> JobOutcome {
        let cmdline = self.launcher.template.replace("{id}", &id.to_string());
        let mut parts = cmdline.split_whitespace();
        let Some(program) = parts.next() else {
            return JobOutcome::failed("empty launcher command");
        };

        let mut command = Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.launcher.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.launcher.env {
            command.env(key, value);
        }

        tracing::info!(job_id = id, command = %cmdline, "launching job");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return JobOutcome::failed(format!("failed to spawn launcher: {e}")),
        };

        // Both pipes are drained to EOF even past the cap, so the child never
        // blocks on a full pipe.
        let max = self.max_output;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, max));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, max));

        let waited = child.wait().await;
        let (stdout, stdout_overflow) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_overflow) = stderr_task.await.unwrap_or_default();

        let status = match waited {
            Ok(status) => status,
            Err(e) => return JobOutcome::failed(format!("failed to wait for launcher: {e}")),
        };
        if stdout_overflow || stderr_overflow {
            return JobOutcome::failed(format!("captured output exceeded {max} bytes"));
        }

        let code = status.code();
        JobOutcome {
            result: if code == Some(0) {
                JobResult::Ok
            } else {
                JobResult::Fail
            },
            code,
            signal: status.signal().map(signal_name),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }
}

/// Read a child stream to EOF, keeping at most `max` bytes. Returns the
/// captured bytes and whether the cap was exceeded.
async fn read_capped<R: AsyncRead + Unpin>(stream: Option<R>, max: usize) -> (Vec<u8>, bool) {
    let Some(mut stream) = stream else {
        return (Vec::new(), false);
    };
    let mut captured = Vec::new();
    let mut overflow = false;
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if captured.len() + n > max {
                    overflow = true;
                    let fit = max.saturating_sub(captured.len());
                    captured.extend_from_slice(&chunk[..fit]);
                } else {
                    captured.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
    (captured, overflow)
}

fn signal_name(raw: i32) -> String {
    match nix::sys::signal::Signal::try_from(raw) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {raw}"),
    }
}
