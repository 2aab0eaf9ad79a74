//! Per-job runner task: validate the job specification, spawn hashcat,
//! stream combined output as `status_update` envelopes.
//!
//! Updates are submitted to the target connection's bounded outbound
//! queue, never written to the transport directly — the single-writer
//! rule and the ordinary backpressure policy apply to job traffic exactly
//! as they do to relayed frames. A full queue throttles the job's
//! streaming task, not the relay.

use std::path::{Component, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinHandle;

use crate::job::JobTable;
use crate::protocol::{JobSpec, JobStatus, JobStatusUpdate};

/// Delivery target for a job's status updates: the owning connection's
/// outbound queue, scoped to its room.
#[derive(Debug, Clone)]
pub struct StatusSink {
    room_id: String,
    frame_tx: Sender<String>,
}

impl StatusSink {
    /// Build a sink for the given room and outbound queue.
    pub fn new(room_id: &str, frame_tx: Sender<String>) -> Self {
        Self {
            room_id: room_id.to_string(),
            frame_tx,
        }
    }

    /// Enqueue one status update. Delivery is best-effort: once the
    /// connection is gone the update is dropped.
    async fn send(&self, update: JobStatusUpdate) {
        let frame = update.into_envelope(&self.room_id).encode();
        if self.frame_tx.send(frame).await.is_err() {
            log::debug!("[Job] connection gone, dropping status update");
        }
    }
}

/// Spawn the runner task for one accepted attack request.
pub fn spawn(table: JobTable, spec: JobSpec, hashcat: PathBuf, sink: StatusSink) -> JoinHandle<()> {
    tokio::spawn(run(table, spec, hashcat, sink))
}

/// Validate, spawn, stream, report. Every failure terminates only this
/// job, as one `failed` update.
async fn run(table: JobTable, spec: JobSpec, hashcat: PathBuf, sink: StatusSink) {
    if !table.claim(&spec.job_id) {
        // Do not touch the table: the entry belongs to the job already
        // running under this id.
        log::warn!("[Job] {}: rejected, id already running", spec.job_id);
        sink.send(JobStatusUpdate {
            job_id: spec.job_id.clone(),
            status: JobStatus::Failed,
            output: None,
            error: Some(format!("job {:?} is already running", spec.job_id)),
        })
        .await;
        return;
    }

    let args = match build_args(&spec) {
        Ok(args) => args,
        Err(e) => {
            fail(&table, &sink, &spec.job_id, &format!("{e:#}"), None).await;
            return;
        }
    };

    log::info!(
        "[Job] {}: starting attack (-m {} -a {} {})",
        spec.job_id,
        spec.mode,
        spec.attack_mode,
        spec.file
    );

    let mut command = Command::new(&hashcat);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            fail(
                &table,
                &sink,
                &spec.job_id,
                &format!("failed to start {}: {e}", hashcat.display()),
                None,
            )
            .await;
            return;
        }
    };

    table.mark_running(&spec.job_id);

    // Merge stdout and stderr into one line stream, forwarded by two
    // small pump tasks. The channel closes when both pipes hit EOF.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut output = String::new();
    while let Some(line) = line_rx.recv().await {
        table.append_output(&spec.job_id, &line);
        output.push_str(&line);
        output.push('\n');
        sink.send(JobStatusUpdate {
            job_id: spec.job_id.clone(),
            status: JobStatus::Running,
            output: Some(line),
            error: None,
        })
        .await;
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            table.mark_completed(&spec.job_id);
            sink.send(JobStatusUpdate {
                job_id: spec.job_id.clone(),
                status: JobStatus::Completed,
                output: Some(output),
                error: None,
            })
            .await;
            log::info!("[Job] {}: completed", spec.job_id);
        }
        Ok(status) => {
            let error = format!("hashcat exited with {status}");
            fail(&table, &sink, &spec.job_id, &error, Some(output)).await;
        }
        Err(e) => {
            let error = format!("failed to wait for hashcat: {e}");
            fail(&table, &sink, &spec.job_id, &error, Some(output)).await;
        }
    }
}

/// Record and report a terminal failure for a claimed job.
async fn fail(table: &JobTable, sink: &StatusSink, job_id: &str, error: &str, output: Option<String>) {
    log::warn!("[Job] {job_id}: failed: {error}");
    table.mark_failed(job_id, error);
    sink.send(JobStatusUpdate {
        job_id: job_id.to_string(),
        status: JobStatus::Failed,
        output,
        error: Some(error.to_string()),
    })
    .await;
}

/// Pump one child pipe into the shared line channel.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, line_tx: Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("[Job] output stream error: {e}");
                break;
            }
        }
    }
}

/// Whether a selector is a syntactically valid numeric string.
fn numeric_selector(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Validate a caller-supplied path: non-empty, no parent-directory
/// traversal, resolves to an existing file.
fn checked_path(raw: &str, label: &str) -> Result<PathBuf> {
    if raw.is_empty() {
        bail!("{label} path is empty");
    }
    let path = PathBuf::from(raw);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("invalid {label} path {raw:?}: parent traversal is not allowed");
    }
    if !path.exists() {
        bail!("{label} not found: {raw}");
    }
    Ok(path)
}

/// Build the hashcat argument vector, rejecting anything that must not
/// reach a process spawn.
fn build_args(spec: &JobSpec) -> Result<Vec<String>> {
    if !numeric_selector(&spec.mode) {
        bail!("invalid hash mode selector: {:?}", spec.mode);
    }
    if !numeric_selector(&spec.attack_mode) {
        bail!("invalid attack mode selector: {:?}", spec.attack_mode);
    }

    let file = checked_path(&spec.file, "hash file")?;
    let mut args = vec![
        "-m".to_string(),
        spec.mode.clone(),
        "-a".to_string(),
        spec.attack_mode.clone(),
        file.display().to_string(),
    ];

    if let Some(wordlist) = spec.wordlist.as_deref().filter(|s| !s.is_empty()) {
        args.push(checked_path(wordlist, "wordlist")?.display().to_string());
    }
    if let Some(rules) = spec.rules.as_deref().filter(|s| !s.is_empty()) {
        args.push("-r".to_string());
        args.push(checked_path(rules, "rules file")?.display().to_string());
    }

    Ok(args)
}
