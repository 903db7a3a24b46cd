//! Reconciler: the per-row decision procedure. Implements every case in
//! `spec.md` §4.6, including the corrected use of the row's own job id (not
//! the original source's undefined `idx`) when an admin kill token is
//! observed during the `progress=1` recovery path (`spec.md` §9).

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::channel::{self, Reader};
use crate::errlog;
use crate::model::{JobId, JobRow, ProgressCode, WorkerToken};
use crate::paths::{signal_fifo_path, JobDir, SharedArea};
use crate::registry::{Registry, WorkerHandle};

pub struct ReconcileCtx<'a> {
    pub registry: &'a mut Registry,
    pub service_root: &'a Path,
    pub shared: &'a SharedArea,
    pub debug: bool,
    pub exe_path: &'a Path,
    pub error_log_prefix: &'a str,
}

/// Runs the reconciler for one row. Returns the progress value to write
/// back, or `None` when no write-back is needed (`spec.md` §4.6: "Write-back
/// is skipped whenever the reconciler decided no change").
pub fn reconcile(ctx: &mut ReconcileCtx, row: &JobRow) -> anyhow::Result<Option<ProgressCode>> {
    match row.progress {
        ProgressCode::Pending => reconcile_pending(ctx, row),
        ProgressCode::InProgress => reconcile_in_progress(ctx, row),
        ProgressCode::CancelRequested => reconcile_cancel_requested(ctx, row),
        _ => Ok(None),
    }
}

fn reconcile_pending(ctx: &mut ReconcileCtx, row: &JobRow) -> anyhow::Result<Option<ProgressCode>> {
    if ctx.registry.contains(row.id) {
        tracing::warn!(job_id = %row.id, "duplicate admission of an already-registered job");
        return Ok(Some(ProgressCode::InProgress));
    }
    admit_worker(ctx, row)?;
    Ok(Some(ProgressCode::InProgress))
}

fn reconcile_in_progress(
    ctx: &mut ReconcileCtx,
    row: &JobRow,
) -> anyhow::Result<Option<ProgressCode>> {
    let job_dir = JobDir::new(ctx.service_root, row.id);

    if !ctx.registry.contains(row.id) {
        // Supervisor restarted while this job was recorded as live.
        if job_dir.kill_token_present() {
            return Ok(Some(ProgressCode::Anomalous));
        }
        admit_worker(ctx, row)?;
        // The write for this tick is left to the worker's own progress:
        // spec.md §4.6 says "continue without writing back".
        return Ok(None);
    }

    if job_dir.kill_token_present() {
        kill_it_with_fire(ctx, row.id, &job_dir)?;
        return Ok(Some(ProgressCode::Anomalous));
    }

    let drained = {
        let handle = ctx.registry.get_mut(row.id).expect("checked contains above");
        handle.channel.drain_tokens()
    };

    let tokens = match drained {
        Ok(t) => t,
        Err(_) => {
            kill_it_with_fire(ctx, row.id, &job_dir)?;
            return Ok(Some(ProgressCode::Anomalous));
        }
    };

    if let Some(&last) = tokens.last() {
        ctx.registry.get_mut(row.id).unwrap().last_token = Some(last);
    }
    let last_token = ctx.registry.get_mut(row.id).unwrap().last_token;

    let still_alive = {
        let handle = ctx.registry.get_mut(row.id).unwrap();
        handle.child.try_wait()?.is_none()
    };

    if still_alive {
        if last_token == Some(WorkerToken::Exiting) {
            // Grace wait for the worker to actually exit.
            let deadline = Instant::now() + Duration::from_millis(500);
            let mut exited = None;
            while Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
                let handle = ctx.registry.get_mut(row.id).unwrap();
                if let Some(status) = handle.child.try_wait()? {
                    exited = Some(status);
                    break;
                }
            }
            return Ok(Some(match exited {
                None => {
                    kill_it_with_fire(ctx, row.id, &job_dir)?;
                    ProgressCode::Anomalous
                }
                Some(status) if status.success() => {
                    let code = classify_exit_flag(ctx, row.id)?;
                    teardown(ctx, row.id);
                    code
                }
                Some(_) => {
                    teardown(ctx, row.id);
                    ProgressCode::Failed
                }
            }));
        }
        // Still in progress: started/running/uploading, or channel empty.
        Ok(Some(ProgressCode::InProgress))
    } else {
        // Process already dead by the time we looked.
        let code = classify_dead_worker(ctx, row.id, last_token)?;
        teardown(ctx, row.id);
        Ok(Some(code))
    }
}

fn reconcile_cancel_requested(
    ctx: &mut ReconcileCtx,
    row: &JobRow,
) -> anyhow::Result<Option<ProgressCode>> {
    if !ctx.registry.contains(row.id) {
        return Ok(Some(ProgressCode::Cancelled));
    }

    let still_alive = {
        let handle = ctx.registry.get_mut(row.id).unwrap();
        handle.child.try_wait()?.is_none()
    };

    if still_alive {
        let pid = ctx.registry.get_mut(row.id).unwrap().child.id();
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).ok();

        let deadline = Instant::now() + Duration::from_millis(5_000);
        let mut reaped = false;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
            let handle = ctx.registry.get_mut(row.id).unwrap();
            if handle.child.try_wait()?.is_some() {
                reaped = true;
                break;
            }
        }
        if !reaped {
            errlog::warn(
                ctx.error_log_prefix,
                &format!("process BPAsim{} left zombified", row.id),
            );
        }
        teardown(ctx, row.id);
        Ok(Some(ProgressCode::Cancelled))
    } else {
        // A clean completion races cancellation and wins.
        let last_token = ctx.registry.get_mut(row.id).unwrap().last_token;
        let code = classify_dead_worker(ctx, row.id, last_token)?;
        teardown(ctx, row.id);
        Ok(Some(code))
    }
}

/// Reads the result flag after the worker's process has exited zero and
/// maps it to the done progress code, per the bit-for-bit preserved table
/// in `spec.md` §3. Absence or an out-of-range byte is a protocol
/// violation (`Anomalous`).
fn classify_exit_flag(ctx: &mut ReconcileCtx, id: JobId) -> anyhow::Result<ProgressCode> {
    let handle = ctx.registry.get_mut(id).unwrap();
    // The worker writes the flag before its process returns from the
    // publication block (spec.md §9), so it is guaranteed to be in the pipe
    // by the time exit is observed; a brief retry absorbs any residual
    // non-blocking-read race.
    for _ in 0..5 {
        match handle.channel.try_read_result_flag() {
            Ok(Some(flag)) => return Ok(flag.done_code()),
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(_) => return Ok(ProgressCode::Anomalous),
        }
    }
    Ok(ProgressCode::Anomalous)
}

/// Drains whatever remains in a now-dead worker's channel and classifies
/// the outcome, handling the case where tokens were buffered but never
/// drained while the process was still (apparently) alive.
fn classify_dead_worker(
    ctx: &mut ReconcileCtx,
    id: JobId,
    prior_last_token: Option<WorkerToken>,
) -> anyhow::Result<ProgressCode> {
    let handle = ctx.registry.get_mut(id).unwrap();
    let exit_status = handle.child.try_wait()?;

    let mut last_token = prior_last_token;
    if let Ok(tokens) = handle.channel.drain_tokens() {
        if let Some(&t) = tokens.last() {
            last_token = Some(t);
        }
    }

    let saw_exiting = last_token == Some(WorkerToken::Exiting);
    let exited_zero = exit_status.map(|s| s.success()).unwrap_or(false);

    if saw_exiting && exited_zero {
        return classify_exit_flag(ctx, id);
    }
    if !exited_zero {
        return Ok(ProgressCode::Failed);
    }
    Ok(ProgressCode::Anomalous)
}

/// Forced termination, job-directory removal, and registry cleanup.
fn kill_it_with_fire(ctx: &mut ReconcileCtx, id: JobId, job_dir: &JobDir) -> anyhow::Result<()> {
    if let Some(mut handle) = ctx.registry.remove(id) {
        let pid = handle.child.id();
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).ok();
        let _ = handle.child.wait();
    }
    job_dir.remove().ok();
    let fifo = signal_fifo_path(ctx.service_root, id);
    std::fs::remove_file(&fifo).ok();
    Ok(())
}

/// Drops the registry entry, closing the worker's channel and releasing its
/// process handle, without touching the filesystem (used on normal
/// completion, unlike [`kill_it_with_fire`]).
fn teardown(ctx: &mut ReconcileCtx, id: JobId) {
    ctx.registry.remove(id);
}

/// Creates the signal channel and starts a fresh worker, re-exec'ing the
/// current binary into its hidden worker mode (`spec.md` §9:
/// "Worker-as-subprocess... is required").
fn admit_worker(ctx: &mut ReconcileCtx, row: &JobRow) -> anyhow::Result<()> {
    let fifo_path = signal_fifo_path(ctx.service_root, row.id);
    channel::create(&fifo_path)?;

    let mut cmd = Command::new(ctx.exe_path);
    cmd.arg("__worker")
        .arg(row.id.to_string())
        .arg(&row.name)
        .arg(&row.archive)
        .arg(ctx.shared.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if ctx.debug {
        cmd.arg("--debug");
    }

    let child = cmd.spawn()?;
    // Opened non-blocking, so this never stalls even though the worker's
    // own writer-side open (which does block until a reader exists) may
    // still be racing us.
    let reader = Reader::open(&fifo_path)?;

    ctx.registry.insert(
        row.id,
        WorkerHandle {
            child,
            channel: reader,
            last_token: None,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn ctx_fixture<'a>(
        registry: &'a mut Registry,
        root: &'a Path,
        shared: &'a SharedArea,
    ) -> ReconcileCtx<'a> {
        ReconcileCtx {
            registry,
            service_root: root,
            shared,
            debug: false,
            exe_path: Path::new("/bin/true"),
            error_log_prefix: "/tmp/caliserv_test_err",
        }
    }

    #[test]
    fn pending_row_not_in_registry_starts_nothing_without_exe() {
        // admit_worker would try to spawn /bin/true __worker ... which is
        // harmless but not representative; this test only exercises the
        // duplicate-admission guard, which does not spawn anything.
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedArea::new(tmp.path().join("shared"));
        let mut registry = Registry::new();
        let fifo = signal_fifo_path(tmp.path(), JobId(1));
        channel::create(&fifo).unwrap();
        let reader = Reader::open(&fifo).unwrap();
        let child = StdCommand::new("sleep").arg("5").spawn().unwrap();
        registry.insert(
            JobId(1),
            WorkerHandle {
                child,
                channel: reader,
                last_token: None,
            },
        );

        let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared);
        let row = JobRow {
            id: JobId(1),
            name: "House A".into(),
            archive: "houseA.zip".into(),
            progress: ProgressCode::Pending,
        };
        let result = reconcile_pending(&mut ctx, &row).unwrap();
        assert_eq!(result, Some(ProgressCode::InProgress));
        assert!(ctx.registry.contains(JobId(1)));

        // cleanup
        ctx.registry.get_mut(JobId(1)).unwrap().child.kill().ok();
    }

    #[test]
    fn cancel_requested_for_unregistered_job_writes_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedArea::new(tmp.path().join("shared"));
        let mut registry = Registry::new();
        let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared);
        let row = JobRow {
            id: JobId(99),
            name: "X".into(),
            archive: "x.zip".into(),
            progress: ProgressCode::CancelRequested,
        };
        let result = reconcile_cancel_requested(&mut ctx, &row).unwrap();
        assert_eq!(result, Some(ProgressCode::Cancelled));
    }

    #[test]
    fn terminal_progress_codes_are_no_ops() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = SharedArea::new(tmp.path().join("shared"));
        let mut registry = Registry::new();
        let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared);
        for progress in [
            ProgressCode::Failed,
            ProgressCode::DoneA,
            ProgressCode::DoneB,
            ProgressCode::DoneC,
            ProgressCode::DoneD,
            ProgressCode::Cancelled,
            ProgressCode::Anomalous,
        ] {
            let row = JobRow {
                id: JobId(1),
                name: "X".into(),
                archive: "x.zip".into(),
                progress,
            };
            assert_eq!(reconcile(&mut ctx, &row).unwrap(), None);
        }
    }
}
