//! End-to-end exercises of the reconciler against a fake calibration binary.
//!
//! A live MySQL server is not available in this environment, so these tests
//! drive `caliserv::reconcile` directly against hand-built `JobRow` values
//! rather than through `Dispatcher::run`, with `exe_path` pointed at small
//! shell scripts standing in for the real `caliservd __worker` re-exec and
//! the `scripts/calibrino` binary it shells out to.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use caliserv::model::{JobId, JobRow, ProgressCode};
use caliserv::paths::{signal_fifo_path, JobDir, SharedArea};
use caliserv::reconcile::{reconcile, ReconcileCtx};
use caliserv::registry::Registry;

/// Writes an executable shell script at `path`.
fn write_script(path: &Path, body: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    writeln!(f, "#!/bin/sh\n{body}").unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Builds a fake `caliservd` stand-in whose `__worker` mode runs
/// `calibrino` directly and writes the signal channel tokens itself,
/// mirroring the real worker harness's emission order without staging a
/// real archive.
fn fake_exe(dir: &Path, calibrino_exit: &str) -> PathBuf {
    let calibrino = dir.join("calibrino");
    write_script(&calibrino, &format!("exit {calibrino_exit}"));

    let exe = dir.join("fake_caliservd");
    write_script(
        &exe,
        &format!(
            r#"
shift # drop __worker
id=$1
fifo="{service_root}/jobs/signals/job_${{id}}.fifo"
printf '\1' > "$fifo"
printf '\2' > "$fifo"
{calibrino}
code=$?
if [ $code -ne 0 ]; then
  exit $code
fi
printf '\3' > "$fifo"
printf '\4\0' > "$fifo"
exit 0
"#,
            service_root = dir.display(),
            calibrino = calibrino.display(),
        ),
    );
    exe
}

fn ctx_fixture<'a>(
    registry: &'a mut Registry,
    root: &'a Path,
    shared: &'a SharedArea,
    exe_path: &'a Path,
) -> ReconcileCtx<'a> {
    ReconcileCtx {
        registry,
        service_root: root,
        shared,
        debug: false,
        exe_path,
        error_log_prefix: "/tmp/caliserv_it_err",
    }
}

fn wait_until<F: FnMut() -> bool>(timeout: std::time::Duration, mut cond: F) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(30));
    }
    cond()
}

#[test]
fn pending_job_transitions_to_in_progress_on_admission() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    let exe = fake_exe(tmp.path(), "0");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(1),
        name: "House A".into(),
        archive: "houseA.zip".into(),
        progress: ProgressCode::Pending,
    };

    let result = reconcile(&mut ctx, &row).unwrap();
    assert_eq!(result, Some(ProgressCode::InProgress));
    assert!(ctx.registry.contains(JobId(1)));
}

#[test]
fn successful_worker_settles_at_done_a() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    let exe = fake_exe(tmp.path(), "0");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(2),
        name: "House B".into(),
        archive: "houseB.zip".into(),
        progress: ProgressCode::Pending,
    };
    reconcile(&mut ctx, &row).unwrap();

    let in_progress_row = JobRow {
        progress: ProgressCode::InProgress,
        ..row.clone()
    };

    let settled = wait_until(std::time::Duration::from_secs(3), || {
        matches!(
            reconcile(&mut ctx, &in_progress_row),
            Ok(Some(ProgressCode::DoneA))
        )
    });
    assert!(settled, "worker did not settle at DoneA in time");
    assert!(!ctx.registry.contains(JobId(2)));
}

#[test]
fn failing_calibration_binary_settles_at_failed() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    let exe = fake_exe(tmp.path(), "7");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(3),
        name: "House C".into(),
        archive: "houseC.zip".into(),
        progress: ProgressCode::Pending,
    };
    reconcile(&mut ctx, &row).unwrap();

    let in_progress_row = JobRow {
        progress: ProgressCode::InProgress,
        ..row.clone()
    };

    let settled = wait_until(std::time::Duration::from_secs(3), || {
        matches!(
            reconcile(&mut ctx, &in_progress_row),
            Ok(Some(ProgressCode::Failed))
        )
    });
    assert!(settled, "worker did not settle at Failed in time");
}

#[test]
fn kill_token_forces_anomalous_and_removes_job_dir() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    // Use a slow fake so the admin kill token is observed before completion.
    let exe = tmp.path().join("slow_fake");
    write_script(&exe, "shift; sleep 30");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(4),
        name: "House D".into(),
        archive: "houseD.zip".into(),
        progress: ProgressCode::Pending,
    };
    reconcile(&mut ctx, &row).unwrap();

    let job_dir = JobDir::new(tmp.path(), JobId(4));
    job_dir.recreate().unwrap();
    std::fs::write(job_dir.kill_token(), b"").unwrap();

    let in_progress_row = JobRow {
        progress: ProgressCode::InProgress,
        ..row.clone()
    };
    let result = reconcile(&mut ctx, &in_progress_row).unwrap();
    assert_eq!(result, Some(ProgressCode::Anomalous));
    assert!(!ctx.registry.contains(JobId(4)));
    assert!(!job_dir.exists());
    assert!(!signal_fifo_path(tmp.path(), JobId(4)).exists());
}

#[test]
fn cancel_requested_terminates_live_worker() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    // `exec` so the spawned pid *is* `sleep`, not a shell still waiting on it
    // — SIGTERM must reach the process the registry actually tracks.
    let exe = tmp.path().join("slow_fake");
    write_script(&exe, "shift; exec sleep 30");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(6),
        name: "House F".into(),
        archive: "houseF.zip".into(),
        progress: ProgressCode::Pending,
    };
    reconcile(&mut ctx, &row).unwrap();
    assert!(ctx.registry.contains(JobId(6)));

    let cancel_row = JobRow {
        progress: ProgressCode::CancelRequested,
        ..row.clone()
    };
    let result = reconcile(&mut ctx, &cancel_row).unwrap();
    assert_eq!(result, Some(ProgressCode::Cancelled));
    assert!(!ctx.registry.contains(JobId(6)));
}

#[test]
fn cancel_requested_loses_race_to_clean_completion() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    let exe = fake_exe(tmp.path(), "0");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(7),
        name: "House G".into(),
        archive: "houseG.zip".into(),
        progress: ProgressCode::Pending,
    };
    reconcile(&mut ctx, &row).unwrap();

    // The DB row is observed as CancelRequested (an admin clicked cancel)
    // before the dispatcher's next tick, but the worker finishes cleanly in
    // the meantime: the clean completion must win, not Cancelled.
    let cancel_row = JobRow {
        progress: ProgressCode::CancelRequested,
        ..row.clone()
    };
    let settled = wait_until(std::time::Duration::from_secs(3), || {
        matches!(
            reconcile(&mut ctx, &cancel_row),
            Ok(Some(ProgressCode::DoneA))
        )
    });
    assert!(settled, "clean completion did not win the race");
    assert!(!ctx.registry.contains(JobId(7)));
}

#[test]
fn in_progress_restart_recovery_readmits_without_write_back() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    let exe = fake_exe(tmp.path(), "0");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    // Simulates a supervisor restart: the DB already says InProgress, but
    // nothing is in the (freshly built) registry, and no kill token was left
    // behind.
    let row = JobRow {
        id: JobId(8),
        name: "House H".into(),
        archive: "houseH.zip".into(),
        progress: ProgressCode::InProgress,
    };
    let result = reconcile(&mut ctx, &row).unwrap();
    assert_eq!(result, None, "write-back must be skipped on recovery");
    assert!(ctx.registry.contains(JobId(8)));
}

#[test]
fn protocol_violation_forces_anomalous() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("jobs")).unwrap();
    // Writes a byte outside {1,2,3,4} and then hangs, simulating a worker
    // that corrupts the signal channel instead of speaking the protocol.
    let exe = tmp.path().join("bad_fake");
    write_script(
        &exe,
        &format!(
            r#"
shift
id=$1
fifo="{service_root}/jobs/signals/job_${{id}}.fifo"
printf '\1' > "$fifo"
printf '\143' > "$fifo"
exec sleep 30
"#,
            service_root = tmp.path().display(),
        ),
    );
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

    let row = JobRow {
        id: JobId(9),
        name: "House I".into(),
        archive: "houseI.zip".into(),
        progress: ProgressCode::Pending,
    };
    reconcile(&mut ctx, &row).unwrap();

    let in_progress_row = JobRow {
        progress: ProgressCode::InProgress,
        ..row.clone()
    };
    let job_dir = JobDir::new(tmp.path(), JobId(9));
    let settled = wait_until(std::time::Duration::from_secs(3), || {
        matches!(
            reconcile(&mut ctx, &in_progress_row),
            Ok(Some(ProgressCode::Anomalous))
        )
    });
    assert!(settled, "protocol violation did not settle at Anomalous");
    assert!(!ctx.registry.contains(JobId(9)));
    assert!(!job_dir.exists());
    assert!(!signal_fifo_path(tmp.path(), JobId(9)).exists());
}

#[test]
fn terminal_progress_rows_are_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = tmp.path().join("unused");
    write_script(&exe, "exit 0");
    let shared = SharedArea::new(tmp.path().join("shared"));
    let mut registry = Registry::new();
    let mut ctx = ctx_fixture(&mut registry, tmp.path(), &shared, &exe);

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
            id: JobId(5),
            name: "X".into(),
            archive: "x.zip".into(),
            progress,
        };
        assert_eq!(reconcile(&mut ctx, &row).unwrap(), None);
    }
}
