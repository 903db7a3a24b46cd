//! Worker Harness: the per-job child process. Stages inputs, invokes the
//! calibration binary, publishes outputs, and emits lifecycle tokens over
//! the signal channel. On any fatal error it publishes an error artifact
//! and exits with the matching code from `spec.md` §6. See `SPEC_FULL.md`
//! §4.2.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::channel::Writer;
use crate::errorart;
use crate::fsutil;
use crate::model::{sanitize_name, JobId, ResultFlag, WorkerToken};
use crate::paths::{signal_fifo_path, JobDir, SharedArea};
use crate::proctitle::set_process_title;
use crate::timeutil::now_display;

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_: libc::c_int) {
    TERMINATED.store(true, Ordering::SeqCst);
}

/// Parameters a worker is re-invoked with by the dispatcher, carried over
/// the hidden `__worker` CLI mode (see `src/main.rs`).
pub struct WorkerArgs {
    pub id: JobId,
    pub name: String,
    pub archive: String,
    pub debug: bool,
    pub service_root: PathBuf,
    pub shared_dir: String,
}

/// Runs the worker to completion. Never returns: every path through this
/// function ends the process via `std::process::exit` with the exit code
/// `spec.md` §6 assigns to that outcome.
pub fn run(args: WorkerArgs) -> ! {
    set_process_title(&format!("caliserv{}", args.id));

    // If the supervisor dies, the kernel delivers SIGKILL to this worker.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
    }

    let job_dir = JobDir::new(&args.service_root, args.id);
    let shared = SharedArea::new(args.shared_dir.clone());

    if let Err(e) = job_dir.recreate() {
        tracing::error!(error = %e, "worker: failed to (re)create job directory");
        std::process::exit(11);
    }

    let debug_log = if args.debug {
        let path = job_dir.debug_log(args.id);
        let when = now_display();
        let _ = std::fs::write(
            &path,
            format!("*** JOB STARTED @ {when} ***\nJobID: {}\n", args.id),
        );
        Some(path)
    } else {
        None
    };

    install_sigterm_handler(job_dir.clone(), shared.clone(), args.id);

    let fifo_path = signal_fifo_path(&args.service_root, args.id);
    let mut channel = match Writer::open(&fifo_path) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "worker: failed to open signal channel");
            std::process::exit(11);
        }
    };

    fail_on_err(&mut channel, WorkerToken::Started);

    let datasets = match crate::stager::stage(&shared, &job_dir, &args.archive) {
        Ok(d) => d,
        Err(e) => {
            let code = e.exit_code();
            emit_error_and_exit(&job_dir, &shared, args.id, &e.to_string(), code);
        }
    };

    fail_on_err(&mut channel, WorkerToken::Running);

    let calibrino = args.service_root.join("scripts").join("calibrino");
    let calib_args = build_calibration_args(&args.name, &datasets);

    if let Some(path) = &debug_log {
        let cmdline = std::iter::once(calibrino.display().to_string())
            .chain(calib_args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        append_log(path, &format!("Calibration invoked with command: {cmdline}\n"));
    }

    let output = unsafe {
        Command::new(&calibrino)
            .args(&calib_args)
            .current_dir(job_dir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
                Ok(())
            })
            .output()
    };

    let output = match output {
        Ok(o) => o,
        Err(e) => {
            emit_error_and_exit(
                &job_dir,
                &shared,
                args.id,
                &format!("failed to invoke calibration binary: {e}"),
                1,
            );
        }
    };

    if let Some(path) = &debug_log {
        append_log(
            path,
            &format!(
                "\nCalibration finished, output follows:\n{}\n",
                String::from_utf8_lossy(&output.stdout)
            ),
        );
    }

    if !output.status.success() {
        let code = output.status.code().unwrap_or(1);
        let message = format!(
            "Calibration failed, error output follows:\n{}\n",
            String::from_utf8_lossy(&output.stderr)
        );
        emit_error_and_exit(&job_dir, &shared, args.id, &message, code);
    }

    if let Err(e) = promote_outputs(&job_dir) {
        emit_error_and_exit(&job_dir, &shared, args.id, &e.to_string(), 18);
    }

    fail_on_err(&mut channel, WorkerToken::Uploading);

    if let Err(e) = publish_outputs(&job_dir, &shared, args.id) {
        emit_error_and_exit(&job_dir, &shared, args.id, &e.to_string(), 18);
    }

    if let Some(path) = &debug_log {
        append_log(path, &format!("\n*** JOB FINISHED @ {} ***\n", now_display()));
        let dest = shared.results_dir(args.id).join("log.txt");
        let _ = std::fs::copy(path, dest);
    }

    if let Err(e) = channel.send_token(WorkerToken::Exiting) {
        tracing::warn!(error = %e, "worker: failed to send exiting token");
    }
    // Production always emits the compliant flag; the channel format still
    // carries the full four-value interface per spec.md §9.
    if let Err(e) = channel.send_result_flag(ResultFlag::ClassA) {
        tracing::warn!(error = %e, "worker: failed to send result flag");
    }

    std::process::exit(0);
}

fn fail_on_err(channel: &mut Writer, token: WorkerToken) {
    if let Err(e) = channel.send_token(token) {
        tracing::error!(error = %e, ?token, "worker: failed to send token, channel may be broken");
    }
}

fn build_calibration_args(name: &str, datasets: &crate::stager::Datasets) -> Vec<String> {
    let sanitized = sanitize_name(name);
    let (obs, sim) = datasets.obs_sim_args();
    vec![
        "-c".into(),
        sanitized,
        "-f".into(),
        "json,pdf".into(),
        "-b".into(),
        "inputs/bc.csv".into(),
        "-i".into(),
        "inputs/calibro_input.csv".into(),
        "-o".into(),
        obs,
        "-s".into(),
        sim,
        "-r".into(),
        "cal,sa,ret,train,ds".into(),
    ]
}

/// Moves `calibro_report.json`/`calibro_report.pdf` from the job's working
/// directory (where the calibration binary writes them, `cwd`-relative)
/// into `outputs/`.
fn promote_outputs(job_dir: &JobDir) -> anyhow::Result<()> {
    for name in ["calibro_report.json", "calibro_report.pdf"] {
        let src = job_dir.path().join(name);
        let dest = job_dir.outputs().join(name);
        std::fs::rename(&src, &dest)
            .map_err(|e| anyhow::anyhow!("could not move output file \"{name}\": {e}"))?;
    }
    Ok(())
}

fn publish_outputs(job_dir: &JobDir, shared: &SharedArea, id: JobId) -> anyhow::Result<()> {
    let dest = shared.recreate_results(id)?;
    fsutil::copy_tree_entries(&job_dir.outputs(), &dest)
}

fn append_log(path: &std::path::Path, text: &str) {
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = f.write_all(text.as_bytes());
    }
}

fn emit_error_and_exit(
    job_dir: &JobDir,
    shared: &SharedArea,
    id: JobId,
    message: &str,
    code: i32,
) -> ! {
    if let Err(e) = errorart::emit(job_dir, shared, id, message, code) {
        tracing::error!(error = %e, "worker: failed to emit error artifact");
    }
    std::process::exit(code);
}

fn install_sigterm_handler(job_dir: JobDir, shared: SharedArea, id: JobId) {
    let action = SigAction::new(
        SigHandler::Handler(on_sigterm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        if let Err(e) = sigaction(Signal::SIGTERM, &action) {
            tracing::warn!(error = %e, "worker: failed to install SIGTERM handler");
            return;
        }
    }

    let job_dir = Arc::new(job_dir);
    let shared = Arc::new(shared);
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_millis(50));
        if TERMINATED.load(Ordering::SeqCst) {
            emit_error_and_exit(
                job_dir.as_ref(),
                shared.as_ref(),
                id,
                "job recieved a terminate signal",
                15,
            );
        }
    });
}
