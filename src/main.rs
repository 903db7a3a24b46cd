//! caliservd — entry point.
//!
//! Two modes share one binary. The documented surface is the dispatcher:
//! `service [-d|--debug] <shared-dir> [<interval-seconds>]` (`spec.md` §6).
//! The hidden `__worker` mode is how the dispatcher re-execs itself into a
//! per-job worker process (`spec.md` §9); it is undocumented and not part of
//! the CLI contract, so it is parsed separately and never shown in usage.

use std::time::Duration;

use caliserv::dispatcher::Dispatcher;
use caliserv::model::JobId;
use caliserv::paths::{service_root, SharedArea};
use caliserv::proctitle::set_process_title;
use caliserv::worker::{self, WorkerArgs};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: caliservd [-d|--debug] <shared-dir> [<interval-seconds>]";

fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("__worker") {
        args.remove(0);
        run_worker(args);
        return;
    }

    run_service(args);
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run_service(args: Vec<String>) {
    let mut debug = false;
    let mut positional = Vec::new();

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            "-d" | "--debug" => debug = true,
            other if other.starts_with('-') => {
                eprintln!("caliservd: unknown option '{other}'");
                eprintln!("{USAGE}");
                std::process::exit(1);
            }
            other => positional.push(other.to_string()),
        }
    }

    if positional.is_empty() || positional.len() > 2 {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    let shared_dir = positional[0].clone();
    let interval_secs: f64 = match positional.get(1) {
        Some(s) => match s.parse() {
            Ok(v) => v,
            Err(_) => {
                eprintln!("caliservd: interval must be a decimal number of seconds");
                std::process::exit(1);
            }
        },
        None => 15.0,
    };

    init_tracing(debug);
    set_process_title("caliservd");

    let root = match service_root() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve service root");
            std::process::exit(1);
        }
    };
    let exe_path = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve own executable path");
            std::process::exit(1);
        }
    };

    let dispatcher = Dispatcher {
        sql_config_path: root.join(".SQL.txt"),
        service_root: root,
        shared: SharedArea::new(shared_dir),
        interval: Duration::from_secs_f64(interval_secs),
        debug,
        exe_path,
    };

    let debug_enabled = debug;
    tracing::info!(interval_secs, debug = debug_enabled, "caliservd starting");
    dispatcher.run();
}

/// Parses `__worker <id> <name> <archive> <shared-dir> [--debug]`, the
/// argument shape `reconcile::admit_worker` invokes this binary with.
fn run_worker(args: Vec<String>) {
    let debug = args.iter().any(|a| a == "--debug");
    let positional: Vec<&String> = args.iter().filter(|a| a.as_str() != "--debug").collect();

    if positional.len() != 4 {
        eprintln!("caliservd: malformed internal worker invocation");
        std::process::exit(11);
    }

    let id: i64 = match positional[0].parse() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("caliservd: malformed internal worker invocation");
            std::process::exit(11);
        }
    };

    init_tracing(debug);

    let worker_args = WorkerArgs {
        id: JobId(id),
        name: positional[1].clone(),
        archive: positional[2].clone(),
        debug,
        service_root: match service_root() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "worker: failed to resolve service root");
                std::process::exit(11);
            }
        },
        shared_dir: positional[3].clone(),
    };

    worker::run(worker_args);
}
