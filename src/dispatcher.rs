//! Dispatcher: the outer loop. Each tick loads `.SQL.txt`, opens a
//! connection, queries the join of request/status rows, reconciles each
//! one, and sleeps out the remainder of the tick interval. See
//! `SPEC_FULL.md` §4.5.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::db::{self, SqlConfig};
use crate::errlog;
use crate::paths::SharedArea;
use crate::reconcile::{self, ReconcileCtx};
use crate::registry::Registry;

pub struct Dispatcher {
    pub service_root: PathBuf,
    pub shared: SharedArea,
    pub interval: Duration,
    pub debug: bool,
    pub exe_path: PathBuf,
    pub sql_config_path: PathBuf,
}

impl Dispatcher {
    pub fn run(&self) -> ! {
        let mut registry = Registry::new();
        loop {
            let tick_start = Instant::now();
            self.tick(&mut registry);
            sleep_til_next(tick_start, self.interval, self.debug);
        }
    }

    fn tick(&self, registry: &mut Registry) {
        let cfg = match SqlConfig::load(&self.sql_config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read .SQL.txt, skipping dispatch");
                return;
            }
        };

        let mut conn = match cfg.connect(self.interval) {
            Ok(c) => c,
            Err(e) => {
                errlog::warn(
                    &cfg.error_log_prefix,
                    &format!("failed to connect to SQL database, skipping dispatch: {e}"),
                );
                return;
            }
        };

        let rows = match db::fetch_rows(&mut conn) {
            Ok(r) => r,
            Err(e) => {
                errlog::warn(
                    &cfg.error_log_prefix,
                    &format!("failed to query SQL database, skipping dispatch: {e}"),
                );
                return;
            }
        };

        tracing::debug!(row_count = rows.len(), "dispatch: queried SQL database");

        let mut ctx = ReconcileCtx {
            registry,
            service_root: &self.service_root,
            shared: &self.shared,
            debug: self.debug,
            exe_path: &self.exe_path,
            error_log_prefix: &cfg.error_log_prefix,
        };

        for row in &rows {
            match reconcile::reconcile(&mut ctx, row) {
                Ok(Some(new_progress)) => {
                    if let Err(e) = db::write_progress(&mut conn, row.id, new_progress) {
                        errlog::warn(
                            &cfg.error_log_prefix,
                            &format!("failed to update SQL database: {e}"),
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Contained per-row error: spec.md §7 — "No error is
                    // fatal to the supervisor except an unhandled exception
                    // in the dispatcher loop itself."
                    tracing::error!(job_id = %row.id, error = %e, "reconciliation failed for row");
                }
            }
        }

        // Connection is dropped (closed) at the end of the tick.
    }
}

/// Sleeps out the remainder of the tick interval. If the tick took longer
/// than the interval, logs a late-tick warning and returns immediately.
fn sleep_til_next(tick_start: Instant, interval: Duration, debug: bool) {
    let elapsed = tick_start.elapsed();
    if debug {
        tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "dispatch took");
    }
    if elapsed < interval {
        std::thread::sleep(interval - elapsed);
    } else {
        tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, interval_ms = interval.as_millis() as u64, "tick ran over interval");
    }
}
