//! `.SQL.txt` configuration loading and the two SQL statements the service
//! issues: the project/result join read every tick, and the single-row
//! `result` write. Grounded in `main.py`'s `sql_update`/the join `SELECT` —
//! preserved as the same two statements, parameterized via `mysql`'s bound
//! `Value`s instead of the original's unsafe `%d` string interpolation.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use mysql::prelude::*;
use mysql::{params, Conn, Opts, OptsBuilder};

use crate::model::{JobId, JobRow, ProgressCode};

/// The five lines of `.SQL.txt`, in order: host, user, password, database
/// name, error-log path prefix. Read fresh every tick per `spec.md` §4.5.
pub struct SqlConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub error_log_prefix: String,
}

impl SqlConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut lines = text.lines();
        let mut next = |field: &str| -> anyhow::Result<String> {
            lines
                .next()
                .map(|l| l.trim().to_string())
                .ok_or_else(|| anyhow::anyhow!("{} is missing its {field} line", path.display()))
        };
        Ok(SqlConfig {
            host: next("host")?,
            user: next("user")?,
            password: next("password")?,
            database: next("database name")?,
            error_log_prefix: next("error-log path prefix")?,
        })
    }

    /// Opens a connection with a timeout equal to the tick interval, per
    /// `spec.md` §4.5 step 2. Bounds both the TCP handshake itself
    /// (`tcp_connect_timeout`) and post-connect I/O (`read_timeout`/
    /// `write_timeout`) — without the former, a hung handshake blocks the
    /// dispatcher past the tick interval.
    pub fn connect(&self, timeout: Duration) -> anyhow::Result<Conn> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(Some(self.host.clone()))
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.database.clone()))
            .tcp_connect_timeout(Some(timeout))
            .read_timeout(Some(timeout))
            .write_timeout(Some(timeout));
        Conn::new(Opts::from(opts)).context("connecting to SQL database")
    }
}

/// `SELECT t1.calproj_id, t1.name, t1.meas_perf, t2.result
///  FROM Calibro_projects AS t1 JOIN Calibro_results AS t2
///  ON t1.calproj_id = t2.calproj_id;`
pub fn fetch_rows(conn: &mut Conn) -> anyhow::Result<Vec<JobRow>> {
    let rows: Vec<(i64, String, String, i32)> = conn
        .query(
            "SELECT t1.calproj_id, t1.name, t1.meas_perf, t2.result \
             FROM Calibro_projects AS t1 \
             JOIN Calibro_results AS t2 ON t1.calproj_id = t2.calproj_id",
        )
        .context("querying SQL database")?;

    rows.into_iter()
        .map(|(id, name, archive, progress)| {
            Ok(JobRow {
                id: JobId(id),
                name,
                archive,
                progress: ProgressCode::try_from(progress)?,
            })
        })
        .collect()
}

/// `UPDATE Calibro_results SET result = ? WHERE calproj_id = ?;`
pub fn write_progress(conn: &mut Conn, id: JobId, progress: ProgressCode) -> anyhow::Result<()> {
    conn.exec_drop(
        "UPDATE Calibro_results SET result = :result WHERE calproj_id = :id",
        params! {
            "result" => i32::from(progress),
            "id" => id.0,
        },
    )
    .context("updating SQL database")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_config_parses_five_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".SQL.txt");
        std::fs::write(&path, "dbhost\ndbuser\ndbpass\ncalibro\n/var/log/caliserv\n").unwrap();
        let cfg = SqlConfig::load(&path).unwrap();
        assert_eq!(cfg.host, "dbhost");
        assert_eq!(cfg.user, "dbuser");
        assert_eq!(cfg.password, "dbpass");
        assert_eq!(cfg.database, "calibro");
        assert_eq!(cfg.error_log_prefix, "/var/log/caliserv");
    }

    #[test]
    fn sql_config_rejects_short_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".SQL.txt");
        std::fs::write(&path, "dbhost\ndbuser\n").unwrap();
        assert!(SqlConfig::load(&path).is_err());
    }
}
