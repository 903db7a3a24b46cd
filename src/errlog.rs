//! The supervisor-side transient-error log: `<error-log-prefix>_cur.txt`,
//! appended to on every database connect/query/update failure, in addition
//! to the normal `tracing::warn!` emission. Grounded in `main.py::mainError`.

use std::io::Write;

use crate::timeutil::now_display;

pub fn warn(prefix: &str, message: &str) {
    let when = now_display();
    tracing::warn!(%message, "main process warning");

    let path = format!("{prefix}_cur.txt");
    let line = format!("{when}: {message}\n");
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = f.write_all(line.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_a_line_to_the_error_log() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path().join("caliserv_err").to_string_lossy().to_string();
        warn(&prefix, "failed to connect to SQL database, skipping dispatch");
        let contents = std::fs::read_to_string(format!("{prefix}_cur.txt")).unwrap();
        assert!(contents.contains("failed to connect to SQL database"));
    }
}
