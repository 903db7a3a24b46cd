//! Core data types shared across the dispatcher, reconciler, registry and
//! worker harness: job identifiers, database progress codes, and the
//! worker's signal-channel vocabulary.

use std::fmt;

/// A job identifier, as assigned by the front end. Backed by `i64` to match
/// the `INT` column `Calibro_projects.calproj_id` / `Calibro_results.calproj_id`.
///
/// `Display` is the single place the decimal string form is produced; every
/// filesystem path and process title that embeds the job id goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(v: i64) -> Self {
        JobId(v)
    }
}

/// Database-recorded lifecycle state of a job row (`Calibro_results.result`).
///
/// Codes 2, 3..=6, 8 and 9 are terminal for the service per the invariant in
/// `spec.md` §3: once written, the service takes no further action on the
/// row until the front end rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProgressCode {
    Pending = 0,
    InProgress = 1,
    Failed = 2,
    DoneA = 3,
    DoneC = 4,
    DoneB = 5,
    DoneD = 6,
    CancelRequested = 7,
    Cancelled = 8,
    Anomalous = 9,
}

impl ProgressCode {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressCode::Failed
                | ProgressCode::DoneA
                | ProgressCode::DoneC
                | ProgressCode::DoneB
                | ProgressCode::DoneD
                | ProgressCode::Cancelled
                | ProgressCode::Anomalous
        )
    }
}

impl TryFrom<i32> for ProgressCode {
    type Error = anyhow::Error;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => ProgressCode::Pending,
            1 => ProgressCode::InProgress,
            2 => ProgressCode::Failed,
            3 => ProgressCode::DoneA,
            4 => ProgressCode::DoneC,
            5 => ProgressCode::DoneB,
            6 => ProgressCode::DoneD,
            7 => ProgressCode::CancelRequested,
            8 => ProgressCode::Cancelled,
            9 => ProgressCode::Anomalous,
            other => anyhow::bail!("unrecognised progress code {other}"),
        })
    }
}

impl From<ProgressCode> for i32 {
    fn from(p: ProgressCode) -> i32 {
        p as i32
    }
}

/// A row from the join of `Calibro_projects` and `Calibro_results`.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub name: String,
    pub archive: String,
    pub progress: ProgressCode,
}

/// A token emitted by a worker on the signal channel, in strictly
/// increasing lifecycle order: `Started`, `Running`, `Uploading`, `Exiting`.
/// `Exiting` is always followed by exactly one [`ResultFlag`] byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerToken {
    Started = 1,
    Running = 2,
    Uploading = 3,
    Exiting = 4,
}

impl TryFrom<u8> for WorkerToken {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => WorkerToken::Started,
            2 => WorkerToken::Running,
            3 => WorkerToken::Uploading,
            4 => WorkerToken::Exiting,
            other => anyhow::bail!("protocol violation: unrecognised worker token {other}"),
        })
    }
}

/// The classification byte a worker writes immediately after [`WorkerToken::Exiting`].
/// Production always emits [`ResultFlag::ClassA`]; the four-value interface is
/// preserved for forward compatibility per `spec.md` §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultFlag {
    ClassA = 0,
    ClassB = 1,
    ClassC = 2,
    ClassD = 3,
}

impl TryFrom<u8> for ResultFlag {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => ResultFlag::ClassA,
            1 => ResultFlag::ClassB,
            2 => ResultFlag::ClassC,
            3 => ResultFlag::ClassD,
            other => anyhow::bail!("protocol violation: unrecognised result flag {other}"),
        })
    }
}

impl ResultFlag {
    /// The bit-for-bit preserved mapping from `spec.md` §3: `{0->3, 1->5, 2->4, 3->6}`.
    pub fn done_code(self) -> ProgressCode {
        match self {
            ResultFlag::ClassA => ProgressCode::DoneA,
            ResultFlag::ClassB => ProgressCode::DoneB,
            ResultFlag::ClassC => ProgressCode::DoneC,
            ResultFlag::ClassD => ProgressCode::DoneD,
        }
    }
}

/// Sanitize a human job name for use as a calibration binary argument:
/// spaces and underscores become hyphens.
pub fn sanitize_name(name: &str) -> String {
    name.replace(' ', "-").replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_flag_done_code_mapping_is_exact() {
        assert_eq!(ResultFlag::ClassA.done_code() as i32, 3);
        assert_eq!(ResultFlag::ClassB.done_code() as i32, 5);
        assert_eq!(ResultFlag::ClassC.done_code() as i32, 4);
        assert_eq!(ResultFlag::ClassD.done_code() as i32, 6);
    }

    #[test]
    fn progress_code_round_trips() {
        for v in 0..=9 {
            let p = ProgressCode::try_from(v).unwrap();
            assert_eq!(i32::from(p), v);
        }
        assert!(ProgressCode::try_from(10).is_err());
    }

    #[test]
    fn terminal_codes() {
        assert!(ProgressCode::DoneA.is_terminal());
        assert!(ProgressCode::Cancelled.is_terminal());
        assert!(ProgressCode::Anomalous.is_terminal());
        assert!(ProgressCode::Failed.is_terminal());
        assert!(!ProgressCode::Pending.is_terminal());
        assert!(!ProgressCode::InProgress.is_terminal());
        assert!(!ProgressCode::CancelRequested.is_terminal());
    }

    #[test]
    fn worker_token_rejects_out_of_range() {
        assert!(WorkerToken::try_from(0).is_err());
        assert!(WorkerToken::try_from(5).is_err());
        assert!(WorkerToken::try_from(1).is_ok());
    }

    #[test]
    fn sanitize_name_replaces_spaces_and_underscores() {
        assert_eq!(sanitize_name("House A_1"), "House-A-1");
    }
}
