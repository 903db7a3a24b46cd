//! Archive Stager: lays a job's inputs out under its working directory and
//! validates the expected file set. Extraction shells out to `unzip`/`tar`
//! rather than a Rust archive crate, matching `main.py`'s own
//! `run(['unzip', ...])` / `run(['tar', ...])` calls — treated the same way
//! the calibration binary is treated, as an external tool invoked by path.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::paths::{JobDir, SharedArea};

/// Classified staging failure, so the worker harness can map it to the
/// correct exit code (`spec.md` §6): `16` for format/extraction problems,
/// `11` for everything else (missing archive, missing expected files).
#[derive(thiserror::Error)]
pub enum StageError {
    #[error("error retrieving inputs archive \"{archive}\"")]
    MissingArchive { archive: String, source: std::io::Error },
    #[error("unrecognised inputs archive format (.zip, .tar, and .tar.gz supported)")]
    UnrecognisedFormat,
    #[error("failed to extract inputs")]
    ExtractionFailed(#[source] anyhow::Error),
    #[error("boundary condition file not found")]
    MissingBc,
    #[error("calibro input file not found")]
    MissingCalibroInput,
    #[error("no observed data file(s) found")]
    MissingObs,
    #[error("no matching simulated data file found for observed data file {0}")]
    MissingSim(String),
    #[error("no simulated data file(s) found")]
    MissingSingleSim,
}

impl StageError {
    /// `11` for missing/unparseable inputs, `16` for format/extraction
    /// problems, per `spec.md` §6's exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::UnrecognisedFormat | StageError::ExtractionFailed(_) => 16,
            _ => 11,
        }
    }
}

impl std::fmt::Debug for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// The outcome of staging: either a single obs/sim pair, or a list of
/// dataset stems, each with an `<stem>_obs.csv`/`<stem>_sim.csv` pair, in
/// the order discovered (the same order reused when building the
/// calibration binary's argument vector, per `spec.md` §4.1/§4.2).
pub enum Datasets {
    Single,
    Multi(Vec<String>),
}

impl Datasets {
    /// `(obs, sim)` argument values, comma-joined for the multi case, paths
    /// relative to the job working directory as the calibration binary
    /// expects (`inputs/...`).
    pub fn obs_sim_args(&self) -> (String, String) {
        match self {
            Datasets::Single => ("inputs/obs.csv".to_string(), "inputs/sim.csv".to_string()),
            Datasets::Multi(stems) => {
                let obs = stems
                    .iter()
                    .map(|s| format!("inputs/{s}_obs.csv"))
                    .collect::<Vec<_>>()
                    .join(",");
                let sim = stems
                    .iter()
                    .map(|s| format!("inputs/{s}_sim.csv"))
                    .collect::<Vec<_>>()
                    .join(",");
                (obs, sim)
            }
        }
    }
}

/// Lays out and validates a job's inputs. `job_dir` must already exist with
/// an empty `inputs/` subdirectory (the worker harness is responsible for
/// calling [`JobDir::recreate`] before this runs).
pub fn stage(
    shared: &SharedArea,
    job_dir: &JobDir,
    archive: &str,
) -> Result<Datasets, StageError> {
    let server_path = shared.model_archive(archive);
    let inputs_dir = job_dir.inputs();
    let local_archive = inputs_dir.join(archive);

    std::fs::copy(&server_path, &local_archive).map_err(|source| StageError::MissingArchive {
        archive: archive.to_string(),
        source,
    })?;

    extract(&local_archive, &inputs_dir, archive)?;
    std::fs::remove_file(&local_archive).ok();

    validate(&inputs_dir)
}

fn extract(archive_path: &Path, inputs_dir: &Path, archive_name: &str) -> Result<(), StageError> {
    let (_, ext) = archive_name
        .split_once('.')
        .ok_or(StageError::UnrecognisedFormat)?;

    let status = match ext {
        "zip" => std::process::Command::new("unzip")
            .arg("-d")
            .arg(inputs_dir)
            .arg(archive_path)
            .status(),
        "tar" | "tar.gz" => std::process::Command::new("tar")
            .arg("-xC")
            .arg(inputs_dir)
            .arg("-f")
            .arg(archive_path)
            .status(),
        _ => return Err(StageError::UnrecognisedFormat),
    };

    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(StageError::ExtractionFailed(anyhow::anyhow!(
            "extraction command exited with {s}"
        ))),
        Err(e) => Err(StageError::ExtractionFailed(e.into())),
    }
}

fn validate(inputs_dir: &Path) -> Result<Datasets, StageError> {
    if !inputs_dir.join("bc.csv").is_file() {
        return Err(StageError::MissingBc);
    }
    if !inputs_dir.join("calibro_input.csv").is_file() {
        return Err(StageError::MissingCalibroInput);
    }

    if inputs_dir.join("obs.csv").is_file() {
        if !inputs_dir.join("sim.csv").is_file() {
            return Err(StageError::MissingSingleSim);
        }
        return Ok(Datasets::Single);
    }

    let mut stems = Vec::new();
    let mut obs_files: Vec<PathBuf> = std::fs::read_dir(inputs_dir)
        .with_context(|| format!("reading {}", inputs_dir.display()))
        .map_err(StageError::ExtractionFailed)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_obs.csv"))
        })
        .collect();
    obs_files.sort();

    if obs_files.is_empty() {
        return Err(StageError::MissingObs);
    }

    for obs_path in &obs_files {
        let name = obs_path.file_name().and_then(|n| n.to_str()).unwrap();
        let stem = name.strip_suffix("_obs.csv").unwrap();
        let sim_path = inputs_dir.join(format!("{stem}_sim.csv"));
        if !sim_path.is_file() {
            return Err(StageError::MissingSim(name.to_string()));
        }
        stems.push(stem.to_string());
    }

    Ok(Datasets::Multi(stems))
}
