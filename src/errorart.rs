//! Error artifact emission: the machine-readable `data.json` and the
//! typeset `report.pdf` a worker publishes to the shared area whenever it
//! fails, plus the local `<id>.err` marker. Format recovered from
//! `main.py::jobError`, which this reproduces field-for-field (see
//! `SPEC_FULL.md` §7).

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::model::JobId;
use crate::paths::{JobDir, SharedArea};
use crate::timeutil::now_display;

/// The `outputs/data.json` error artifact body, field-for-field matching
/// `main.py::jobError`'s hand-written JSON.
#[derive(Debug, Serialize)]
struct ErrorArtifact {
    error: ErrorArtifactBody,
}

#[derive(Debug, Serialize)]
struct ErrorArtifactBody {
    datetime: String,
    /// A string, not a number, matching `main.py`'s own `str(code)` — kept
    /// for artifact-format fidelity, since downstream consumers parse this
    /// file expecting a quoted code.
    code: String,
    message: String,
}

/// Writes `<id>.err`, `outputs/data.json`, typesets `outputs/report.pdf` via
/// `pdflatex`, and publishes both into `<shared>/Results/<id>/`. `message`
/// is embedded verbatim into the LaTeX `verbatim` block and, with double
/// quotes stripped, into the JSON message field.
pub fn emit(
    job_dir: &JobDir,
    shared: &SharedArea,
    id: JobId,
    message: &str,
    code: i32,
) -> anyhow::Result<()> {
    let when = now_display();

    std::fs::write(
        job_dir.error_marker(id),
        format!("{message} @ {when}"),
    )
    .context("writing error marker")?;

    let outputs = job_dir.outputs();
    std::fs::create_dir_all(&outputs).ok();

    let json_path = outputs.join("data.json");
    let artifact = ErrorArtifact {
        error: ErrorArtifactBody {
            datetime: when.clone(),
            code: code.to_string(),
            message: message.replace('"', ""),
        },
    };
    std::fs::write(
        &json_path,
        serde_json::to_string_pretty(&artifact).context("serializing data.json")?,
    )
    .context("writing data.json")?;

    let tex_path = outputs.join("report.tex");
    std::fs::write(
        &tex_path,
        format!(
            "\\nonstopmode\n\\documentclass{{report}}\n\\begin{{document}}\nThe job did not successfully complete.\nAn error occured at {when}.\nError message was:\n\n\\begin{{verbatim}}\n{message}\n\\end{{verbatim}}\n\n\\end{{document}}"
        ),
    )
    .context("writing report.tex")?;

    typeset(&tex_path, job_dir.path())?;

    publish(&outputs, shared, id)
}

/// Invokes `pdflatex` twice, as `main.py` does, so cross-references (in
/// practice, none for this minimal report, but kept for fidelity with the
/// typesetting black box described in `spec.md` §1) resolve. `pdflatex`'s
/// own stdout is redirected to `pdflatex.out` purely as an operator
/// debugging aid; it is not part of the published artifact contract.
fn typeset(tex_path: &Path, job_dir: &Path) -> anyhow::Result<()> {
    let outputs = job_dir.join("outputs");
    let log_path = job_dir.join("pdflatex.out");
    let log_file = std::fs::File::create(&log_path).context("creating pdflatex.out")?;

    for _ in 0..2 {
        let log_file = log_file.try_clone().context("cloning pdflatex.out handle")?;
        std::process::Command::new("pdflatex")
            .arg(format!("-output-directory={}", outputs.display()))
            .arg(tex_path)
            .stdout(log_file)
            .status()
            .context("invoking pdflatex")?;
    }
    Ok(())
}

fn publish(outputs: &Path, shared: &SharedArea, id: JobId) -> anyhow::Result<()> {
    let dest = shared.recreate_results(id)?;
    std::fs::copy(outputs.join("data.json"), dest.join("data.json"))
        .context("publishing data.json")?;
    std::fs::copy(outputs.join("report.pdf"), dest.join("report.pdf"))
        .context("publishing report.pdf")?;
    Ok(())
}
