//! Post-load steps: external transform/test commands and the test-log scan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

/// One external command run after a successful partitioned load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamStep {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// A non-zero exit is logged instead of failing the chain.
    #[serde(default)]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Steps run in order; the first failing step without `allow_failure` stops the chain.
pub async fn run_downstream(steps: &[DownstreamStep]) -> Result<Vec<StepReport>> {
    let mut reports = Vec::with_capacity(steps.len());
    for step in steps {
        info!(step = %step.name, program = %step.program, "starting downstream step");
        let mut cmd = Command::new(&step.program);
        cmd.args(&step.args).envs(&step.env).kill_on_drop(true);
        if let Some(dir) = &step.working_dir {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .await
            .with_context(|| format!("spawning downstream step {}", step.name))?;

        let report = StepReport {
            name: step.name.clone(),
            exit_code: status.code(),
            success: status.success(),
        };
        reports.push(report);

        if status.success() {
            info!(step = %step.name, "downstream step finished");
        } else if step.allow_failure {
            warn!(step = %step.name, code = ?status.code(), "downstream step failed; continuing");
        } else {
            bail!("downstream step {} exited with {status}", step.name);
        }
    }
    Ok(reports)
}

fn default_log_prefix() -> String {
    "dbt_test_".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogScanConfig {
    pub logs_dir: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogScanSummary {
    pub source_log: PathBuf,
    pub summary_path: PathBuf,
    pub warnings: usize,
    pub failures: usize,
}

/// Summarize the newest `<prefix><timestamp>.log` into
/// `<prefix>summary_<timestamp>.log`. Returns `None` when there is no log yet.
pub async fn scan_test_log(config: &LogScanConfig) -> Result<Option<LogScanSummary>> {
    let Some(latest) = latest_test_log(&config.logs_dir, &config.log_prefix).await? else {
        warn!(dir = %config.logs_dir.display(), "no test log found; skipping scan");
        return Ok(None);
    };

    let file_name = latest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let timestamp = file_name
        .trim_start_matches(config.log_prefix.as_str())
        .trim_end_matches(".log")
        .to_string();

    let text = fs::read_to_string(&latest)
        .await
        .with_context(|| format!("reading {}", latest.display()))?;
    let warnings = text.lines().filter(|l| l.contains("WARN")).count();
    let failures = text.lines().filter(|l| l.contains("FAIL")).count();

    let mut summary = vec![
        "# dbt test summary - generated by n311 pipeline".to_string(),
        format!("# Execution time: {timestamp}"),
        format!("# Total warnings: {warnings}"),
        format!("# Total failures: {failures}"),
        format!("# Source log: {file_name}"),
    ];
    summary.extend(
        text.lines()
            .filter(|l| l.contains("WARN") || l.contains("FAIL"))
            .map(ToString::to_string),
    );

    let summary_path = config
        .logs_dir
        .join(format!("{}summary_{timestamp}.log", config.log_prefix));
    fs::write(&summary_path, summary.join("\n") + "\n")
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    info!(
        summary = %summary_path.display(),
        warnings,
        failures,
        "test log summary written"
    );
    Ok(Some(LogScanSummary {
        source_log: latest,
        summary_path,
        warnings,
        failures,
    }))
}

async fn latest_test_log(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    if !fs::try_exists(dir)
        .await
        .with_context(|| format!("checking {}", dir.display()))?
    {
        return Ok(None);
    }

    let summary_prefix = format!("{prefix}summary_");
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) || name.starts_with(&summary_prefix) || !name.ends_with(".log")
        {
            continue;
        }
        let modified = entry.metadata().await?.modified().ok();
        candidates.push((modified, name, entry.path()));
    }

    // Newest by mtime; the timestamped name breaks ties.
    candidates.sort();
    Ok(candidates.pop().map(|(_, _, path)| path))
}
