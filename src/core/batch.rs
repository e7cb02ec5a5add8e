//! Hand-off of scheduled assignments to the batch system.

use crate::core::catalog::Catalog;
use crate::core::job::{Assignment, Submission};
use crate::core::store::{DocumentStore, StateLayout};
use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

pub const DEFAULT_SUBMIT_COMMAND: &str = "sbatch";
pub const DEFAULT_MAIL_TYPE: &str = "ALL";
pub const DEFAULT_CPU_MEM_GB: u32 = 32;

static SUBMITTED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("job id pattern is valid"));

/// Settings for rendering and submitting batch scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitSettings {
    pub command: String,
    pub user_mail: Option<String>,
    pub mail_type: String,
    pub cpu_mem_gb: u32,
    /// Scripts are written under a per-day directory below this one
    pub scripts_dir: PathBuf,
    /// Ask for the host the scheduler picked instead of any host of the partition
    pub pin_host: bool,
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self {
            command: DEFAULT_SUBMIT_COMMAND.to_string(),
            user_mail: None,
            mail_type: DEFAULT_MAIL_TYPE.to_string(),
            cpu_mem_gb: DEFAULT_CPU_MEM_GB,
            scripts_dir: PathBuf::from("slurms"),
            pin_host: false,
        }
    }
}

/// A rendered submission script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchScript {
    pub name: String,
    pub path: PathBuf,
    pub output: PathBuf,
    pub text: String,
}

impl BatchScript {
    /// Write the script, creating its directory and the output directory.
    pub fn save(&self) -> Result<()> {
        for dir in [self.path.parent(), self.output.parent()].into_iter().flatten() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        fs::write(&self.path, &self.text)
            .with_context(|| format!("Failed to write script {}", self.path.display()))
    }
}

/// `<scripts_dir>/year_<Y>_week_<W>_day_<D>` for the ISO week date of `date`.
pub fn script_dir(scripts_dir: &Path, date: NaiveDate) -> PathBuf {
    let week = date.iso_week();
    scripts_dir.join(format!(
        "year_{}_week_{}_day_{}",
        week.year(),
        week.week(),
        date.weekday().number_from_monday()
    ))
}

/// Render the submission script of `assignment` into `dir`.
pub fn render_script(
    catalog: &Catalog,
    settings: &SubmitSettings,
    assignment: &Assignment,
    dir: &Path,
) -> Result<BatchScript> {
    let job = &assignment.job;
    let name = job.display_name();
    let path = dir.join(&name);
    let output = dir.join("outputs").join(&name);

    let account = catalog.partition_account(&assignment.partition)?;
    let time_limit = catalog.partition_time_limit(&assignment.partition)?;
    let library_path = catalog.library_path(&job.cuda_version)?;

    let mut text = String::from("#!/bin/bash\n#\n");
    let mut sbatch = |option: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(text, "#SBATCH --{option}={value}");
    };
    sbatch(
        "gres",
        &format!("gpu:{}:{}", assignment.gpu_type, assignment.num_gpus),
    );
    sbatch("partition", &assignment.partition);
    sbatch("account", &account);
    if let Some(mail) = &settings.user_mail {
        sbatch("mail-user", mail);
        sbatch("mail-type", &settings.mail_type);
    }
    sbatch("nodes", &1);
    sbatch("ntasks", &1);
    sbatch("time", &time_limit);
    sbatch("mem", &format!("{}G", settings.cpu_mem_gb));
    sbatch("job-name", &name);
    sbatch("output", &output.display());
    sbatch("error", &output.display());
    if settings.pin_host {
        sbatch("nodelist", &assignment.host);
    }

    if let Some(work_dir) = &job.work_dir {
        let work_dir = std::path::absolute(work_dir)
            .with_context(|| format!("Invalid work directory {}", work_dir.display()))?;
        let _ = writeln!(
            text,
            "WORK_DIR={}",
            shell_escape::escape(work_dir.to_string_lossy())
        );
    }
    let _ = writeln!(text, "export LD_LIBRARY_PATH={library_path}");
    if job.work_dir.is_some() {
        text.push_str("echo \"Work Dir : $WORK_DIR\"\ncd \"$WORK_DIR\"\n");
    }
    text.push('\n');

    if let Some(env) = &job.env {
        let activate = env.join("bin").join("activate");
        let _ = writeln!(
            text,
            "# Activate environment\nsource {}",
            shell_escape::escape(activate.to_string_lossy())
        );
    }
    text.push_str("nvidia-smi\n");
    text.push_str("python -c \"import torch; torch.cuda.is_available()\"\n\n");
    for command in &job.commands {
        let _ = writeln!(text, "{command}\n");
    }

    Ok(BatchScript {
        name,
        path,
        output,
        text,
    })
}

/// Submits a script to the batch system and returns its raw output.
#[cfg_attr(test, mockall::automock)]
pub trait BatchSubmitter {
    fn submit(&self, script: &Path) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct SbatchSubmitter {
    command: String,
}

impl SbatchSubmitter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl BatchSubmitter for SbatchSubmitter {
    fn submit(&self, script: &Path) -> Result<String> {
        let output = Command::new(&self.command)
            .arg(script)
            .output()
            .with_context(|| format!("Failed to run '{}'", self.command))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(anyhow!(
                "'{}' rejected {} ({}): {}",
                self.command,
                script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(stdout)
    }
}

/// External job id from the output of the submission command.
pub fn parse_job_id(output: &str) -> Option<String> {
    SUBMITTED_ID
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// What a hand-off did for one partition.
#[derive(Debug, Default)]
pub struct HandOffReport {
    pub submitted: Vec<Assignment>,
    /// Assignments put back for a later attempt
    pub failed: Vec<Assignment>,
    pub scripts: Vec<BatchScript>,
}

/// Consumes assignment documents and submits them.
pub struct HandOff {
    catalog: Catalog,
    store: DocumentStore,
    layout: StateLayout,
    settings: SubmitSettings,
}

impl HandOff {
    pub fn new(
        catalog: Catalog,
        store: DocumentStore,
        layout: StateLayout,
        settings: SubmitSettings,
    ) -> Self {
        Self {
            catalog,
            store,
            layout,
            settings,
        }
    }

    fn render_all(&self, assignments: &[Assignment], dir: &Path) -> Result<Vec<BatchScript>> {
        assignments
            .iter()
            .map(|a| render_script(&self.catalog, &self.settings, a, dir))
            .collect()
    }

    /// Render the scripts of a partition's pending assignments without taking them.
    pub fn preview(&self, partition: &str, today: NaiveDate) -> Result<Vec<BatchScript>> {
        let path = self.layout.assignments_path(partition);
        let assignments: Vec<Assignment> = self.store.read_optional(&path)?.unwrap_or_default();
        self.render_all(&assignments, &script_dir(&self.settings.scripts_dir, today))
    }

    /// Submit every pending assignment of `partition`.
    ///
    /// The assignment document is emptied under its lock before anything is
    /// submitted. Submitted assignments are recorded under `submitted/`; failed
    /// ones are written back to the assignment document.
    pub fn submit_partition(
        &self,
        submitter: &dyn BatchSubmitter,
        partition: &str,
        today: NaiveDate,
    ) -> Result<HandOffReport> {
        let path = self.layout.assignments_path(partition);
        let dir = script_dir(&self.settings.scripts_dir, today);

        // Render inside the update so a configuration error leaves the document intact
        let (assignments, scripts) = self
            .store
            .update(&path, |pending: &mut Vec<Assignment>| {
                let scripts = self.render_all(pending, &dir)?;
                Ok((std::mem::take(pending), scripts))
            })
            .with_context(|| format!("Failed to take assignments of partition '{partition}'"))?;

        let mut report = HandOffReport::default();
        if assignments.is_empty() {
            tracing::info!("No assignments to submit for partition '{}'", partition);
            return Ok(report);
        }

        for (mut assignment, script) in assignments.into_iter().zip(scripts) {
            let outcome = script.save().and_then(|()| submitter.submit(&script.path));
            match outcome {
                Ok(output) => {
                    let external_id = parse_job_id(&output);
                    tracing::info!(
                        "Submitted {} to {}/{} as {}",
                        script.name,
                        assignment.partition,
                        assignment.host,
                        external_id.as_deref().unwrap_or("<unknown>")
                    );
                    assignment.submission = Submission {
                        submitted: true,
                        external_id,
                        status: Some(output),
                    };
                    report.submitted.push(assignment);
                }
                Err(e) => {
                    tracing::error!("Failed to submit {}: {:#}", script.name, e);
                    assignment.submission.status = Some(format!("{e:#}"));
                    report.failed.push(assignment);
                }
            }
            report.scripts.push(script);
        }

        if !report.submitted.is_empty() {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%6f").to_string();
            self.store
                .write(&self.layout.submitted_path(partition, &stamp), &report.submitted)
                .context("Failed to record submitted assignments")?;
        }
        if !report.failed.is_empty() {
            let failed = report.failed.clone();
            self.store
                .update(&path, move |pending: &mut Vec<Assignment>| {
                    let newer = std::mem::replace(pending, failed);
                    pending.extend(newer);
                    Ok(())
                })
                .context("Failed to put back unsubmitted assignments")?;
        }

        Ok(report)
    }
}
