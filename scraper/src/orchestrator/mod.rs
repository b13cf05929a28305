//! Per-repository processing cycle: retention, archive download and log
//! parsing.

mod reprocess;

pub use reprocess::needs_reparse;

use crate::{
    archive::{archive_path, zip_to_tar_gz},
    config::OrchestratorConfig,
    parser::{scan, JobLogInsight, LogParser, ScannedLog, StepKind},
    store::{LogsArchive, RunRecord, Store},
    Result,
};
use flate2::read::GzDecoder;
use github::WorkflowRun;
use log::{debug, info, warn};
use regex::Regex;
use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

/// Job logs are the `.txt` files at the root of a run archive, nested files
/// are the logs of individual steps
static JOB_LOG_PATH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^/]*\.txt$").unwrap());

/// What a cycle did to a repository
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub workflows: usize,
    pub retained_runs: usize,
    pub deleted_runs: usize,
    pub downloaded: usize,
    pub parsed: usize,
    pub corrupted: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedRun {
    pub insights: Vec<JobLogInsight>,
    pub total_logs_size: u64,
}

impl ParsedRun {
    fn has_errors(&self) -> bool {
        self.insights.iter().any(|insight| {
            insight.error.is_some()
                || insight.steps.iter().any(|step| match &step.kind {
                    StepKind::Shell(shell) => shell.error.is_some(),
                    StepKind::Action(_) => false,
                })
        })
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    Parsed(ParsedRun),
    /// Every job was handled, but some jobs or shell steps carry an error
    PartialWithErrors(ParsedRun),
    /// The archive could not be read
    Corrupted(String),
}

/// A job log as read from the archive, before the shell steps are resolved
enum ArchivedJob {
    Reused(JobLogInsight),
    Skipped(JobLogInsight),
    Scanned {
        file: String,
        size: u64,
        scanned: ScannedLog,
        elapsed: Duration,
    },
}

/// Read the job logs of a tar.gz run archive. Any io error means the
/// archive is corrupted.
fn read_archive(
    path: &Path,
    previous: &[JobLogInsight],
    max_log_size: u64,
    denylist: &[String],
) -> io::Result<Vec<ArchivedJob>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut jobs = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let file = entry.path()?.to_string_lossy().into_owned();
        if !JOB_LOG_PATH.is_match(&file) {
            continue;
        }
        let size = entry.header().size()?;

        if let Some(insight) = previous.iter().find(|insight| insight.file == file) {
            if insight.error.is_none() && !needs_reparse(insight, denylist) {
                debug!("Job {} already parsed: reusing results", file);
                jobs.push(ArchivedJob::Reused(insight.clone()));
                continue;
            }
        }

        debug!("Log size: {:.2}MB", size as f64 / 1e6);
        if size > max_log_size {
            warn!("Log {} too large: ignored", file);
            jobs.push(ArchivedJob::Skipped(JobLogInsight::failed(
                file,
                size,
                "Log too large",
            )));
            continue;
        }

        let mut content = Vec::with_capacity(size as usize);
        entry.read_to_end(&mut content)?;
        let start = Instant::now();
        let scanned = scan(&String::from_utf8_lossy(&content));
        jobs.push(ArchivedJob::Scanned {
            file,
            size,
            scanned,
            elapsed: start.elapsed(),
        });
    }

    Ok(jobs)
}

fn remove_archive(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    github: Arc<github::Client>,
    parser: LogParser,
    logs_dir: PathBuf,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        github: Arc<github::Client>,
        parser: LogParser,
        logs_dir: PathBuf,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            github,
            parser,
            logs_dir,
            config,
        }
    }

    /// Run a full cycle on a repository. Failures local to a run are
    /// recorded on the run, only store failures are returned.
    pub async fn process_repository(&self, name: &str) -> Result<CycleSummary> {
        info!("Processing {}...", name);

        let groups = group_by_workflow(self.store.runs(name)?);
        let mut summary = CycleSummary {
            workflows: groups.len(),
            ..Default::default()
        };

        for (workflow_path, mut runs) in groups {
            // Runs are sorted by creation time, the most recent ones are last
            let retained = runs.split_off(runs.len().saturating_sub(self.config.retention));
            for run in &runs {
                self.delete_run(run)?;
            }
            info!(
                "{} {}: {} runs deleted, {} runs to process",
                name,
                workflow_path,
                runs.len(),
                retained.len()
            );
            summary.deleted_runs += runs.len();
            summary.retained_runs += retained.len();

            for run in retained {
                self.process_run(run, &mut summary).await?;
            }
        }

        self.store
            .mark_processed(name, summary.workflows, summary.retained_runs)?;
        info!("{} processed: {:?}", name, summary);
        Ok(summary)
    }

    async fn process_run(&self, mut run: RunRecord, summary: &mut CycleSummary) -> Result<()> {
        if needs_download(&run) {
            if self.github.credential_available() {
                let logs_archive = self.download(&run.metadata).await;
                if logs_archive.path().is_some() {
                    summary.downloaded += 1;
                }
                self.store
                    .set_logs_archive(&run.id, Some(logs_archive.clone()))?;
                run.logs_archive = Some(logs_archive);
            } else {
                debug!("No token available: download of {} skipped", run.id);
            }
        }

        // The download may have failed
        let path = match run.archive_path() {
            Some(path) => path.to_owned(),
            None => return Ok(()),
        };

        let previous = run.log_insights.take().unwrap_or_default();
        match self.parse_archive(&path, previous).await? {
            ParseOutcome::Parsed(parsed) | ParseOutcome::PartialWithErrors(parsed) => {
                info!("{}: {} jobs parsed", run.id, parsed.insights.len());
                self.store
                    .set_log_insights(&run.id, parsed.insights, parsed.total_logs_size)?;
                summary.parsed += 1;
            }
            ParseOutcome::Corrupted(error) => {
                warn!(
                    "Deleting {} because it is corrupted: {}",
                    path.display(),
                    error
                );
                remove_archive(&path)?;
                self.store.set_logs_archive(&run.id, None)?;
                summary.corrupted += 1;
            }
        }

        Ok(())
    }

    fn delete_run(&self, run: &RunRecord) -> Result<()> {
        if let Some(path) = run.archive_path() {
            debug!("Deleting {}", path.display());
            remove_archive(path)?;
        }
        self.store.delete_run(&run.id)
    }

    /// Fetch and store the log archive of a run. Failures end up in the
    /// returned value.
    async fn download(&self, run: &WorkflowRun) -> LogsArchive {
        let age = chrono::Utc::now() - *run.created_at;
        if age > chrono::Duration::days(self.config.max_run_age_days) {
            warn!("Run ran more than {}d ago: log was likely deleted", self.config.max_run_age_days);
            return LogsArchive::Error {
                error: format!("More than {}d old", self.config.max_run_age_days),
            };
        }

        match self.fetch_archive(run).await {
            Ok(path) => {
                info!("Logs saved to {}", path.display());
                LogsArchive::Path { path }
            }
            Err(e) => {
                warn!("Fail to download log '{}': {}", run.logs_url, e);
                LogsArchive::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn fetch_archive(&self, run: &WorkflowRun) -> Result<PathBuf> {
        let content = self
            .github
            .actions()
            .download_logs(&run.logs_url, self.config.max_archive_size)
            .await?;

        let path = archive_path(&self.logs_dir, run);
        let destination = path.clone();
        let entries =
            tokio::task::spawn_blocking(move || zip_to_tar_gz(&content, &destination)).await??;
        debug!("{} archive entries converted", entries);
        Ok(path)
    }

    /// Compute the insights of every job of a run archive, reusing the
    /// `previous` ones that are still trusted.
    pub async fn parse_archive(
        &self,
        path: &Path,
        previous: Vec<JobLogInsight>,
    ) -> Result<ParseOutcome> {
        let archive = path.to_owned();
        let max_log_size = self.config.max_log_size;
        let denylist = self.config.reprocess_denylist.clone();
        let read = tokio::task::spawn_blocking(move || {
            read_archive(&archive, &previous, max_log_size, &denylist)
        })
        .await?;

        let jobs = match read {
            Ok(jobs) => jobs,
            Err(e) => return Ok(ParseOutcome::Corrupted(e.to_string())),
        };

        let mut parsed = ParsedRun::default();
        for job in jobs {
            match job {
                ArchivedJob::Reused(insight) | ArchivedJob::Skipped(insight) => {
                    parsed.total_logs_size += insight.log_size;
                    parsed.insights.push(insight);
                }
                ArchivedJob::Scanned {
                    file,
                    size,
                    scanned,
                    elapsed,
                } => {
                    let start = Instant::now();
                    let insight = self.parser.resolve(&file, scanned).await;
                    info!(
                        "Log parsed in {}ms",
                        (elapsed + start.elapsed()).as_millis()
                    );
                    parsed.total_logs_size += size;
                    parsed.insights.push(insight);
                }
            }
        }

        if parsed.has_errors() {
            Ok(ParseOutcome::PartialWithErrors(parsed))
        } else {
            Ok(ParseOutcome::Parsed(parsed))
        }
    }
}

/// A run is downloaded when it has no archive yet, or when its archive file
/// went missing. A recorded download error is final.
fn needs_download(run: &RunRecord) -> bool {
    match &run.logs_archive {
        None => true,
        Some(LogsArchive::Path { path }) => !path.is_file(),
        Some(LogsArchive::Error { .. }) => false,
    }
}

/// Group runs sorted by workflow path
fn group_by_workflow(runs: Vec<RunRecord>) -> Vec<(String, Vec<RunRecord>)> {
    let mut groups: Vec<(String, Vec<RunRecord>)> = Vec::new();
    for run in runs {
        match groups.last_mut() {
            Some((path, group)) if *path == run.workflow_path => group.push(run),
            _ => groups.push((run.workflow_path.clone(), vec![run])),
        }
    }
    groups
}

#[cfg(test)]
mod test;
