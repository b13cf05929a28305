//! Persistent records of repositories and workflow runs.

use crate::{parser::JobLogInsight, Result};
use github::{DateTime, WorkflowRun};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

/// `total_runs_90d` of a repository whose runs or logs cannot be fetched
pub const PERMANENT_SCRAPING_ERROR: i64 = -1;
/// `total_runs_90d` of a repository whose import failed and should be retried
pub const TRANSIENT_SCRAPING_ERROR: i64 = -2;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Full name, `owner/name`
    #[serde(rename = "_id")]
    pub name: String,
    /// Part of the scraped population
    #[serde(default)]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub nb_workflows: usize,
    #[serde(default)]
    pub nb_runs: usize,
    /// Runs found at import time, or one of the scraping error sentinels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_runs_90d: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraping_error: Option<String>,
}

impl RepositoryRecord {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Where the log archive of a run ended up
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogsArchive {
    Path { path: PathBuf },
    Error { error: String },
}

impl LogsArchive {
    pub fn path(&self) -> Option<&Path> {
        match self {
            LogsArchive::Path { path } => Some(path),
            LogsArchive::Error { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// `<repo_full_name>_<workflow_path>_<run_number>_<run_attempt>`
    #[serde(rename = "_id")]
    pub id: String,
    pub repository_name: String,
    pub workflow_path: String,
    pub run_number: u64,
    pub run_attempt: u64,
    /// Seconds between the creation of the run and its import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_import: Option<f64>,
    pub metadata: WorkflowRun,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_archive: Option<LogsArchive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_insights: Option<Vec<JobLogInsight>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_logs_size: Option<u64>,
}

impl RunRecord {
    pub fn new(run: WorkflowRun, imported_at: Option<DateTime>) -> Self {
        let time_to_import = imported_at.map(|imported_at| {
            (*imported_at - *run.created_at).num_milliseconds() as f64 / 1000.0
        });

        Self {
            id: run.uid(),
            repository_name: run.repository.full_name.clone(),
            workflow_path: run.path.clone(),
            run_number: run.run_number,
            run_attempt: run.run_attempt,
            time_to_import,
            metadata: run,
            logs_archive: None,
            log_insights: None,
            total_logs_size: None,
        }
    }

    pub fn archive_path(&self) -> Option<&Path> {
        self.logs_archive.as_ref().and_then(LogsArchive::path)
    }
}

/// Access patterns of discovery and of the orchestrator. Every write is
/// idempotent so that a redelivered message can be processed again.
pub trait Store: Send + Sync {
    fn repository(&self, name: &str) -> Result<Option<RepositoryRecord>>;

    fn upsert_repository(&self, record: RepositoryRecord) -> Result<()>;

    /// Selected repositories, ordered by name
    fn selected_repositories(&self) -> Result<Vec<RepositoryRecord>>;

    fn set_etag(&self, name: &str, etag: Option<String>) -> Result<()>;

    fn mark_processed(&self, name: &str, nb_workflows: usize, nb_runs: usize) -> Result<()>;

    /// Clear the `processed` flag of every repository, returns how many were set
    fn reset_processed(&self) -> Result<usize>;

    /// Insert a run unless one with the same id exists. Returns false for a
    /// duplicate.
    fn insert_run(&self, run: RunRecord) -> Result<bool>;

    /// Runs of a repository ordered by workflow path then creation time
    fn runs(&self, repository: &str) -> Result<Vec<RunRecord>>;

    fn latest_run_created_at(&self, repository: &str) -> Result<Option<DateTime>>;

    fn set_logs_archive(&self, id: &str, logs_archive: Option<LogsArchive>) -> Result<()>;

    fn set_log_insights(
        &self,
        id: &str,
        log_insights: Vec<JobLogInsight>,
        total_logs_size: u64,
    ) -> Result<()>;

    fn delete_run(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Documents {
    #[serde(default)]
    repositories: BTreeMap<String, RepositoryRecord>,
    #[serde(default)]
    runs: BTreeMap<String, RunRecord>,
}

/// Document store kept in memory. When opened on a file, a JSON snapshot is
/// written after every change.
#[derive(Debug)]
pub struct DocumentStore {
    path: Option<PathBuf>,
    documents: Mutex<Documents>,
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            documents: Mutex::new(Documents::default()),
        }
    }

    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let documents = if path.exists() {
            let contents = fs::read(&path)?;
            serde_json::from_slice(&contents)?
        } else {
            Documents::default()
        };

        debug!(
            "Store {} opened: {} repositories, {} runs",
            path.display(),
            documents.repositories.len(),
            documents.runs.len()
        );

        Ok(Self {
            path: Some(path),
            documents: Mutex::new(documents),
        })
    }

    fn documents(&self) -> MutexGuard<'_, Documents> {
        // Documents are only replaced field by field, they stay consistent
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, documents: &Documents) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = path.as_os_str().to_os_string();
        partial.push(".part");
        fs::write(&partial, serde_json::to_vec(documents)?)?;
        fs::rename(&partial, path)?;
        Ok(())
    }

    fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Documents) -> T,
    {
        let mut documents = self.documents();
        let result = f(&mut documents);
        self.persist(&documents)?;
        Ok(result)
    }
}

impl Store for DocumentStore {
    fn repository(&self, name: &str) -> Result<Option<RepositoryRecord>> {
        Ok(self.documents().repositories.get(name).cloned())
    }

    fn upsert_repository(&self, record: RepositoryRecord) -> Result<()> {
        self.update(|documents| {
            documents.repositories.insert(record.name.clone(), record);
        })
    }

    fn selected_repositories(&self) -> Result<Vec<RepositoryRecord>> {
        Ok(self
            .documents()
            .repositories
            .values()
            .filter(|r| r.selected)
            .cloned()
            .collect())
    }

    fn set_etag(&self, name: &str, etag: Option<String>) -> Result<()> {
        self.update(|documents| {
            if let Some(repository) = documents.repositories.get_mut(name) {
                repository.etag = etag;
            }
        })
    }

    fn mark_processed(&self, name: &str, nb_workflows: usize, nb_runs: usize) -> Result<()> {
        self.update(|documents| {
            let repository = documents
                .repositories
                .entry(name.to_owned())
                .or_insert_with(|| RepositoryRecord::new(name));
            repository.processed = true;
            repository.nb_workflows = nb_workflows;
            repository.nb_runs = nb_runs;
        })
    }

    fn reset_processed(&self) -> Result<usize> {
        self.update(|documents| {
            let mut count = 0;
            for repository in documents.repositories.values_mut() {
                if repository.processed {
                    repository.processed = false;
                    count += 1;
                }
            }
            count
        })
    }

    fn insert_run(&self, run: RunRecord) -> Result<bool> {
        if self.documents().runs.contains_key(&run.id) {
            return Ok(false);
        }
        self.update(|documents| match documents.runs.entry(run.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(run);
                true
            }
        })
    }

    fn runs(&self, repository: &str) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .documents()
            .runs
            .values()
            .filter(|run| run.repository_name == repository)
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            (&a.workflow_path, a.metadata.created_at).cmp(&(&b.workflow_path, b.metadata.created_at))
        });
        Ok(runs)
    }

    fn latest_run_created_at(&self, repository: &str) -> Result<Option<DateTime>> {
        Ok(self
            .documents()
            .runs
            .values()
            .filter(|run| run.repository_name == repository)
            .map(|run| run.metadata.created_at)
            .max())
    }

    fn set_logs_archive(&self, id: &str, logs_archive: Option<LogsArchive>) -> Result<()> {
        self.update(|documents| {
            if let Some(run) = documents.runs.get_mut(id) {
                run.logs_archive = logs_archive;
            }
        })
    }

    fn set_log_insights(
        &self,
        id: &str,
        log_insights: Vec<JobLogInsight>,
        total_logs_size: u64,
    ) -> Result<()> {
        self.update(|documents| {
            if let Some(run) = documents.runs.get_mut(id) {
                run.log_insights = Some(log_insights);
                run.total_logs_size = Some(total_logs_size);
            }
        })
    }

    fn delete_run(&self, id: &str) -> Result<()> {
        self.update(|documents| {
            documents.runs.remove(id);
        })
    }
}
