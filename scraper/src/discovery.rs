//! Discovery of new workflow runs.
//!
//! Repositories are polled with conditional requests. When something
//! changed, the new runs are stored and the repository is queued for the
//! workers.

use crate::{
    config::DiscoveryConfig,
    queue::{publish_repository, Queue},
    store::{RepositoryRecord, RunRecord, Store, PERMANENT_SCRAPING_ERROR, TRANSIENT_SCRAPING_ERROR},
    Error, Result,
};
use github::{
    client::{ListWorkflowRunsOptions, RunsChange, TimeWindow, DEFAULT_MAX_LOGS_SIZE},
    DateTime, WorkflowRun,
};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The ETag matched, nothing was listed
    Unchanged,
    Refreshed { found: usize, inserted: usize },
}

/// Why a repository could not be imported, with the sentinel recorded as
/// its run count
#[derive(Debug)]
struct ScrapingError {
    code: i64,
    error: Error,
}

impl ScrapingError {
    fn permanent<E: Into<Error>>(error: E) -> Self {
        Self {
            code: PERMANENT_SCRAPING_ERROR,
            error: error.into(),
        }
    }
}

impl From<Error> for ScrapingError {
    fn from(error: Error) -> Self {
        let code = match &error {
            Error::Github(e) if e.is_permanent() => PERMANENT_SCRAPING_ERROR,
            _ => TRANSIENT_SCRAPING_ERROR,
        };
        Self { code, error }
    }
}

impl From<github::client::Error> for ScrapingError {
    fn from(error: github::client::Error) -> Self {
        Error::from(error).into()
    }
}

pub struct Discovery {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    /// Token pool used to list runs and download logs
    github: Arc<github::Client>,
    /// ETags are tied to the token that obtained them
    poll_github: Arc<github::Client>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        github: Arc<github::Client>,
        poll_github: Arc<github::Client>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            store,
            queue,
            github,
            poll_github,
            config,
        }
    }

    /// Store the runs completed since the last refresh and queue the
    /// repository when some were found.
    pub async fn refresh_repository(&self, name: &str) -> Result<RefreshOutcome> {
        let previous_etag = self.store.repository(name)?.and_then(|r| r.etag);
        let poll = self
            .poll_github
            .actions()
            .poll_workflow_runs(name, previous_etag.as_deref())
            .await?;

        if poll.change == RunsChange::Unchanged {
            info!("{}: ETag matched, no new run to scrape", name);
            return Ok(RefreshOutcome::Unchanged);
        }
        self.store.set_etag(name, poll.etag)?;

        let latest = if self.config.force_scrape_all {
            None
        } else {
            self.store.latest_run_created_at(name)?
        };
        let window = match latest {
            Some(latest) => {
                debug!("{}: latest scraped run created at {}", name, latest);
                TimeWindow::since(latest.into_inner())
            }
            None => {
                info!("No previous run for {} or force_scrape_all enabled", name);
                TimeWindow::last_days(self.config.history_days, chrono::Utc::now())
            }
        };

        let options = ListWorkflowRunsOptions {
            window: Some(window),
            limit: Some(self.config.max_runs),
            ..Default::default()
        };
        let runs = self.github.actions().list_workflow_runs(name, &options).await?;
        let found = runs.len();
        info!("{} new runs found for {}", found, name);

        let inserted = self.insert_runs(runs, Some(DateTime::now()))?;
        info!("{} runs inserted for {}", inserted, name);

        if found > 0 {
            publish_repository(self.queue.as_ref(), name).await?;
        }

        Ok(RefreshOutcome::Refreshed { found, inserted })
    }

    /// Insert the runs that have logs. Runs still without logs are skipped
    /// so that they can be inserted once they have some.
    fn insert_runs(&self, runs: Vec<WorkflowRun>, imported_at: Option<DateTime>) -> Result<usize> {
        let mut inserted = 0;
        for run in runs {
            if !run.has_logs() {
                debug!("Run {} ignored because conclusion={:?}", run.id, run.conclusion);
                continue;
            }

            let record = RunRecord::new(run, imported_at);
            let id = record.id.clone();
            if self.store.insert_run(record)? {
                inserted += 1;
            } else {
                warn!("{} already imported", id);
            }
        }
        Ok(inserted)
    }

    /// First sight of a repository. Returns `None` when it was already
    /// imported. A failure is recorded on the repository rather than
    /// returned.
    pub async fn import_repository(&self, name: &str) -> Result<Option<RepositoryRecord>> {
        if self.store.repository(name)?.is_some() {
            debug!("Repository {} already imported: ignored", name);
            return Ok(None);
        }
        info!("Importing {}...", name);

        let mut record = RepositoryRecord::new(name);
        match self.import_runs(name).await {
            Ok(total) => {
                record.selected = true;
                record.total_runs_90d = Some(total as i64);
            }
            Err(ScrapingError { code, error }) => {
                warn!("Fail to import {}: {}", name, error);
                record.total_runs_90d = Some(code);
                record.scraping_error = Some(error.to_string());
            }
        }

        // Recorded only after its runs
        self.store.upsert_repository(record.clone())?;
        Ok(Some(record))
    }

    async fn import_runs(&self, name: &str) -> std::result::Result<usize, ScrapingError> {
        let options = ListWorkflowRunsOptions {
            window: Some(TimeWindow::last_days(
                self.config.history_days,
                chrono::Utc::now(),
            )),
            limit: Some(self.config.max_runs),
            ..Default::default()
        };
        let workflows = self
            .github
            .actions()
            .list_workflow_runs_by_workflow(name, &options)
            .await?;

        let runs: Vec<WorkflowRun> = workflows.into_iter().flat_map(|(_, runs)| runs).collect();
        info!("{} runs found for {}", runs.len(), name);

        // Make sure logs can be downloaded for this repository
        if let Some(latest) = runs.iter().max_by_key(|run| run.created_at) {
            self.github
                .actions()
                .download_logs(&latest.logs_url, DEFAULT_MAX_LOGS_SIZE)
                .await
                .map_err(|e| {
                    info!(
                        "Cannot fetch logs ({}) at {}: repository will be ignored",
                        e, latest.logs_url
                    );
                    ScrapingError::permanent(e)
                })?;
        }

        let total = runs.len();
        let inserted = self.insert_runs(runs, None)?;
        debug!("{} runs inserted for {}", inserted, name);
        Ok(total)
    }

    /// Import every repository of `names`, one at a time. Returns how many
    /// were imported, failures included.
    pub async fn import_all(&self, names: &[String]) -> usize {
        let mut imported = 0;
        for (i, name) in names.iter().enumerate() {
            debug!("Repository {}/{}", i + 1, names.len());
            match self.import_repository(name).await {
                Ok(Some(_)) => imported += 1,
                Ok(None) => {}
                Err(e) => error!("Fail to process {}: {}", name, e),
            }
        }
        imported
    }

    /// Refresh every selected repository, in name order
    pub async fn sweep(&self) -> Result<()> {
        info!("Fetching repositories...");
        let repositories = self.store.selected_repositories()?;
        if repositories.is_empty() {
            warn!("No repository selected");
        }

        for repository in repositories {
            if let Err(e) = self.refresh_repository(&repository.name).await {
                error!("Fail to process repo '{}': {}", repository.name, e);
            }
        }
        Ok(())
    }

    /// Sweep until `shutdown` turns true, pausing between sweeps
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        while !*shutdown.borrow() {
            tokio::select! {
                result = self.sweep() => result?,
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Discovery stopped");
        Ok(())
    }

    /// Queue the selected repositories that were not processed yet
    pub async fn enqueue_unprocessed(&self) -> Result<usize> {
        let mut count = 0;
        for repository in self.store.selected_repositories()? {
            if !repository.processed {
                publish_repository(self.queue.as_ref(), &repository.name).await?;
                count += 1;
            }
        }
        info!("{} unprocessed repositories queued", count);
        Ok(count)
    }

    /// Mark every repository as unprocessed and queue all selected ones in
    /// random order
    pub async fn reprocess_all(&self) -> Result<usize> {
        info!("Resetting processed flag to false for all repositories...");
        let reset = self.store.reset_processed()?;
        debug!("{} repositories reset", reset);

        let mut repositories = self.store.selected_repositories()?;
        repositories.shuffle(&mut rand::thread_rng());
        for repository in &repositories {
            publish_repository(self.queue.as_ref(), &repository.name).await?;
        }

        info!("{} repositories queued for reprocessing", repositories.len());
        Ok(repositories.len())
    }
}
