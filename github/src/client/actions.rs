use crate::{
    client::{Client, Error, PageOutcome, Request, Result, MAX_RESULTS},
    dedup_and_sort_runs, group_runs_by_workflow, WorkflowRun,
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use reqwest::{header, StatusCode};
use std::time::Instant;

type UtcDateTime = chrono::DateTime<Utc>;

/// Logs are kept 90 days by the platform, older runs are of no use
pub const DEFAULT_HISTORY_DAYS: i64 = 90;

/// Default ceiling on the size of a downloaded log archive
pub const DEFAULT_MAX_LOGS_SIZE: usize = 20_000_000;

/// Items per sub-window we aim for when splitting an overflowing window.
/// Runs are not evenly spread in time, so this leaves a 25% margin below
/// `MAX_RESULTS`.
const SPLIT_TARGET: u64 = MAX_RESULTS * 4 / 5;

/// Nesting of splits before giving up on a window
const MAX_SPLIT_DEPTH: usize = 32;

const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S+00:00";

/// Range of run creation times. An open window has no upper bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: UtcDateTime,
    pub to: Option<UtcDateTime>,
}

impl TimeWindow {
    pub fn since(from: UtcDateTime) -> Self {
        Self { from, to: None }
    }

    pub fn between(from: UtcDateTime, to: UtcDateTime) -> Self {
        Self { from, to: Some(to) }
    }

    pub fn last_days(days: i64, now: UtcDateTime) -> Self {
        Self::since(now - Duration::days(days))
    }

    /// Value of the `created` query parameter
    pub fn created_query(&self) -> String {
        match self.to {
            Some(to) => format!(
                "{}..{}",
                self.from.format(CREATED_FORMAT),
                to.format(CREATED_FORMAT)
            ),
            None => format!(">{}", self.from.format(CREATED_FORMAT)),
        }
    }

    /// Split into `periods` consecutive windows of equal duration (to the
    /// millisecond). An open window is closed at `now` first.
    pub fn split(&self, periods: usize, now: UtcDateTime) -> Vec<TimeWindow> {
        let periods = periods.max(1);
        let to = self.to.unwrap_or(now);
        let total = (to - self.from).num_milliseconds().max(0);
        let (step, remainder) = (total / periods as i64, total % periods as i64);

        let edge = |i: i64| self.from + Duration::milliseconds(i * step + i.min(remainder));
        debug!("Splitting {} to {} into {} periods", self.from, to, periods);
        (0..periods as i64)
            .map(|i| TimeWindow::between(edge(i), edge(i + 1)))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct ListWorkflowRunsOptions {
    /// Default: completed
    pub status: String,

    /// Default: the last 90 days
    pub window: Option<TimeWindow>,

    /// Default: 100
    pub per_page: usize,

    /// Stop once that many runs were collected
    pub limit: Option<usize>,
}

impl Default for ListWorkflowRunsOptions {
    fn default() -> Self {
        Self {
            status: "completed".to_owned(),
            window: None,
            per_page: 100,
            limit: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunsChange {
    /// No previous ETag to compare against
    Unknown,
    Changed,
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunsPoll {
    pub change: RunsChange,
    /// ETag returned by the API, to be passed to the next poll
    pub etag: Option<String>,
}

/// `ActionsClient` handles communication with the Actions related methods of the GitHub API.
///
/// GitHub API docs: https://docs.github.com/en/rest/actions/workflow-runs
pub struct ActionsClient<'a> {
    inner: &'a Client,
}

impl<'a> ActionsClient<'a> {
    pub(super) fn new(client: &'a Client) -> Self {
        Self { inner: client }
    }

    async fn list_window(
        &self,
        full_name: &str,
        options: &ListWorkflowRunsOptions,
        window: &TimeWindow,
        limit: Option<usize>,
    ) -> Result<PageOutcome<WorkflowRun>> {
        let request = self
            .inner
            .get(&format!("repos/{}/actions/runs", full_name))
            .query("status", &options.status)
            .query("created", window.created_query())
            .query("per_page", options.per_page);

        self.inner.get_pages(request, "workflow_runs", limit).await
    }

    /// List the runs of a repository, deduplicated and sorted by (workflow
    /// path, run number, run attempt).
    ///
    /// A window matching more runs than the API lets us walk through is split
    /// in smaller windows. A sub-window that still overflows is split again
    /// on its own, the runs of its siblings are kept.
    pub async fn list_workflow_runs(
        &self,
        full_name: &str,
        options: &ListWorkflowRunsOptions,
    ) -> Result<Vec<WorkflowRun>> {
        let now = Utc::now();
        let window = options
            .window
            .unwrap_or_else(|| TimeWindow::last_days(DEFAULT_HISTORY_DAYS, now));

        let runs = match self.list_window(full_name, options, &window, options.limit).await? {
            PageOutcome::Complete(runs) => runs,
            PageOutcome::Overflow { total_count } => {
                let mut runs = Vec::new();
                self.list_split(full_name, options, window, total_count, now, 1, &mut runs)
                    .await?;
                runs
            }
        };

        Ok(dedup_and_sort_runs(runs))
    }

    /// Split an overflowing `window` into `total_count / SPLIT_TARGET + 1`
    /// periods and list each of them into `runs`, recursing into the periods
    /// that overflow too.
    #[allow(clippy::too_many_arguments)]
    fn list_split<'s>(
        &'s self,
        full_name: &'s str,
        options: &'s ListWorkflowRunsOptions,
        window: TimeWindow,
        total_count: u64,
        now: UtcDateTime,
        depth: usize,
        runs: &'s mut Vec<WorkflowRun>,
    ) -> BoxFuture<'s, Result<()>> {
        async move {
            let to = window.to.unwrap_or(now);
            if depth > MAX_SPLIT_DEPTH || to - window.from <= Duration::seconds(1) {
                error!(
                    "{}: {} results created {}, the window cannot be split further",
                    full_name,
                    total_count,
                    window.created_query()
                );
                return Ok(());
            }

            let periods = (total_count / SPLIT_TARGET + 1) as usize;
            info!(
                "{} results found: splitting time range into {} chunks",
                total_count, periods
            );

            for sub_window in window.split(periods, now) {
                if options.limit.map_or(false, |limit| runs.len() >= limit) {
                    break;
                }
                debug!("Fetching runs created {}...", sub_window.created_query());
                let remaining = options.limit.map(|limit| limit - runs.len());

                match self.list_window(full_name, options, &sub_window, remaining).await? {
                    PageOutcome::Complete(sub_runs) => {
                        debug!("{} runs found", sub_runs.len());
                        runs.extend(sub_runs);
                    }
                    PageOutcome::Overflow { total_count } => {
                        debug!("Still too many results ({}) in a chunk", total_count);
                        self.list_split(
                            full_name,
                            options,
                            sub_window,
                            total_count,
                            now,
                            depth + 1,
                            runs,
                        )
                        .await?;
                    }
                }
            }

            Ok(())
        }
        .boxed()
    }

    /// Same as `list_workflow_runs`, grouped by workflow path
    pub async fn list_workflow_runs_by_workflow(
        &self,
        full_name: &str,
        options: &ListWorkflowRunsOptions,
    ) -> Result<Vec<(String, Vec<WorkflowRun>)>> {
        let runs = self.list_workflow_runs(full_name, options).await?;
        Ok(group_runs_by_workflow(runs))
    }

    /// Cheap check for new completed runs: a single-item listing sent with
    /// `If-None-Match`. A `304 Not Modified` does not count against the quota.
    pub async fn poll_workflow_runs(&self, full_name: &str, etag: Option<&str>) -> Result<RunsPoll> {
        let mut request = self
            .inner
            .get(&format!("repos/{}/actions/runs", full_name))
            .query("status", "completed")
            .query("per_page", 1);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag)?;
        }

        let response = self.inner.execute(request).await?;
        let new_etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);

        let change = match etag {
            None => RunsChange::Unknown,
            Some(_) if response.status() == StatusCode::NOT_MODIFIED => RunsChange::Unchanged,
            Some(_) => RunsChange::Changed,
        };

        Ok(RunsPoll {
            change,
            etag: new_etag,
        })
    }

    /// Download the log archive of a run. The download is aborted as soon as
    /// more than `max_size` bytes were received.
    pub async fn download_logs(&self, logs_url: &str, max_size: usize) -> Result<Bytes> {
        let start = Instant::now();
        let response = self.inner.execute(Request::get(logs_url)).await?;

        let content = response.bytes_limited(max_size).await.map_err(|e| {
            if let Error::PayloadTooLarge { .. } = e {
                warn!("Logs archive is too big: aborting download");
            }
            e
        })?;

        let elapsed = start.elapsed();
        debug!(
            "Logs archive of {:.2}MB downloaded in {}ms ({:.2}MB/s)",
            content.len() as f64 / 1024f64.powi(2),
            elapsed.as_millis(),
            content.len() as f64 / 1024f64.powi(2) / elapsed.as_secs_f64().max(0.001),
        );

        Ok(content)
    }
}
