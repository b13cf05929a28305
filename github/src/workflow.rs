use crate::DateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Conclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Stale,
    StartupFailure,
    /// Kept verbatim so that the stored run stays as the API returned it
    Other(String),
}

impl Conclusion {
    /// Only these conclusions leave a complete log archive behind
    pub fn has_logs(&self) -> bool {
        matches!(
            self,
            Conclusion::Success | Conclusion::Failure | Conclusion::TimedOut
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Neutral => "neutral",
            Conclusion::Cancelled => "cancelled",
            Conclusion::Skipped => "skipped",
            Conclusion::TimedOut => "timed_out",
            Conclusion::ActionRequired => "action_required",
            Conclusion::Stale => "stale",
            Conclusion::StartupFailure => "startup_failure",
            Conclusion::Other(other) => other,
        }
    }
}

impl From<String> for Conclusion {
    fn from(conclusion: String) -> Self {
        match conclusion.as_str() {
            "success" => Conclusion::Success,
            "failure" => Conclusion::Failure,
            "neutral" => Conclusion::Neutral,
            "cancelled" => Conclusion::Cancelled,
            "skipped" => Conclusion::Skipped,
            "timed_out" => Conclusion::TimedOut,
            "action_required" => Conclusion::ActionRequired,
            "stale" => Conclusion::Stale,
            "startup_failure" => Conclusion::StartupFailure,
            _ => Conclusion::Other(conclusion),
        }
    }
}

impl Serialize for Conclusion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Conclusion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Conclusion::from)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunRepository {
    pub full_name: String,
}

/// A workflow run as returned by `GET repos/{owner}/{repo}/actions/runs`.
///
/// Fields the scraper does not look at are kept untouched in `extra` so that
/// the platform-native object can be stored as-is.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct WorkflowRun {
    pub id: u64,
    /// Display name of the workflow, null for some runs
    #[serde(default)]
    pub name: Option<String>,
    /// Path of the workflow file, e.g. `.github/workflows/ci.yml`
    pub path: String,
    pub run_number: u64,
    #[serde(default = "first_attempt")]
    pub run_attempt: u64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<Conclusion>,
    pub created_at: DateTime,
    pub logs_url: String,
    pub repository: RunRepository,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn first_attempt() -> u64 {
    1
}

impl WorkflowRun {
    /// Globally unique identifier of a run attempt:
    /// `<repo_full_name>_<workflow_path>_<run_number>_<run_attempt>`
    pub fn uid(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.repository.full_name, self.path, self.run_number, self.run_attempt
        )
    }

    pub fn has_logs(&self) -> bool {
        self.conclusion.as_ref().map_or(false, Conclusion::has_logs)
    }

    fn sort_key(&self) -> (&str, u64, u64) {
        (&self.path, self.run_number, self.run_attempt)
    }
}

/// Remove duplicates (the API can return the same run on adjacent pages) and
/// sort by (workflow path, run number, run attempt).
pub fn dedup_and_sort_runs(runs: Vec<WorkflowRun>) -> Vec<WorkflowRun> {
    let mut by_id = std::collections::HashMap::with_capacity(runs.len());
    for run in runs {
        by_id.insert(run.id, run);
    }

    let mut runs: Vec<_> = by_id.into_values().collect();
    runs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    runs
}

/// Group runs by workflow path. `runs` must already be sorted by path, which
/// `dedup_and_sort_runs` guarantees.
pub fn group_runs_by_workflow(runs: Vec<WorkflowRun>) -> Vec<(String, Vec<WorkflowRun>)> {
    let mut groups: Vec<(String, Vec<WorkflowRun>)> = Vec::new();
    for run in runs {
        match groups.last_mut() {
            Some((path, group)) if *path == run.path => group.push(run),
            _ => groups.push((run.path.clone(), vec![run])),
        }
    }
    groups
}
