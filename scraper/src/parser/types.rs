use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// What was extracted from one job log of a run archive
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLogInsight {
    /// Name of the job log inside the run archive
    pub file: String,
    #[serde(default)]
    pub total_lines: usize,
    pub log_size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token_permissions: BTreeMap<String, Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobLogInsight {
    /// Insight of a log that was not parsed
    pub fn failed(file: impl Into<String>, log_size: u64, error: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            log_size,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    pub start_date: NaiveDateTime,
    /// Absent for the last step when the final line of the log carries no
    /// usable timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionStep),
    Shell(ShellStep),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// Owner of the action repository
    pub repository: String,
    pub action: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Sub-directory of the action inside its repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default)]
    pub with: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellStep {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Echoed command lines, newline separated
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<ShellCommand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DelegateError>,
    /// Fields of the service's answer besides `commands`
    #[serde(flatten, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Answer of the shell parser service for one block of code
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub commands: Vec<ShellCommand>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One command as structured by the shell parser service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellCommand {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Why the shell parser service could not structure a block of shell code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelegateError {
    /// HTTP 500
    #[error("Parser exception: {body}")]
    ServerError { body: String },
    /// HTTP 400
    #[error("Invalid request: {body}")]
    BadRequest { body: String },
    #[error("Empty response from parser")]
    EmptyResponse,
    /// The service answered but could not make sense of the code
    #[error("Invalid shell code: {original_error}")]
    SemanticError { original_error: String },
    #[error("Fail to call shell parser after {attempts} attempts: {message}")]
    TransportError { attempts: u32, message: String },
}
