//! Job log parsing.
//!
//! Parsing happens in two phases: `scan` walks the text and extracts the
//! runner context and the steps, then `LogParser::resolve` asks the shell
//! parser service to structure the code of every shell step.

mod scan;
mod types;

pub use scan::{scan, ScannedLog};
pub use types::{
    ActionStep, Analysis, DelegateError, JobLogInsight, Permission, ShellCommand, ShellStep, Step,
    StepKind,
};

use crate::shell::CommandExtractor;
use std::sync::Arc;

/// Keys of a stored shell step that the service's answer cannot override
const SHELL_STEP_KEYS: &[&str] = &["type", "start_date", "duration_sec", "env", "code", "commands", "error"];

#[derive(Clone)]
pub struct LogParser {
    extractor: Arc<dyn CommandExtractor>,
}

impl LogParser {
    pub fn new(extractor: Arc<dyn CommandExtractor>) -> Self {
        Self { extractor }
    }

    pub async fn parse(&self, file: &str, log: &str) -> JobLogInsight {
        self.resolve(file, scan(log)).await
    }

    /// Structure the shell steps of a scanned log. A step the service could
    /// not structure carries the error, the other steps are unaffected.
    pub async fn resolve(&self, file: &str, scanned: ScannedLog) -> JobLogInsight {
        let mut steps = scanned.steps;

        for step in &mut steps {
            if let StepKind::Shell(shell) = &mut step.kind {
                if shell.code.is_empty() {
                    continue;
                }
                match self.extractor.extract(&shell.code).await {
                    Ok(mut analysis) => {
                        analysis
                            .extra
                            .retain(|key, _| !SHELL_STEP_KEYS.contains(&key.as_str()));
                        shell.commands = Some(analysis.commands);
                        shell.extra = analysis.extra;
                    }
                    Err(error) => shell.error = Some(error),
                }
            }
        }

        JobLogInsight {
            file: file.to_owned(),
            total_lines: scanned.total_lines,
            log_size: scanned.log_size,
            token_permissions: scanned.token_permissions,
            image: scanned.image,
            image_version: scanned.image_version,
            steps,
            error: None,
        }
    }
}
