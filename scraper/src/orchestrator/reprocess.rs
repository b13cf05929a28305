use crate::parser::{JobLogInsight, StepKind};
use log::debug;
use regex::Regex;
use std::sync::LazyLock;

static SHELL_COMMAND_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||;|\||&|[^\\]\n").unwrap());

/// Whether a previously computed insight must be computed again.
///
/// The shell parser service gets better over time, and some of its past
/// answers are known to be wrong: a single command extracted from code that
/// holds a separator, or a command it used to structure badly.
pub fn needs_reparse(insight: &JobLogInsight, denylist: &[String]) -> bool {
    insight.steps.iter().any(|step| {
        let shell = match &step.kind {
            StepKind::Shell(shell) => shell,
            StepKind::Action(_) => return false,
        };
        let commands = match &shell.commands {
            Some(commands) if !commands.is_empty() => commands,
            _ => return false,
        };

        if commands.len() == 1 && SHELL_COMMAND_SEPARATOR.is_match(&shell.code) {
            debug!(
                "{}: only 1 command but there are shell separators",
                insight.file
            );
            return true;
        }

        let denied = commands
            .iter()
            .filter_map(|c| c.command.as_deref())
            .find(|command| denylist.iter().any(|d| d == command));
        if let Some(command) = denied {
            debug!("{}: `{}` command found", insight.file, command);
            return true;
        }

        false
    })
}

#[cfg(test)]
mod test {
    use super::needs_reparse;
    use crate::parser::{JobLogInsight, ShellCommand, ShellStep, Step, StepKind};
    use chrono::NaiveDate;

    fn insight(code: &str, commands: &[&str]) -> JobLogInsight {
        let step = Step {
            kind: StepKind::Shell(ShellStep {
                code: code.to_owned(),
                commands: Some(
                    commands
                        .iter()
                        .map(|c| ShellCommand {
                            command: Some((*c).to_owned()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            start_date: NaiveDate::from_ymd_opt(2023, 8, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            duration_sec: Some(1.0),
        };
        JobLogInsight {
            file: "0_build.txt".to_owned(),
            steps: vec![step],
            ..Default::default()
        }
    }

    fn denylist() -> Vec<String> {
        vec!["npm".to_owned()]
    }

    #[test]
    fn under_split_code_is_reparsed() {
        assert!(needs_reparse(&insight("make && make test", &["make"]), &denylist()));
        assert!(needs_reparse(&insight("cat a | grep b", &["cat"]), &denylist()));
        assert!(needs_reparse(&insight("cd src\nmake", &["cd"]), &denylist()));
    }

    #[test]
    fn well_split_code_is_reused() {
        assert!(!needs_reparse(
            &insight("make && make test", &["make", "make"]),
            &denylist()
        ));
        assert!(!needs_reparse(&insight("cargo test", &["cargo"]), &denylist()));
        // Nothing was extracted, there is nothing to compare with
        assert!(!needs_reparse(&insight("make && make test", &[]), &denylist()));
    }

    #[test]
    fn denylisted_commands_are_reparsed() {
        assert!(needs_reparse(&insight("npm ci\nnpm test", &["npm", "npm"]), &denylist()));
        assert!(!needs_reparse(&insight("npm ci\nnpm test", &["npm", "npm"]), &[]));
    }
}
