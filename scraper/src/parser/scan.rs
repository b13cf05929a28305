//! Synchronous pass over a job log: everything but the shell parser calls.
//!
//! Every line of a job log starts with a fixed-width timestamp followed by a
//! space, e.g. `2023-08-01T10:00:05.5000000Z ##[group]Run make`.

use super::types::{ActionStep, Permission, ShellStep, Step, StepKind};
use chrono::NaiveDateTime;
use log::{debug, warn};
use regex::Regex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::LazyLock,
};

/// Width of the timestamp prefix, without the separating space
const TIMESTAMP_WIDTH: usize = 28;

/// Significant part of the timestamp: the last fractional digit and the `Z`
/// are dropped
const TIMESTAMP_PARSED_WIDTH: usize = 26;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

static TOKEN_PERMISSIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^.{28} (?P<scope>\w+): (?P<permission>write|read)$").unwrap()
});

static IMAGE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Runner Image\n.{28} Image: (?P<image>[\w.-]+)\n.{28} Version: (?P<version>[\w.-]+)\n")
        .unwrap()
});

static ACTIONS_DOWNLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^.{28} Download action repository '(?P<repo>[^/]+)/(?P<name>[^@]+)@(?P<version>[^']+)' \(SHA:(?P<sha>\w+)\)$")
        .unwrap()
});

/// `owner/name[/folder]@ref`
static ACTION_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<repo>[^/\s]+)/(?P<name>[^/@\s]+)(?:/(?P<folder>[^@\s]+))?@(?P<version>\S+)$")
        .unwrap()
});

const GROUP_START: &str = "##[group]Run ";
const GROUP_END: &str = "##[endgroup]";
const COMMAND_START: &str = "[36;1m";
const COMMAND_END: &str = "[0m";
const ESCAPE: char = '\u{1b}';

/// A job log with every step extracted. Shell steps still lack their
/// structured commands.
#[derive(Debug, Default)]
pub struct ScannedLog {
    pub total_lines: usize,
    pub log_size: u64,
    pub token_permissions: BTreeMap<String, Permission>,
    pub image: Option<String>,
    pub image_version: Option<String>,
    pub steps: Vec<Step>,
}

/// Split a line into its timestamp prefix and its content
fn split_line(line: &str) -> Option<(&str, &str)> {
    if line.len() > TIMESTAMP_WIDTH
        && line.is_char_boundary(TIMESTAMP_WIDTH)
        && line.as_bytes()[TIMESTAMP_WIDTH] == b' '
    {
        Some((&line[..TIMESTAMP_WIDTH], &line[TIMESTAMP_WIDTH + 1..]))
    } else {
        None
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.get(..TIMESTAMP_PARSED_WIDTH)?;
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}

fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// `owner/name@version` -> sha, from the "Download action repository" lines
fn action_registry(log: &str) -> HashMap<String, String> {
    ACTIONS_DOWNLOAD
        .captures_iter(log)
        .map(|c| {
            (
                format!("{}/{}@{}", &c["repo"], &c["name"], &c["version"]),
                c["sha"].to_owned(),
            )
        })
        .collect()
}

/// Parse the `key: value` lines following a `<header>:` line, up to the next
/// non-indented line
fn parameters(body: &[&str], header: &str) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::new();
    let start = body
        .iter()
        .position(|line| split_line(line).map_or(false, |(_, content)| content.trim_end() == header));

    let start = match start {
        Some(start) => start + 1,
        None => return parameters,
    };

    for line in &body[start..] {
        let content = match split_line(line) {
            Some((_, content)) => content,
            None => continue,
        };
        if content.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
            break;
        }
        if let Some((key, value)) = content.trim_start().split_once(": ") {
            parameters.insert(key.to_owned(), value.to_owned());
        }
    }

    parameters
}

/// Echoed shell command, e.g. `\x1b[36;1mmake test\x1b[0m`
fn command_line(content: &str) -> Option<&str> {
    let command = content
        .strip_prefix(ESCAPE)
        .unwrap_or(content)
        .strip_prefix(COMMAND_START)?
        .strip_suffix(COMMAND_END)?;
    Some(command.strip_suffix(ESCAPE).unwrap_or(command))
}

fn action_step(reference: &str, registry: &HashMap<String, String>, body: &[&str]) -> Option<StepKind> {
    let captures = ACTION_REF.captures(reference)?;
    let key = format!("{}/{}@{}", &captures["repo"], &captures["name"], &captures["version"]);
    let sha = registry.get(&key).cloned();
    if sha.is_none() {
        warn!("No action info for {}", reference);
    }

    Some(StepKind::Action(ActionStep {
        repository: captures["repo"].to_owned(),
        action: captures["name"].to_owned(),
        version: captures["version"].to_owned(),
        sha,
        folder: captures.name("folder").map(|m| m.as_str().to_owned()),
        with: parameters(body, "with:"),
        env: parameters(body, "env:"),
    }))
}

fn shell_step(body: &[&str]) -> StepKind {
    let commands: Vec<&str> = body
        .iter()
        .filter_map(|line| split_line(line))
        .filter_map(|(_, content)| command_line(content))
        .collect();

    if commands.is_empty() {
        warn!("No shell command found in: {}", body.join("\n"));
    }

    StepKind::Shell(ShellStep {
        env: parameters(body, "env:"),
        code: commands.join("\n"),
        ..Default::default()
    })
}

enum State<'a> {
    Outside,
    InAction {
        start: &'a str,
        reference: &'a str,
        body: Vec<&'a str>,
    },
    InShell {
        start: &'a str,
        target: &'a str,
        body: Vec<&'a str>,
    },
}

/// Extract the runner context and the steps of a job log
pub fn scan(log: &str) -> ScannedLog {
    let log = log.strip_prefix('\u{feff}').unwrap_or(log);
    let mut scanned = ScannedLog {
        total_lines: log.matches('\n').count(),
        log_size: log.len() as u64,
        ..Default::default()
    };

    for c in TOKEN_PERMISSIONS.captures_iter(log) {
        let permission = if &c["permission"] == "write" {
            Permission::Write
        } else {
            Permission::Read
        };
        scanned.token_permissions.insert(c["scope"].to_owned(), permission);
    }

    if let Some(c) = IMAGE_VERSION.captures(log) {
        scanned.image = Some(c["image"].to_owned());
        scanned.image_version = Some(c["version"].to_owned());
    }

    let registry = action_registry(log);
    debug!("actions: {:?}", registry);

    let mut state = State::Outside;
    let mut blocks: Vec<(&str, StepKind)> = Vec::new();

    for line in log.lines() {
        let (timestamp, content) = match split_line(line) {
            Some(split) => split,
            None => {
                match &mut state {
                    State::InAction { body, .. } | State::InShell { body, .. } => body.push(line),
                    State::Outside => {}
                }
                continue;
            }
        };

        state = match state {
            State::Outside => match content.strip_prefix(GROUP_START) {
                Some(target) if ACTION_REF.is_match(target) => State::InAction {
                    start: timestamp,
                    reference: target,
                    body: Vec::new(),
                },
                Some(target) => State::InShell {
                    start: timestamp,
                    target,
                    body: Vec::new(),
                },
                None => State::Outside,
            },
            State::InAction {
                start,
                reference,
                body,
            } if content.starts_with(GROUP_END) => {
                debug!("Processing step 'Run {}'", reference);
                if let Some(kind) = action_step(reference, &registry, &body) {
                    blocks.push((start, kind));
                }
                State::Outside
            }
            State::InShell { start, target, body } if content.starts_with(GROUP_END) => {
                debug!("Processing step 'Run {}'", target);
                blocks.push((start, shell_step(&body)));
                State::Outside
            }
            State::InAction {
                start,
                reference,
                mut body,
            } => {
                body.push(line);
                State::InAction {
                    start,
                    reference,
                    body,
                }
            }
            State::InShell {
                start,
                target,
                mut body,
            } => {
                body.push(line);
                State::InShell { start, target, body }
            }
        };
    }

    let mut steps: Vec<Step> = Vec::with_capacity(blocks.len());
    for (start, kind) in blocks {
        let start_date = match parse_timestamp(start) {
            Some(start_date) => start_date,
            None => {
                warn!("Step ignored: cannot parse its start date '{}'", start);
                continue;
            }
        };
        if let Some(previous) = steps.last_mut() {
            previous.duration_sec = Some(seconds_between(previous.start_date, start_date));
        }
        steps.push(Step {
            kind,
            start_date,
            duration_sec: None,
        });
    }

    if let Some(last) = steps.last_mut() {
        let final_line = log.lines().last().unwrap_or_default();
        match parse_timestamp(final_line) {
            Some(end) => last.duration_sec = Some(seconds_between(last.start_date, end)),
            None => warn!(
                "Fail to compute duration_sec for last step because parsing of final line failed: '{}'",
                final_line
            ),
        }
    }

    scanned.steps = steps;
    scanned
}
