use super::{CycleSummary, Orchestrator, ParseOutcome};
use crate::{
    archive::{archive_path, test::zip_archive, zip_to_tar_gz},
    config::OrchestratorConfig,
    parser::{test::FakeExtractor, LogParser, StepKind},
    store::{test::workflow_run, DocumentStore, LogsArchive, RunRecord, Store},
    test::{github_client, hours_ago, FakeGithub, Reply, JOB_LOG},
};
use github::WorkflowRun;
use serde_json::json;
use std::{path::Path, sync::Arc};
use tempfile::TempDir;

const REPOSITORY: &str = "octocat/hello-world";

struct Fixture {
    dir: TempDir,
    store: Arc<DocumentStore>,
    github: Arc<FakeGithub>,
    extractor: Arc<FakeExtractor>,
    orchestrator: Orchestrator,
}

impl Fixture {
    fn new(github: Arc<FakeGithub>) -> Self {
        Self::with_config(github, OrchestratorConfig::default())
    }

    fn with_config(github: Arc<FakeGithub>, config: OrchestratorConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::in_memory());
        let extractor = Arc::new(FakeExtractor::default());
        let orchestrator = Orchestrator::new(
            store.clone(),
            github_client(github.clone()),
            LogParser::new(extractor.clone()),
            dir.path().join("logs"),
            config,
        );
        Self {
            dir,
            store,
            github,
            extractor,
            orchestrator,
        }
    }

    fn logs_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("logs")
    }

    /// Insert a run, with its archive already on disk when `archived`
    fn insert(&self, run: WorkflowRun, archived: bool) -> RunRecord {
        let mut record = RunRecord::new(run, None);
        if archived {
            let path = archive_path(&self.logs_dir(), &record.metadata);
            zip_to_tar_gz(&job_archive(), &path).unwrap();
            record.logs_archive = Some(LogsArchive::Path { path });
        }
        self.store.insert_run(record.clone()).unwrap();
        record
    }

    fn run(&self, id: &str) -> RunRecord {
        self.store
            .runs(REPOSITORY)
            .unwrap()
            .into_iter()
            .find(|run| run.id == id)
            .unwrap()
    }
}

fn job_archive() -> Vec<u8> {
    zip_archive(&[
        ("1_build.txt", JOB_LOG.as_bytes()),
        ("build/1_Set up job.txt", b"step log\n"),
    ])
}

/// Serves the job archive on every logs URL
fn serving_logs() -> Arc<FakeGithub> {
    FakeGithub::new(|request| {
        if request.url.ends_with("/logs") {
            Reply::bytes(200, job_archive())
        } else {
            Reply::not_found()
        }
    })
}

#[tokio::test]
async fn retention_keeps_the_most_recent_runs() {
    let fixture = Fixture::new(serving_logs());
    let mut a_runs = Vec::new();
    for number in 1..=7 {
        let run = workflow_run(REPOSITORY, "a.yml", number, &hours_ago(10 - number as i64));
        a_runs.push(fixture.insert(run, true));
    }
    for number in 8..=9 {
        fixture.insert(workflow_run(REPOSITORY, "b.yml", number, &hours_ago(1)), false);
    }

    let summary = fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(
        summary,
        CycleSummary {
            workflows: 2,
            retained_runs: 7,
            deleted_runs: 2,
            downloaded: 2,
            parsed: 7,
            corrupted: 0,
        }
    );

    let remaining: Vec<u64> = fixture
        .store
        .runs(REPOSITORY)
        .unwrap()
        .iter()
        .map(|run| run.run_number)
        .collect();
    assert_eq!(remaining, [3, 4, 5, 6, 7, 8, 9]);
    assert!(!a_runs[0].archive_path().unwrap().exists());
    assert!(!a_runs[1].archive_path().unwrap().exists());
    assert!(a_runs[2].archive_path().unwrap().exists());

    // Only the missing archives were downloaded
    assert_eq!(fixture.github.requests().len(), 2);

    let repository = fixture.store.repository(REPOSITORY).unwrap().unwrap();
    assert!(repository.processed);
    assert_eq!((repository.nb_workflows, repository.nb_runs), (2, 7));
}

#[tokio::test]
async fn downloaded_archive_is_parsed() {
    let fixture = Fixture::new(serving_logs());
    let record = fixture.insert(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), false);

    fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();

    let run = fixture.run(&record.id);
    let path = run.archive_path().unwrap();
    assert_eq!(path, archive_path(&fixture.logs_dir(), &record.metadata));
    assert!(path.is_file());

    // Nested step logs are not job logs
    let insights = run.log_insights.unwrap();
    assert_eq!(insights.len(), 1);
    let insight = &insights[0];
    assert_eq!(insight.file, "1_build.txt");
    assert_eq!(insight.steps.len(), 2);
    assert_eq!(run.total_logs_size, Some(JOB_LOG.len() as u64));

    match &insight.steps[1].kind {
        StepKind::Shell(shell) => {
            assert_eq!(shell.code, "make && make test");
            assert_eq!(shell.commands.as_ref().unwrap().len(), 2);
        }
        other => panic!("unexpected step: {:?}", other),
    }
    assert_eq!(insight.steps[1].duration_sec, Some(2.0));
}

#[tokio::test]
async fn trusted_insights_are_reused() {
    let fixture = Fixture::new(serving_logs());
    let record = fixture.insert(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), true);

    fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(fixture.extractor.calls().len(), 1);

    // An under-split shell step is not trusted anymore
    let mut insights = fixture.run(&record.id).log_insights.unwrap();
    if let StepKind::Shell(shell) = &mut insights[0].steps[1].kind {
        shell.commands.as_mut().unwrap().truncate(1);
    }
    fixture
        .store
        .set_log_insights(&record.id, insights, JOB_LOG.len() as u64)
        .unwrap();

    fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(fixture.extractor.calls().len(), 2);
    let insights = fixture.run(&record.id).log_insights.unwrap();
    match &insights[0].steps[1].kind {
        StepKind::Shell(shell) => assert_eq!(shell.commands.as_ref().unwrap().len(), 2),
        other => panic!("unexpected step: {:?}", other),
    }
}

#[tokio::test]
async fn corrupted_archive_is_dropped_but_the_run_is_kept() {
    let fixture = Fixture::new(serving_logs());
    let record = fixture.insert(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), true);
    let path = record.archive_path().unwrap().to_owned();
    std::fs::write(&path, b"definitely not gzip").unwrap();

    let summary = fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(summary.corrupted, 1);
    assert_eq!(summary.parsed, 0);
    assert!(!path.exists());

    let run = fixture.run(&record.id);
    assert_eq!(run.logs_archive, None);
    assert!(fixture.github.requests().is_empty());

    // The next cycle downloads it again
    let summary = fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!((summary.downloaded, summary.parsed), (1, 1));
    assert!(path.is_file());
}

#[tokio::test]
async fn old_runs_are_not_downloaded() {
    let fixture = Fixture::new(serving_logs());
    let record = fixture.insert(
        workflow_run(REPOSITORY, "ci.yml", 1, "2023-08-01T10:00:00Z"),
        false,
    );

    let summary = fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(summary.downloaded, 0);
    assert_eq!(
        fixture.run(&record.id).logs_archive,
        Some(LogsArchive::Error {
            error: "More than 90d old".to_owned()
        })
    );
    assert!(fixture.github.requests().is_empty());

    // A recorded error is final
    fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert!(fixture.github.requests().is_empty());
}

#[tokio::test]
async fn oversized_archive_is_recorded_as_an_error() {
    let config = OrchestratorConfig {
        max_archive_size: 64,
        ..Default::default()
    };
    let fixture = Fixture::with_config(serving_logs(), config);
    let record = fixture.insert(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), false);

    let summary = fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(summary.downloaded, 0);
    match fixture.run(&record.id).logs_archive {
        Some(LogsArchive::Error { error }) => assert!(error.contains("64 bytes"), "{}", error),
        other => panic!("unexpected archive: {:?}", other),
    }
    assert!(!archive_path(&fixture.logs_dir(), &record.metadata).exists());
}

#[tokio::test]
async fn large_job_logs_are_not_parsed() {
    let config = OrchestratorConfig {
        max_log_size: 16,
        ..Default::default()
    };
    let fixture = Fixture::with_config(serving_logs(), config);
    let record = fixture.insert(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), true);

    let outcome = fixture
        .orchestrator
        .parse_archive(record.archive_path().unwrap(), Vec::new())
        .await
        .unwrap();
    match outcome {
        ParseOutcome::PartialWithErrors(parsed) => {
            assert_eq!(parsed.insights.len(), 1);
            assert_eq!(parsed.insights[0].error.as_deref(), Some("Log too large"));
            assert_eq!(parsed.insights[0].log_size, JOB_LOG.len() as u64);
            assert!(parsed.insights[0].steps.is_empty());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(fixture.extractor.calls().is_empty());
}

#[tokio::test]
async fn downloads_wait_for_an_available_token() {
    let reset = chrono::Utc::now().timestamp() + 3600;
    let github = FakeGithub::new(move |request| {
        if request.url.ends_with("rate_limit") {
            Reply::json(
                200,
                json!({"resources": {"core": {"limit": 5000, "remaining": 0, "reset": reset}}}),
            )
        } else {
            Reply::bytes(200, job_archive())
        }
    });
    let fixture = Fixture::new(github);
    let record = fixture.insert(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), false);
    github_credentials_exhausted(&fixture).await;

    let summary = fixture.orchestrator.process_repository(REPOSITORY).await.unwrap();
    assert_eq!(summary.downloaded, 0);
    assert_eq!(fixture.run(&record.id).logs_archive, None);
    assert!(fixture
        .github
        .urls()
        .iter()
        .all(|url| url.ends_with("rate_limit")));
}

async fn github_credentials_exhausted(fixture: &Fixture) {
    fixture
        .orchestrator
        .github
        .check_credentials()
        .await
        .unwrap();
    assert!(!fixture.orchestrator.github.credential_available());
}

#[test]
fn missing_archive_files_are_downloaded_again() {
    let run = workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2));
    let mut record = RunRecord::new(run, None);
    assert!(super::needs_download(&record));

    record.logs_archive = Some(LogsArchive::Path {
        path: Path::new("/nonexistent/1-1.tar.gz").to_owned(),
    });
    assert!(super::needs_download(&record));

    record.logs_archive = Some(LogsArchive::Error {
        error: "gone".to_owned(),
    });
    assert!(!super::needs_download(&record));
}
