use crate::{
    orchestrator::Orchestrator,
    queue::{Delivery, Queue, RepositoryMessage},
    Result,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

/// Consumes the `repositories` queue, one repository at a time
pub struct Worker {
    queue: Arc<dyn Queue>,
    orchestrator: Orchestrator,
}

impl Worker {
    pub fn new(queue: Arc<dyn Queue>, orchestrator: Orchestrator) -> Self {
        Self {
            queue,
            orchestrator,
        }
    }

    /// Process messages until `shutdown` turns true or the queue is closed.
    /// A cycle still running at shutdown is abandoned and its message
    /// released for redelivery.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        while !*shutdown.borrow() {
            let delivery = tokio::select! {
                delivery = self.queue.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            tokio::select! {
                result = self.handle(&delivery) => result?,
                _ = shutdown.changed() => {
                    warn!("Shutting down: message {} released", delivery.tag);
                    self.queue.release(delivery.tag).await?;
                    break;
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Run the cycle of the repository named by a message, then acknowledge
    /// it. A failed cycle puts the message back at the tail of the queue.
    pub async fn handle(&self, delivery: &Delivery) -> Result<()> {
        match RepositoryMessage::from_body(&delivery.body) {
            Ok(message) => {
                info!("Received message: {}", message.repo_name);
                match self.orchestrator.process_repository(&message.repo_name).await {
                    Ok(_) => info!("Repo {} processed with success", message.repo_name),
                    Err(e) => {
                        error!("Fail to process repo {}: {}", message.repo_name, e);
                        self.queue.publish(delivery.body.clone()).await?;
                    }
                }
            }
            Err(e) => error!(
                "Malformed message dropped ({}): {}",
                e,
                String::from_utf8_lossy(&delivery.body)
            ),
        }

        self.queue.ack(delivery.tag).await
    }
}

#[cfg(test)]
mod test {
    use super::Worker;
    use crate::{
        archive::{archive_path, test::zip_archive, zip_to_tar_gz},
        config::OrchestratorConfig,
        orchestrator::Orchestrator,
        parser::{test::FakeExtractor, Analysis, DelegateError, LogParser},
        queue::{publish_repository, MemoryQueue, Queue},
        shell::CommandExtractor,
        store::{test::workflow_run, DocumentStore, LogsArchive, RunRecord, Store},
        test::{github_client, hours_ago, FakeGithub, Reply, JOB_LOG},
    };
    use std::{path::Path, sync::Arc, time::Duration};
    use tokio::sync::watch;

    const REPOSITORY: &str = "octocat/hello-world";

    /// Never answers
    struct StuckExtractor;

    #[async_trait::async_trait]
    impl CommandExtractor for StuckExtractor {
        async fn extract(&self, _code: &str) -> Result<Analysis, DelegateError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Analysis::default())
        }
    }

    fn worker(
        store: Arc<DocumentStore>,
        queue: Arc<MemoryQueue>,
        extractor: Arc<dyn CommandExtractor>,
        logs_dir: &Path,
    ) -> Worker {
        let orchestrator = Orchestrator::new(
            store,
            github_client(FakeGithub::new(|_| Reply::not_found())),
            LogParser::new(extractor),
            logs_dir.to_owned(),
            OrchestratorConfig::default(),
        );
        Worker::new(queue, orchestrator)
    }

    #[tokio::test]
    async fn processed_message_is_acked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::in_memory());
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(store.clone(), queue.clone(), Arc::new(FakeExtractor::default()), dir.path());

        publish_repository(queue.as_ref(), REPOSITORY).await.unwrap();
        let delivery = queue.next().await.unwrap();
        worker.handle(&delivery).await.unwrap();

        assert!(store.repository(REPOSITORY).unwrap().unwrap().processed);
        assert!(queue.is_empty());
        assert!(queue.ack(delivery.tag).await.is_err());
    }

    #[tokio::test]
    async fn failed_cycle_is_requeued() {
        let dir = tempfile::tempdir().unwrap();
        // The snapshot cannot be written under a regular file
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let store = Arc::new(DocumentStore::open(blocker.join("store.json")).unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(store, queue.clone(), Arc::new(FakeExtractor::default()), dir.path());

        publish_repository(queue.as_ref(), REPOSITORY).await.unwrap();
        let delivery = queue.next().await.unwrap();
        worker.handle(&delivery).await.unwrap();

        assert_eq!(queue.len(), 1);
        let again = queue.next().await.unwrap();
        assert_eq!(again.body, delivery.body);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(
            Arc::new(DocumentStore::in_memory()),
            queue.clone(),
            Arc::new(FakeExtractor::default()),
            dir.path(),
        );

        queue.publish(b"octocat/hello-world".to_vec()).await.unwrap();
        let delivery = queue.next().await.unwrap();
        worker.handle(&delivery).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_the_message_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::in_memory());
        let queue = Arc::new(MemoryQueue::new());

        let mut record = RunRecord::new(workflow_run(REPOSITORY, "ci.yml", 1, &hours_ago(2)), None);
        let path = archive_path(&dir.path().join("logs"), &record.metadata);
        zip_to_tar_gz(&zip_archive(&[("1_build.txt", JOB_LOG.as_bytes())]), &path).unwrap();
        record.logs_archive = Some(LogsArchive::Path { path });
        store.insert_run(record.clone()).unwrap();

        let worker = worker(store.clone(), queue.clone(), Arc::new(StuckExtractor), &dir.path().join("logs"));
        publish_repository(queue.as_ref(), REPOSITORY).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert!(!store.repository(REPOSITORY).unwrap().map_or(false, |r| r.processed));
        assert_eq!(store.runs(REPOSITORY).unwrap()[0].log_insights, None);
    }

    #[tokio::test]
    async fn idle_worker_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(
            Arc::new(DocumentStore::in_memory()),
            queue,
            Arc::new(FakeExtractor::default()),
            dir.path(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
