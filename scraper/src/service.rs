use crate::{
    config::GithubConfig,
    discovery::Discovery,
    orchestrator::Orchestrator,
    parser::LogParser,
    queue::{MemoryQueue, Queue},
    shell::HttpCommandExtractor,
    store::{DocumentStore, Store},
    worker::Worker,
    Config, Result,
};
use futures::future::try_join_all;
use log::{error, info};
use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::watch;

#[derive(StructOpt)]
pub struct ServeOptions {
    #[structopt(long)]
    /// Mark every repository as unprocessed and queue all selected ones
    reprocess_all: bool,
}

fn github_client(config: &GithubConfig, tokens: &[String]) -> Result<github::Client> {
    let mut builder = github::Client::builder()
        .github_api_tokens(tokens.iter().cloned())
        .max_attempts(config.max_attempts);
    if let Some(base_url) = &config.base_url {
        builder = builder.base_url(base_url.clone());
    }
    Ok(builder.build()?)
}

/// Run discovery and a worker until Ctrl-C
pub async fn run_serve(config: Config, options: &ServeOptions) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(DocumentStore::open(config.store_path())?);
    let queue = Arc::new(MemoryQueue::new());
    let github = Arc::new(github_client(&config.github, &config.github.tokens)?);
    let poll_github = Arc::new(github_client(&config.github, config.github.poll_tokens())?);
    github.check_credentials().await?;

    let discovery = Discovery::new(
        store.clone(),
        queue.clone(),
        github.clone(),
        poll_github,
        config.discovery.clone(),
    );
    // Nothing survives a restart in the queue
    if options.reprocess_all {
        discovery.reprocess_all().await?;
    } else {
        discovery.enqueue_unprocessed().await?;
    }

    let extractor = Arc::new(HttpCommandExtractor::new(&config.shell_parser)?);
    let orchestrator = Orchestrator::new(
        store,
        github,
        LogParser::new(extractor),
        config.logs_dir(),
        config.orchestrator.clone(),
    );
    let worker = Worker::new(queue.clone(), orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Cannot listen for Ctrl-C: {}", e);
                // Dropping the sender would stop everything
                futures::future::pending::<()>().await;
            }
        }
    });

    let tasks = vec![
        tokio::spawn(discovery.run(shutdown_rx.clone())),
        tokio::spawn(worker.run(shutdown_rx)),
    ];

    // Join all of the spawned tasks
    let results = try_join_all(tasks).await?;
    queue.close().await;
    results.into_iter().collect()
}

/// Import repositories seen for the first time
pub async fn run_import(config: Config, repositories: Vec<String>) -> Result<()> {
    let names = if repositories.is_empty() {
        config.repositories.clone()
    } else {
        repositories
    };
    if names.is_empty() {
        return Err("No repository to import".into());
    }

    let store = Arc::new(DocumentStore::open(config.store_path())?);
    let github = Arc::new(github_client(&config.github, &config.github.tokens)?);
    github.check_credentials().await?;

    let discovery = Discovery::new(
        store,
        Arc::new(MemoryQueue::new()),
        github.clone(),
        github,
        config.discovery.clone(),
    );
    let imported = discovery.import_all(&names).await;
    info!("{}/{} repositories imported", imported, names.len());
    Ok(())
}

/// Log the quota left on every token
pub async fn run_check_tokens(config: Config) -> Result<()> {
    let github = github_client(&config.github, &config.github.tokens)?;
    let rates = github.check_credentials().await?;
    let available = rates
        .iter()
        .filter(|(_, rate)| rate.remaining != Some(0))
        .count();
    info!("{}/{} tokens available", available, rates.len());
    Ok(())
}
