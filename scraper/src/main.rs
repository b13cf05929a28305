use gha_scraper::{Config, ServeOptions};
use log::info;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt)]
struct Options {
    #[structopt(short, long, parse(from_os_str), default_value = "scraper.toml")]
    /// config file to use
    config: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    #[structopt(name = "serve")]
    /// Poll repositories for new runs and process them
    Serve(ServeOptions),

    #[structopt(name = "import")]
    /// Import repositories seen for the first time
    Import {
        /// `owner/name` of the repositories. Default: `repositories` from the config file
        repositories: Vec<String>,
    },

    #[structopt(name = "check-tokens")]
    /// Show the quota left on every token
    CheckTokens,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Options::from_args();

    // set up logging, allowing info level logging by default
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("gha-scraper starting");

    let config = Config::from_file(&opts.config)?;

    match opts.command {
        Command::Serve(options) => gha_scraper::run_serve(config, &options).await?,
        Command::Import { repositories } => gha_scraper::run_import(config, repositories).await?,
        Command::CheckTokens => gha_scraper::run_check_tokens(config).await?,
    }

    Ok(())
}
