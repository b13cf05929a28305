//! Scraper of Github Actions logs.
//!
//! Discovery polls repositories for new workflow runs and queues them; a
//! worker downloads the log archives of the most recent runs and turns every
//! job log into a structured trace of its steps.

pub mod archive;
pub mod config;
pub mod discovery;
mod error;
pub mod orchestrator;
pub mod parser;
pub mod queue;
mod service;
pub mod shell;
pub mod store;
pub mod worker;


pub use config::Config;
pub use error::{Error, Result};
pub use service::{run_check_tokens, run_import, run_serve, ServeOptions};
