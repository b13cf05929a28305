//! Types for Github's v3 Actions API and a client that spreads its calls
//! over a pool of API tokens.
//! https://docs.github.com/en/rest/actions/workflow-runs

pub mod client;
mod common;
mod workflow;

pub use client::Client;
pub use common::*;
pub use workflow::*;
