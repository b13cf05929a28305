//! Error type for Github Client

use reqwest::StatusCode;
use std::{borrow::Cow, io};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Io error")]
    Io(#[from] io::Error),

    #[error("reqwest error")]
    Reqwest(#[from] reqwest::Error),

    #[error("json error")]
    Json(#[from] serde_json::Error),

    #[error("`{0}`")]
    Message(Cow<'static, str>),

    /// HTTP 4xx that is not a rate limit. Retrying will not help.
    #[error("Got HTTP {status}: {body}")]
    ClientError { status: StatusCode, body: String },

    /// Every attempt failed with a transport error, a 5xx or a rate limit
    #[error("Fail after {attempts} attempts (HTTP {status:?})")]
    Delivery {
        attempts: usize,
        status: Option<StatusCode>,
    },

    #[error("Payload is larger than {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("No token provided")]
    NoCredentials,
}

impl Error {
    /// True for failures that will not go away by retrying later
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::ClientError { .. } | Error::PayloadTooLarge { .. }
        )
    }
}

impl From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Message(error.into())
    }
}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Message(error.into())
    }
}
