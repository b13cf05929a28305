//! Client of the shell parser service, which turns raw shell code into
//! structured commands.

use crate::{
    config::ShellParserConfig,
    parser::{Analysis, DelegateError},
    Result,
};
use log::{debug, warn};
use reqwest::{header, StatusCode};
use serde_json::Value;
use std::time::Duration;

#[async_trait::async_trait]
pub trait CommandExtractor: Send + Sync {
    /// Structure `code` into commands. Failures are classified, never raised:
    /// they end up on the step.
    async fn extract(&self, code: &str) -> Result<Analysis, DelegateError>;
}

/// Classify an answer of the service
pub fn classify_response(status: StatusCode, body: &str) -> Result<Analysis, DelegateError> {
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("Error while parsing shell code: {}", body);
        return Err(DelegateError::ServerError {
            body: body.to_owned(),
        });
    }
    if status == StatusCode::BAD_REQUEST {
        warn!("Error while parsing shell code: {}", body);
        return Err(DelegateError::BadRequest {
            body: body.to_owned(),
        });
    }

    let result: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let object = match result {
        Value::Object(object) if !object.is_empty() => object,
        _ => {
            warn!("Empty response from parser");
            return Err(DelegateError::EmptyResponse);
        }
    };

    let original_error = ["originalError", "error"]
        .iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null() && value.as_str() != Some(""));
    if let Some(original_error) = original_error {
        let original_error = match original_error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        warn!("Invalid shell code: {}", original_error);
        return Err(DelegateError::SemanticError { original_error });
    }

    match serde_json::from_value::<Analysis>(Value::Object(object)) {
        Ok(analysis) => Ok(analysis),
        Err(e) => {
            warn!("Unexpected response from parser: {}", e);
            Err(DelegateError::EmptyResponse)
        }
    }
}

/// `CommandExtractor` backed by the HTTP shell parser service
#[derive(Debug)]
pub struct HttpCommandExtractor {
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
    /// Backoff before attempt `i + 1` is `base * 2^i * random()`
    backoff_base: Duration,
}

impl HttpCommandExtractor {
    pub fn new(config: &ShellParserConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(github::client::Error::from)?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_secs(1),
        })
    }

    async fn post(&self, code: &str) -> reqwest::Result<(StatusCode, String)> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(code.to_owned())
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.text().await?))
    }
}

#[async_trait::async_trait]
impl CommandExtractor for HttpCommandExtractor {
    async fn extract(&self, code: &str) -> Result<Analysis, DelegateError> {
        debug!("Shell code: {}", code);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.post(code).await {
                Ok((status, body))
                    if status.is_success()
                        || status == StatusCode::BAD_REQUEST
                        || status == StatusCode::INTERNAL_SERVER_ERROR =>
                {
                    return classify_response(status, &body);
                }
                Ok((status, _)) => last_error = format!("HTTP {}", status),
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                "Fail to call shell parser (attempt {}/{}): {}",
                attempt, self.max_attempts, last_error
            );

            if attempt < self.max_attempts {
                let pause = self.backoff_base.mul_f64(2f64.powi(attempt as i32) * rand::random::<f64>());
                tokio::time::sleep(pause).await;
            }
        }

        Err(DelegateError::TransportError {
            attempts: self.max_attempts,
            message: last_error,
        })
    }
}
