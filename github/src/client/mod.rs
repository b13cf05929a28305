use chrono::TimeZone;
use log::{debug, info, warn};
use reqwest::header;
use std::{sync::Arc, sync::Mutex, time::Duration};

mod actions;
mod credentials;
mod error;
mod pagination;
mod rate_limit;
mod transport;

pub use actions::{
    ActionsClient, ListWorkflowRunsOptions, RunsChange, RunsPoll, TimeWindow,
    DEFAULT_HISTORY_DAYS, DEFAULT_MAX_LOGS_SIZE,
};
pub use credentials::CredentialPool;
pub use error::{Error, Result};
pub use pagination::{PageOutcome, Pagination, MAX_RESULTS};
pub use rate_limit::{Rate, RateLimitClient, RateLimits};
pub use transport::{Body, ReqwestTransport, Request, Response, Transport};

// Constants
const DEFAULT_BASE_URL: &str = "https://api.github.com/";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const HEADER_RATE_LIMIT: &str = "X-RateLimit-Limit";
const HEADER_RATE_REMAINING: &str = "X-RateLimit-Remaining";
const HEADER_RATE_RESET: &str = "X-RateLimit-Reset";
const HEADER_LINK: &str = "Link";
const HEADER_API_VERSION: &str = "x-github-api-version";

const MEDIA_TYPE_V3: &str = "application/vnd.github.v3+json";
const API_VERSION: &str = "2022-11-28";

const DEFAULT_MAX_ATTEMPTS: usize = 5;
const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(1);
const DEFAULT_EXHAUSTED_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Below this many remaining calls we switch tokens before getting rate limited
const PROACTIVE_ROTATION_THRESHOLD: u64 = 50;

/// Used as reset time when a rate limited response does not carry one
const FALLBACK_RESET_DELAY_SECS: i64 = 60;

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

fn format_epoch(epoch: i64) -> String {
    chrono::Utc
        .timestamp_opt(epoch, 0)
        .single()
        .map(|datetime| datetime.to_rfc3339())
        .unwrap_or_else(|| epoch.to_string())
}

#[derive(Debug)]
pub struct ClientBuilder {
    base_url: Option<String>,
    user_agent: Option<String>,
    tokens: Vec<String>,
    max_attempts: usize,
    retry_pause: Duration,
    exhausted_poll_interval: Duration,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            user_agent: None,
            tokens: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_pause: DEFAULT_RETRY_PAUSE,
            exhausted_poll_interval: DEFAULT_EXHAUSTED_POLL_INTERVAL,
            transport: None,
        }
    }

    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn github_api_token<S: Into<String>>(mut self, github_api_token: S) -> Self {
        self.tokens.push(github_api_token.into());
        self
    }

    pub fn github_api_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Attempts per request before giving up with `Error::Delivery`
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Pause before retrying a request that failed with a 5xx
    pub fn retry_pause(mut self, retry_pause: Duration) -> Self {
        self.retry_pause = retry_pause;
        self
    }

    /// How often to look for a token again when all of them are rate limited
    pub fn exhausted_poll_interval(mut self, interval: Duration) -> Self {
        self.exhausted_poll_interval = interval;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Client> {
        if self.tokens.is_empty() {
            return Err(Error::NoCredentials);
        }

        let mut base_url = self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let user_agent = self.user_agent.unwrap_or_else(|| USER_AGENT.to_owned());

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&user_agent)?),
        };

        debug!("{} tokens found", self.tokens.len());
        let credentials = CredentialPool::new(self.tokens, &mut rand::thread_rng());

        Ok(Client {
            base_url,
            transport,
            credentials: Mutex::new(credentials),
            max_attempts: self.max_attempts,
            retry_pause: self.retry_pause,
            exhausted_poll_interval: self.exhausted_poll_interval,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Client {
    /// Base URL to use for API requests. Defaults to the public GitHub API,
    /// but can be overridden for use with GitHub Enterprise. Always
    /// terminated with a trailing slash.
    base_url: String,

    /// Used to send http requests
    transport: Arc<dyn Transport>,

    /// API tokens and their rate limit state
    credentials: Mutex<CredentialPool>,

    max_attempts: usize,
    retry_pause: Duration,
    exhausted_poll_interval: Duration,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> Request {
        Request::get(self.url(path))
    }

    fn authorize(&self, request: Request, token: &str) -> Result<Request> {
        request
            .header(header::AUTHORIZATION, &format!("token {}", token))?
            .header(header::ACCEPT, MEDIA_TYPE_V3)?
            .header(header::HeaderName::from_static(HEADER_API_VERSION), API_VERSION)
    }

    fn credentials(&self) -> std::sync::MutexGuard<'_, CredentialPool> {
        // Pool updates are single assignments, a poisoned pool is still consistent
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True if at least one token is not rate limited right now
    pub fn credential_available(&self) -> bool {
        self.credentials().any_available(now_epoch())
    }

    /// Token to use for the next call. Waits, polling every
    /// `exhausted_poll_interval`, while every token is rate limited.
    async fn acquire_token(&self) -> String {
        loop {
            let next_reset = {
                let mut credentials = self.credentials();
                let now = now_epoch();
                if credentials.current_available(now)
                    || credentials.rotate(now, &mut rand::thread_rng())
                {
                    return credentials.current_token().to_owned();
                }
                credentials.next_reset()
            };

            warn!(
                "No token available: next token available at {}",
                next_reset.map(format_epoch).unwrap_or_default()
            );
            tokio::time::sleep(self.exhausted_poll_interval).await;
        }
    }

    fn rotate(&self) {
        let mut credentials = self.credentials();
        credentials.rotate(now_epoch(), &mut rand::thread_rng());
    }

    /// Send a request, rotating tokens and retrying as needed.
    ///
    /// * transport errors and 5xx are retried (5xx after `retry_pause`)
    /// * a response with `X-RateLimit-Remaining: 0` marks the token as
    ///   exhausted until `X-RateLimit-Reset` and retries with another token
    /// * any other 4xx is returned as `Error::ClientError` right away
    ///
    /// 2xx and 3xx responses (including `304 Not Modified`) are returned.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let mut last_status = None;

        for attempt in 1..=self.max_attempts {
            let token = self.acquire_token().await;
            let authorized = self.authorize(request.clone(), &token)?;

            let response = match self.transport.send(authorized).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        "Exception raised on {} (attempt {}/{}): {}",
                        request.url, attempt, self.max_attempts, e
                    );
                    continue;
                }
            };

            let status = response.status();
            let rate = Rate::from_headers(response.headers());
            last_status = Some(status);

            if status.is_success() || status.is_redirection() {
                if rate
                    .remaining
                    .map_or(false, |remaining| remaining < PROACTIVE_ROTATION_THRESHOLD)
                {
                    debug!(
                        "Less than {} API calls left with this token, using another token now to avoid being rate-limited",
                        PROACTIVE_ROTATION_THRESHOLD
                    );
                    self.rotate();
                }
                return Ok(response);
            }

            if status.is_server_error() {
                debug!("Got HTTP {} on {}: trying again", status, request.url);
                tokio::time::sleep(self.retry_pause).await;
                continue;
            }

            if rate.remaining == Some(0) {
                debug!("We got rate limited: using another token");
                let reset = rate
                    .reset
                    .unwrap_or_else(|| now_epoch() + FALLBACK_RESET_DELAY_SECS);
                self.credentials().mark_token_rate_limited(&token, reset);
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            warn!("Got HTTP {}: {}", status, body);
            return Err(Error::ClientError { status, body });
        }

        Err(Error::Delivery {
            attempts: self.max_attempts,
            status: last_status,
        })
    }

    /// Send a request exactly once with the given token, without rotation
    async fn send_once(&self, request: Request) -> Result<Response> {
        let response = self.transport.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ClientError { status, body });
        }
        Ok(response)
    }

    // Deserialize the json payload of a response recieved from Github
    pub async fn json<T: serde::de::DeserializeOwned>(&self, response: Response) -> Result<T> {
        let payload = response.bytes().await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Log the quota of every token and record the ones that are already
    /// exhausted so they are not picked before their reset time.
    pub async fn check_credentials(&self) -> Result<Vec<(usize, Rate)>> {
        let tokens: Vec<String> = self.credentials().tokens().map(str::to_owned).collect();
        let mut rates = Vec::with_capacity(tokens.len());

        for (i, token) in tokens.iter().enumerate() {
            let core = self.rate_limit().get_for_token(token).await?.core;
            info!(
                "Token {}: {}/{} remaining (reset: {})",
                i + 1,
                core.remaining.unwrap_or_default(),
                core.limit.unwrap_or_default(),
                core.reset.map(format_epoch).unwrap_or_default(),
            );
            if core.remaining == Some(0) {
                if let Some(reset) = core.reset {
                    self.credentials().mark_token_rate_limited(token, reset);
                }
            }
            rates.push((i + 1, core));
        }

        Ok(rates)
    }

    pub fn actions(&self) -> ActionsClient {
        ActionsClient::new(self)
    }

    pub fn rate_limit(&self) -> RateLimitClient {
        RateLimitClient::new(self)
    }
}
