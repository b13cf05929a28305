use crate::client::{Client, Request, Result, HEADER_RATE_LIMIT, HEADER_RATE_REMAINING, HEADER_RATE_RESET};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Rate {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// UTC epoch seconds at which the quota is refilled
    pub reset: Option<i64>,
}

impl Rate {
    pub(super) fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        fn parse<T: std::str::FromStr>(
            headers: &reqwest::header::HeaderMap,
            name: &str,
        ) -> Option<T> {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        }

        Self {
            limit: parse(headers, HEADER_RATE_LIMIT),
            remaining: parse(headers, HEADER_RATE_REMAINING),
            reset: parse(headers, HEADER_RATE_RESET),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimits {
    // The rate limit for non-search API v3 requests. Authenticated requests
    // are limited to 5,000 per hour.
    //
    // GitHub API docs: https://docs.github.com/en/rest/overview/resources-in-the-rest-api#rate-limiting
    pub core: Rate,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimits,
}

/// `RateLimitClient` handles communication with the rate_limit related methods of the GitHub API.
///
/// GitHub API docs: https://docs.github.com/en/rest/rate-limit
pub struct RateLimitClient<'a> {
    inner: &'a Client,
}

impl<'a> RateLimitClient<'a> {
    pub(super) fn new(client: &'a Client) -> Self {
        Self { inner: client }
    }

    /// Query the rate limit status of a specific token, bypassing rotation.
    /// Note: Accessing this endpoint does not count against your REST API rate limit.
    pub async fn get_for_token(&self, token: &str) -> Result<RateLimits> {
        let request = self.inner.authorize(Request::get(self.inner.url("rate_limit")), token)?;
        let response = self.inner.send_once(request).await?;
        let rate_limit_response: RateLimitResponse = self.inner.json(response).await?;

        Ok(rate_limit_response.resources)
    }
}
