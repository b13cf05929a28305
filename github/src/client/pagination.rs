use crate::client::{Client, Request, Result, HEADER_LINK};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

/// Maximum number of items the API lets a caller walk through for one query
pub const MAX_RESULTS: u64 = 1000;

/// Represents `Pagination` information from a Github API request
#[derive(Debug, Default)]
pub struct Pagination {
    /// Full url of the next page, query included
    pub next_url: Option<String>,
}

impl Pagination {
    pub(super) fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let mut pagination = Self::default();

        let links = if let Some(links) = headers.get(HEADER_LINK).and_then(|h| h.to_str().ok()) {
            links
        } else {
            return pagination;
        };

        for link in links.split(',') {
            let segments: Vec<&str> = link.split(';').map(str::trim).collect();

            // Skip if we don't at least have href and rel
            if segments.len() < 2 {
                continue;
            }

            // Check if href segment is well formed and a valid url format
            let url = if segments[0].starts_with('<') && segments[0].ends_with('>') {
                if let Ok(url) = Url::parse(&segments[0][1..segments[0].len() - 1]) {
                    url
                } else {
                    continue;
                }
            } else {
                continue;
            };

            if segments[1..].iter().any(|rel| *rel == "rel=\"next\"") {
                pagination.next_url = Some(url.to_string());
            }
        }

        pagination
    }
}

/// Result of walking every page of a listing
#[derive(Debug)]
pub enum PageOutcome<T> {
    Complete(Vec<T>),
    /// The query matches more than `MAX_RESULTS` items, walking it would
    /// silently truncate the listing. Narrow the query instead.
    Overflow { total_count: u64 },
}

impl Client {
    /// Follow the `next` links of a listing whose payload looks like
    /// `{"total_count": n, "<list_key>": [...]}` until the last page, or
    /// until `limit` items were collected.
    pub async fn get_pages<T: DeserializeOwned>(
        &self,
        request: Request,
        list_key: &str,
        limit: Option<usize>,
    ) -> Result<PageOutcome<T>> {
        let mut items = Vec::new();
        let mut next = Some(request.clone());
        let mut total_count = None;
        let mut page = 0;

        while let Some(request) = next.take() {
            page += 1;
            let response = self.execute(request.clone()).await?;
            let pagination = Pagination::from_headers(response.headers());
            let mut payload: Value = self.json(response).await?;

            if total_count.is_none() {
                let total = payload["total_count"].as_u64().unwrap_or_default();
                if total > MAX_RESULTS {
                    debug!("{} matches {} items, more than {}", request.url, total, MAX_RESULTS);
                    return Ok(PageOutcome::Overflow { total_count: total });
                }
                total_count = Some(total);
            }

            let page_items = match payload.get_mut(list_key).map(Value::take) {
                Some(Value::Array(page_items)) => page_items,
                _ => return Err(format!("missing '{}' in response from {}", list_key, request.url).into()),
            };
            debug!("Page {} of {}: {} items", page, request.url, page_items.len());
            for item in page_items {
                items.push(serde_json::from_value(item)?);
            }

            if let Some(limit) = limit {
                if items.len() >= limit {
                    items.truncate(limit);
                    return Ok(PageOutcome::Complete(items));
                }
            }

            // The next link already carries the query
            next = pagination.next_url.map(|url| {
                let mut request = request.clone();
                request.url = url;
                request.query.clear();
                request
            });
        }

        let total_count = total_count.unwrap_or_default() as usize;
        if items.len() < total_count {
            warn!(
                "{}: got {} items out of {} announced",
                request.url,
                items.len(),
                total_count
            );
        }

        Ok(PageOutcome::Complete(items))
    }
}
