//! The HTTP seam of the client. Production code goes through `reqwest`, tests
//! plug in scripted transports.

use super::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode,
};
use std::{fmt, pin::Pin};

pub type Body = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// Absolute URL
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new<S: Into<String>>(method: Method, url: S) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get<S: Into<String>>(url: S) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn query<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response whose body is already in memory, split into `chunk_size` pieces
    pub fn from_bytes<B: Into<Bytes>>(
        status: StatusCode,
        headers: HeaderMap,
        body: B,
        chunk_size: usize,
    ) -> Self {
        let body: Bytes = body.into();
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Result<Bytes>> = (0..body.len())
            .step_by(chunk_size)
            .map(|start| Ok(body.slice(start..(start + chunk_size).min(body.len()))))
            .collect();
        Self::new(status, headers, Box::pin(stream::iter(chunks)))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub async fn bytes(self) -> Result<Bytes> {
        self.bytes_limited(usize::MAX).await
    }

    /// Read the body, aborting as soon as more than `limit` bytes were received
    pub async fn bytes_limited(mut self, limit: usize) -> Result<Bytes> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            if content.len() + chunk.len() > limit {
                return Err(Error::PayloadTooLarge { limit });
            }
            content.extend_from_slice(&chunk);
        }
        Ok(content.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let response = self
            .client
            .request(request.method, &request.url)
            .query(&request.query)
            .headers(request.headers)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(Error::from);

        Ok(Response::new(status, headers, Box::pin(body)))
    }
}
