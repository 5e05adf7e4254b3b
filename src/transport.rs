//! HTTP exchange abstraction.
//!
//! A `Transport` performs exactly one request/response exchange; it never
//! follows redirects or keeps cookies (the session does both). The live
//! transport talks to the network, the recording transport wraps another
//! transport and appends every exchange to an archive, and the replay
//! transport answers from an archive without touching the network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::archive::{Archive, Entry};
use crate::definition::HttpMethod;
use crate::{IndexerError, Result};

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    /// Form-encoded body.
    pub body: Option<String>,
}

impl Request {
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// A POST with `application/x-www-form-urlencoded` fields.
    pub fn post_form(url: Url, fields: &[(String, String)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        Self {
            method: HttpMethod::Post,
            url,
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    /// URL the response was served for.
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Every value of a repeated header such as `Set-Cookie`.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// Whether the body is an HTML page rather than a file.
    pub fn is_html(&self) -> bool {
        match self.content_type() {
            Some(ct) => ct.contains("html"),
            None => {
                let head = String::from_utf8_lossy(&self.body[..self.body.len().min(512)]).to_lowercase();
                head.contains("<html") || head.contains("<!doctype html")
            }
        }
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Performs single HTTP exchanges.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and returns the response as received; redirects
    /// are returned, not followed.
    async fn round_trip(&self, request: &Request) -> Result<Response>;

    /// Whether per-site request delays apply.
    fn throttled(&self) -> bool {
        true
    }
}

/// Live network transport backed by reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; tracker-proxy/0.1)")
            .redirect(Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Uses a preconfigured client. It should not follow redirects.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(timeout_or_http)?;
        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(timeout_or_http)?.to_vec();

        debug!(url = %request.url, status, bytes = body.len(), "HTTP exchange");
        Ok(Response {
            status,
            url,
            headers,
            body,
        })
    }
}

fn timeout_or_http(err: reqwest::Error) -> IndexerError {
    if err.is_timeout() {
        IndexerError::Timeout
    } else {
        IndexerError::Http(err)
    }
}

/// Wraps a transport and appends every exchange to an archive.
pub struct RecordingTransport {
    inner: Arc<dyn Transport>,
    archive: Arc<Mutex<Archive>>,
}

impl RecordingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            archive: Arc::new(Mutex::new(Archive::new())),
        }
    }

    /// Shared handle to the archive being recorded.
    pub fn archive(&self) -> Arc<Mutex<Archive>> {
        Arc::clone(&self.archive)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let started = chrono::Utc::now();
        let clock = std::time::Instant::now();
        let response = self.inner.round_trip(request).await?;
        let entry = Entry::from_exchange(request, &response, started, clock.elapsed());
        self.archive
            .lock()
            .map_err(|_| IndexerError::Transport("archive lock poisoned".to_string()))?
            .entries_mut()
            .push(entry);
        Ok(response)
    }

    fn throttled(&self) -> bool {
        self.inner.throttled()
    }
}

/// Answers requests from a recorded archive.
///
/// A request matches an entry with the same method, URL and body. The
/// first unused match is served; once all matches are used the last one
/// repeats. No match is a `ReplayMismatch`.
pub struct ReplayTransport {
    entries: Vec<Entry>,
    used: Mutex<Vec<bool>>,
}

impl ReplayTransport {
    pub fn new(archive: Archive) -> Self {
        let entries = archive.log.entries;
        let used = Mutex::new(vec![false; entries.len()]);
        Self { entries, used }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let mut used = self
            .used
            .lock()
            .map_err(|_| IndexerError::Transport("replay lock poisoned".to_string()))?;

        let matching: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.matches(request))
            .map(|(i, _)| i)
            .collect();

        let chosen = matching
            .iter()
            .copied()
            .find(|i| !used[*i])
            .or_else(|| matching.last().copied())
            .ok_or_else(|| IndexerError::ReplayMismatch {
                method: request.method.as_str().to_string(),
                url: request.url.to_string(),
            })?;
        used[chosen] = true;

        debug!(url = %request.url, entry = chosen, "Replayed exchange");
        self.entries[chosen].to_response()
    }

    fn throttled(&self) -> bool {
        false
    }
}
