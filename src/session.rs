//! Per-runner HTTP session: cookie jar, redirects, throttling and the
//! debug page cache.
//!
//! Cookies are scoped to hosts. A cookie is only sent back to the host that
//! set it, or to its subdomains when `Domain` allows, so following a
//! redirect or an off-site download link never hands the session to a
//! third party.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::definition::HttpMethod;
use crate::transport::{Request, Response, Transport};
use crate::{IndexerError, Result};

const MAX_REDIRECTS: usize = 10;

/// Writes fetched pages to disk for humans debugging a definition.
#[derive(Debug, Clone)]
struct PageCache {
    dir: PathBuf,
    counter: usize,
}

impl PageCache {
    fn store(&mut self, response: &Response) {
        self.counter += 1;
        let name = format!("{:03}-{}.html", self.counter, slug(&response.url));
        let path = self.dir.join(name);
        let written = std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(&path, &response.body));
        match written {
            Ok(()) => debug!(path = %path.display(), "Cached page"),
            Err(e) => warn!(path = %path.display(), "Failed to cache page: {}", e),
        }
    }
}

fn slug(url: &Url) -> String {
    let mut raw = url.path().to_string();
    if let Some(query) = url.query() {
        raw.push('-');
        raw.push_str(query);
    }
    let slug: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(60).collect();
    if slug.is_empty() {
        "index".to_string()
    } else {
        slug
    }
}

/// A stored cookie and the requests it goes out with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    value: String,
    /// Lowercase host, without a leading dot.
    domain: String,
    /// Set without a `Domain` attribute: exact host only.
    host_only: bool,
    path: String,
}

impl StoredCookie {
    fn applies_to(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        domain_matches(&host.to_ascii_lowercase(), &self.domain, self.host_only)
            && path_matches(url.path(), &self.path)
    }
}

fn domain_matches(host: &str, domain: &str, host_only: bool) -> bool {
    host == domain
        || (!host_only
            && host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

/// Session state owned by one runner.
pub struct Session {
    site: String,
    /// Host of the site root; the configured raw cookie only goes there.
    site_host: String,
    transport: Arc<dyn Transport>,
    cookies: BTreeMap<String, StoredCookie>,
    raw_cookie: Option<String>,
    delay: Option<Duration>,
    last_request: Option<Instant>,
    cache: Option<PageCache>,
    logged_in: bool,
    last_login: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(site: impl Into<String>, site_url: &Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            site: site.into(),
            site_host: site_url.host_str().unwrap_or_default().to_ascii_lowercase(),
            transport,
            cookies: BTreeMap::new(),
            raw_cookie: None,
            delay: None,
            last_request: None,
            cache: None,
            logged_in: false,
            last_login: None,
        }
    }

    /// Minimum spacing between requests.
    pub fn with_delay(mut self, delay: Option<Duration>) -> Self {
        self.delay = delay;
        self
    }

    /// Stores every final response under `<dir>/<site>/`.
    pub fn with_page_cache(mut self, dir: PathBuf) -> Self {
        self.cache = Some(PageCache {
            dir: dir.join(&self.site),
            counter: 0,
        });
        self
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        self.last_login
    }

    pub fn mark_logged_in(&mut self, at: DateTime<Utc>) {
        self.logged_in = true;
        self.last_login = Some(at);
    }

    /// Whether a login older than `ttl_minutes` has expired.
    pub fn login_expired(&self, ttl_minutes: Option<u64>, now: DateTime<Utc>) -> bool {
        match (ttl_minutes, self.last_login) {
            (Some(ttl), Some(at)) => (now - at).num_minutes() >= ttl as i64,
            _ => false,
        }
    }

    /// Drops cookies and login state.
    pub fn clear(&mut self) {
        self.cookies.clear();
        self.raw_cookie = None;
        self.logged_in = false;
    }

    /// Installs a raw `Cookie` header value sent with every request to the
    /// site's own host.
    pub fn set_raw_cookie(&mut self, value: &str) {
        let value = value.trim();
        self.raw_cookie = (!value.is_empty()).then(|| value.to_string());
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|c| c.value.as_str())
    }

    pub async fn get(&mut self, url: Url) -> Result<Response> {
        self.fetch(Request::get(url)).await
    }

    /// Sends a request, follows redirects and fails on non-success status.
    pub async fn fetch(&mut self, request: Request) -> Result<Response> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(IndexerError::Status {
                status: response.status,
                url: response.url.to_string(),
            });
        }
        Ok(response)
    }

    /// Sends a request and follows redirects, returning the final response
    /// whatever its status. The response URL is the last URL requested.
    pub async fn send(&mut self, request: Request) -> Result<Response> {
        let mut request = request;

        for _ in 0..=MAX_REDIRECTS {
            let response = self.round_trip(&request).await?;
            if !response.is_redirect() {
                if let Some(cache) = &mut self.cache {
                    if response.is_html() {
                        cache.store(&response);
                    }
                }
                return Ok(response);
            }

            let location = response
                .header("location")
                .ok_or_else(|| IndexerError::Transport(format!("redirect without location from {}", request.url)))?;
            let next = request.url.join(location)?;
            debug!(site = %self.site, from = %request.url, to = %next, "Following redirect");

            let keep_method = matches!(response.status, 307 | 308);
            request = if keep_method {
                Request { url: next, ..request }
            } else {
                Request::get(next)
            };
        }

        Err(IndexerError::Transport(format!(
            "too many redirects from {}",
            request.url
        )))
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Response> {
        self.throttle().await;

        let mut request = request.clone();
        if let Some(cookie) = self.cookie_header(&request.url) {
            request = request.with_header("Cookie", &cookie);
        }
        debug!(site = %self.site, method = request.method.as_str(), url = %request.url, "Request");

        let response = self.transport.round_trip(&request).await;
        self.last_request = Some(Instant::now());
        let response = response?;

        let headers: Vec<String> = response.header_values("set-cookie").map(str::to_string).collect();
        for header in headers {
            self.store_cookie(&request.url, &header);
        }
        Ok(response)
    }

    async fn throttle(&self) {
        if !self.transport.throttled() {
            return;
        }
        if let (Some(delay), Some(last)) = (self.delay, self.last_request) {
            let elapsed = last.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        let mut parts: Vec<String> = self
            .cookies
            .iter()
            .filter(|(_, c)| c.applies_to(url))
            .map(|(k, c)| format!("{}={}", k, c.value))
            .collect();
        let on_site = url
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(&self.site_host));
        if let (Some(raw), true) = (&self.raw_cookie, on_site) {
            parts.push(raw.clone());
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }

    fn store_cookie(&mut self, url: &Url, header: &str) {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return;
        };
        let mut attributes = header.split(';');
        let Some((name, value)) = attributes.next().and_then(|pair| pair.split_once('=')) else {
            return;
        };
        let name = name.trim().to_string();
        let value = value.trim().trim_matches('"').to_string();

        let mut expired = false;
        let mut domain = None;
        let mut path = None;
        for attr in attributes {
            let Some((key, val)) = attr.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "max-age" => expired = val == "0" || val.starts_with('-'),
                "domain" if !val.is_empty() => {
                    domain = Some(val.trim_start_matches('.').to_ascii_lowercase())
                }
                "path" if val.starts_with('/') => path = Some(val.to_string()),
                _ => {}
            }
        }

        if let Some(domain) = &domain {
            if !domain_matches(&host, domain, false) {
                debug!(site = %self.site, host = %host, domain = %domain, "Ignoring cookie for foreign domain");
                return;
            }
        }

        if expired || value.is_empty() || value == "deleted" {
            self.cookies.remove(&name);
        } else {
            let cookie = StoredCookie {
                value,
                host_only: domain.is_none(),
                domain: domain.unwrap_or(host),
                path: path.unwrap_or_else(|| "/".to_string()),
            };
            self.cookies.insert(name, cookie);
        }
    }
}

/// Builds the request for a templated path and inputs.
pub fn build_request(
    base: &Url,
    path: &str,
    method: HttpMethod,
    inputs: &[(String, String)],
) -> Result<Request> {
    let mut url = base.join(path)?;
    match method {
        HttpMethod::Get => {
            if !inputs.is_empty() {
                url.query_pairs_mut()
                    .extend_pairs(inputs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }
            Ok(Request::get(url))
        }
        HttpMethod::Post => Ok(Request::post_form(url, inputs)),
    }
}
