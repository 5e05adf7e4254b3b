//! HTTP archives (HAR 1.2 subset) used to record and replay sessions.
//!
//! Request bodies are stored verbatim and replay matches on them, so an
//! archive only replays with the same credentials and search terms it was
//! recorded with. A login form body holds the password in clear text:
//! keep archives private, and record again after changing credentials.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::{Request, Response};
use crate::{IndexerError, Result};

/// Response headers kept in archives.
const KEPT_RESPONSE_HEADERS: &[&str] = &["content-type", "location", "set-cookie", "content-disposition"];
/// Request headers kept in archives. Cookies are left out.
const KEPT_REQUEST_HEADERS: &[&str] = &["content-type", "referer"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub log: Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub started_date_time: String,
    /// Milliseconds.
    #[serde(default)]
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    #[serde(default = "http_version")]
    pub http_version: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default = "http_version")]
    pub http_version: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub content: Content,
    #[serde(rename = "redirectURL", default)]
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: usize,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub text: String,
    /// `base64` for binary bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

fn http_version() -> String {
    "HTTP/1.1".to_string()
}

impl Archive {
    pub fn new() -> Self {
        Self {
            log: Log {
                version: "1.2".to_string(),
                creator: Creator {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                entries: Vec::new(),
            },
        }
    }

    pub fn entries_mut(&mut self) -> &mut Vec<Entry> {
        &mut self.log.entries
    }

    pub fn len(&self) -> usize {
        self.log.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.entries.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

fn kept_headers(headers: &[(String, String)], kept: &[&str]) -> Vec<Header> {
    headers
        .iter()
        .filter(|(k, _)| kept.iter().any(|h| k.eq_ignore_ascii_case(h)))
        .map(|(k, v)| Header {
            name: k.clone(),
            value: v.clone(),
        })
        .collect()
}

impl Entry {
    /// Records one exchange.
    pub fn from_exchange(
        request: &Request,
        response: &Response,
        started: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        let (text, encoding) = match std::str::from_utf8(&response.body) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (STANDARD.encode(&response.body), Some("base64".to_string())),
        };

        Self {
            started_date_time: started.to_rfc3339_opts(SecondsFormat::Millis, true),
            time: elapsed.as_secs_f64() * 1000.0,
            request: HarRequest {
                method: request.method.as_str().to_string(),
                url: request.url.to_string(),
                http_version: http_version(),
                headers: kept_headers(&request.headers, KEPT_REQUEST_HEADERS),
                post_data: request.body.as_ref().map(|body| PostData {
                    mime_type: request
                        .header("content-type")
                        .unwrap_or("application/x-www-form-urlencoded")
                        .to_string(),
                    text: body.clone(),
                }),
            },
            response: HarResponse {
                status: response.status,
                status_text: String::new(),
                http_version: http_version(),
                headers: kept_headers(&response.headers, KEPT_RESPONSE_HEADERS),
                content: Content {
                    size: response.body.len(),
                    mime_type: response.content_type().unwrap_or_default().to_string(),
                    text,
                    encoding,
                },
                redirect_url: response.header("location").unwrap_or_default().to_string(),
            },
        }
    }

    /// Whether the entry was recorded for this request: same method, URL
    /// and body. A login posted with other credentials does not match.
    pub fn matches(&self, request: &Request) -> bool {
        let body = self.request.post_data.as_ref().map(|p| p.text.as_str());
        self.request.method.eq_ignore_ascii_case(request.method.as_str())
            && self.request.url == request.url.as_str()
            && body.unwrap_or_default() == request.body.as_deref().unwrap_or_default()
    }

    /// Rebuilds the recorded response.
    pub fn to_response(&self) -> Result<Response> {
        let content = &self.response.content;
        let body = match content.encoding.as_deref() {
            Some("base64") => STANDARD.decode(content.text.as_bytes()).map_err(|e| {
                IndexerError::validation("archive", format!("bad base64 body: {}", e))
            })?,
            _ => content.text.as_bytes().to_vec(),
        };
        Ok(Response {
            status: self.response.status,
            url: Url::parse(&self.request.url)?,
            headers: self
                .response
                .headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(body: Vec<u8>, content_type: &str) -> Entry {
        let request = Request::post_form(
            Url::parse("https://demo.test/login.php").unwrap(),
            &[("username".to_string(), "me".to_string())],
        )
        .with_header("Cookie", "secret=1");
        let response = Response {
            status: 302,
            url: Url::parse("https://demo.test/login.php").unwrap(),
            headers: vec![
                ("Content-Type".to_string(), content_type.to_string()),
                ("Location".to_string(), "/index.php".to_string()),
                ("Set-Cookie".to_string(), "uid=1".to_string()),
                ("Server".to_string(), "nginx".to_string()),
            ],
            body,
        };
        Entry::from_exchange(&request, &response, Utc::now(), Duration::from_millis(12))
    }

    #[test]
    fn test_entry_keeps_header_subset() {
        let entry = exchange(b"ok".to_vec(), "text/html");
        assert!(entry.request.headers.iter().all(|h| h.name != "Cookie"));
        assert_eq!(entry.response.headers.len(), 3);
        assert_eq!(entry.response.redirect_url, "/index.php");
        assert_eq!(entry.request.post_data.as_ref().unwrap().text, "username=me");
        assert_eq!(entry.request.method, "POST");
    }

    #[test]
    fn test_binary_body_base64() {
        let body = vec![0u8, 159, 146, 150, 255];
        let entry = exchange(body.clone(), "application/x-bittorrent");
        assert_eq!(entry.response.content.encoding.as_deref(), Some("base64"));
        assert_eq!(entry.to_response().unwrap().body, body);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures").join("demo.har");
        let mut archive = Archive::new();
        archive.entries_mut().push(exchange(b"<html>hi</html>".to_vec(), "text/html"));
        archive.save(&path).unwrap();

        let loaded = Archive::load(&path).unwrap();
        assert_eq!(loaded, archive);
        assert_eq!(loaded.len(), 1);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"startedDateTime\""));
        assert!(raw.contains("\"redirectURL\""));
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.har");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(Archive::load(&path), Err(IndexerError::Json(_))));
    }
}
