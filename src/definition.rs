//! Declarative site definitions.
//!
//! A definition describes everything that differs between tracker sites:
//! how to log in, which request performs a search, how rows and fields are
//! extracted from the response, how many pages to follow, and how to find
//! the account ratio. The runner interprets it; no site has its own code.
//!
//! ```yaml
//! site: demo
//! name: Demo
//! links: [https://demo.test/]
//! caps:
//!   categories: { "1": TV/HD, "2": Movies }
//! login:
//!   path: /login.php
//!   method: form
//!   form: form#login
//!   inputs: { username: "{{ .Config.username }}", password: "{{ .Config.password }}" }
//!   test: { path: /index.php, selector: a.logout }
//! search:
//!   path: /browse.php
//!   inputs: { search: "{{ .Keywords }}" }
//!   rows: { selector: table.torrents tr.row }
//!   fields:
//!     title: { selector: a.title }
//!     download: { selector: a.dl, attribute: href }
//! ```

use std::path::Path;

use scraper::Selector;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};

use crate::filters;
use crate::torznab::{categories, Capabilities, CategoryMapping};
use crate::{IndexerError, Result};

/// HTTP method used by a request step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Ordered `name: template` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inputs(pub Vec<(String, String)>);

impl Inputs {
    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Inputs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mapping = Mapping::deserialize(deserializer)?;
        let mut pairs = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let key = scalar(&key).ok_or_else(|| D::Error::custom("input names must be scalars"))?;
            let value = scalar(&value).unwrap_or_default();
            pairs.push((key, value));
        }
        Ok(Inputs(pairs))
    }
}

/// Field extraction rules in declaration order. Later fields may refer to
/// earlier ones through `{{ .Result.<name> }}`.
#[derive(Debug, Clone, Default)]
pub struct Fields(pub Vec<(String, SelectorBlock)>);

impl Fields {
    pub fn iter(&self) -> impl Iterator<Item = &(String, SelectorBlock)> {
        self.0.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k == name)
    }
}

impl<'de> Deserialize<'de> for Fields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mapping = Mapping::deserialize(deserializer)?;
        let mut fields = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let key = scalar(&key).ok_or_else(|| D::Error::custom("field names must be scalars"))?;
            let block: SelectorBlock = serde_yaml::from_value(value)
                .map_err(|e| D::Error::custom(format!("field {}: {}", key, e)))?;
            fields.push((key, block));
        }
        Ok(Fields(fields))
    }
}

/// One filter applied to an extracted value.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

/// How to derive one value from a page or a row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorBlock {
    /// CSS selector (HTML) or tag path (XML). Empty means the row itself.
    #[serde(default)]
    pub selector: Option<String>,
    /// Attribute to read instead of the text content.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Template producing the value without reading the page.
    #[serde(default)]
    pub text: Option<String>,
    /// Descendants whose text is dropped before reading.
    #[serde(default)]
    pub remove: Option<String>,
    /// Selector → value table; the first matching selector wins, `*` always matches.
    #[serde(default)]
    pub case: Option<Inputs>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    /// A missing optional value is skipped instead of failing the row.
    #[serde(default)]
    pub optional: bool,
    /// Value used when the selector finds nothing.
    #[serde(default)]
    pub default: Option<String>,
}

/// A credential or option the user configures per site.
#[derive(Debug, Clone, Deserialize)]
pub struct Setting {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Declared capabilities.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapsBlock {
    /// Site category id → Torznab category name or id.
    #[serde(default)]
    pub categories: Inputs,
    /// Search mode → supported parameters.
    #[serde(default)]
    pub modes: std::collections::BTreeMap<String, Vec<String>>,
}

/// Shorthand login methods that expand to steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    Form,
    Post,
    Get,
    Cookie,
}

/// One step of a login workflow.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
pub enum LoginStep {
    /// Load a page; it becomes the current page.
    Fetch { path: String },
    /// Select a form on the current page.
    Form { selector: String },
    /// Set fields of the selected form.
    Fill { inputs: Inputs },
    /// Submit the selected form.
    Submit,
    /// Send a request directly.
    Request {
        path: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default)]
        inputs: Inputs,
    },
    /// Install a raw `Cookie` header value.
    Cookie { value: String },
}

/// An error marker on the login response.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBlock {
    pub selector: String,
    /// Where to read the message from; defaults to the matched element.
    #[serde(default)]
    pub message: Option<SelectorBlock>,
}

/// A page that proves the session is logged in.
#[derive(Debug, Clone, Deserialize)]
pub struct PageTest {
    pub path: String,
    pub selector: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<LoginMethod>,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub steps: Vec<LoginStep>,
    #[serde(default)]
    pub error: Vec<ErrorBlock>,
    #[serde(default)]
    pub test: Option<PageTest>,
    /// Selectors that only match when the session is logged out.
    #[serde(default)]
    pub logged_out: Vec<String>,
    /// Minutes after which a session is considered expired.
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl LoginBlock {
    /// The step sequence, expanding the shorthand form when no explicit
    /// steps are declared.
    pub fn steps(&self) -> Vec<LoginStep> {
        if !self.steps.is_empty() {
            return self.steps.clone();
        }

        let path = self.path.clone().unwrap_or_else(|| "/".to_string());
        match self.method.unwrap_or(LoginMethod::Post) {
            LoginMethod::Form => vec![
                LoginStep::Fetch { path },
                LoginStep::Form {
                    selector: self.form.clone().unwrap_or_else(|| "form".to_string()),
                },
                LoginStep::Fill {
                    inputs: self.inputs.clone(),
                },
                LoginStep::Submit,
            ],
            LoginMethod::Post => vec![LoginStep::Request {
                path,
                method: HttpMethod::Post,
                inputs: self.inputs.clone(),
            }],
            LoginMethod::Get => vec![LoginStep::Request {
                path,
                method: HttpMethod::Get,
                inputs: self.inputs.clone(),
            }],
            LoginMethod::Cookie => vec![LoginStep::Cookie {
                value: self.inputs.get("cookie").unwrap_or_default().to_string(),
            }],
        }
    }

    /// Path of the login page, used to spot redirects back to it.
    pub fn login_path(&self) -> Option<String> {
        self.path.clone().or_else(|| {
            self.steps.iter().find_map(|s| match s {
                LoginStep::Fetch { path } | LoginStep::Request { path, .. } => Some(path.clone()),
                _ => None,
            })
        })
    }
}

/// Response format of a search page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Html,
    Xml,
}

/// A search endpoint, optionally restricted to site categories.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPath {
    pub path: String,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowsBlock {
    #[serde(default)]
    pub selector: String,
    /// Leading rows to skip, e.g. table headers.
    #[serde(default)]
    pub skip: usize,
}

/// Multi-page search.
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationBlock {
    /// Inputs overriding the search inputs on later pages.
    #[serde(default)]
    pub inputs: Inputs,
    /// Path template for later pages; defaults to the search path.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Matches only while another page exists.
    #[serde(default)]
    pub next: Option<SelectorBlock>,
    /// Total number of results on the site.
    #[serde(default)]
    pub total: Option<SelectorBlock>,
}

fn default_max_pages() -> usize {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub paths: Vec<SearchPath>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub response: ResponseKind,
    #[serde(default)]
    pub rows: RowsBlock,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default)]
    pub pagination: Option<PaginationBlock>,
}

impl SearchBlock {
    /// Declared search paths; a single `path` counts as one default path.
    pub fn search_paths(&self) -> Vec<SearchPath> {
        let mut paths = self.paths.clone();
        if let Some(path) = &self.path {
            paths.push(SearchPath {
                path: path.clone(),
                method: None,
                categories: Vec::new(),
            });
        }
        paths
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadBlock {
    /// Whether downloads need a logged in session; defaults to whether a
    /// login workflow exists.
    #[serde(default)]
    pub requires_login: Option<bool>,
    /// When set, the download URL is a details page and this rule finds
    /// the real file link on it.
    #[serde(default)]
    pub selector: Option<SelectorBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RatioBlock {
    pub path: String,
    #[serde(flatten)]
    pub value: SelectorBlock,
}

/// A self-test embedded in a definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TestCase {
    Login,
    Search {
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        params: Option<Inputs>,
        #[serde(default = "default_min_results")]
        min_results: usize,
    },
    Download,
    Ratio,
}

fn default_min_results() -> usize {
    1
}

/// A parsed and validated site definition.
#[derive(Debug, Clone, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub settings: Vec<Setting>,
    #[serde(default)]
    pub caps: CapsBlock,
    #[serde(default)]
    pub login: Option<LoginBlock>,
    #[serde(default)]
    pub search: SearchBlock,
    #[serde(default)]
    pub download: Option<DownloadBlock>,
    #[serde(default)]
    pub ratio: Option<RatioBlock>,
    /// Seconds to wait between requests to the site.
    #[serde(default)]
    pub request_delay: Option<f64>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(skip)]
    capabilities: Capabilities,
}

fn default_language() -> String {
    "en-us".to_string()
}

impl Definition {
    /// Resolved capabilities.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Primary site URL.
    pub fn base_url(&self) -> Result<url::Url> {
        let link = self
            .links
            .first()
            .ok_or_else(|| IndexerError::validation("links", "no site link declared"))?;
        Ok(url::Url::parse(link)?)
    }

    /// Display name, falling back to the key.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.site
        } else {
            &self.name
        }
    }

    /// Whether downloads must go through a logged in session.
    pub fn download_requires_login(&self) -> bool {
        self.download
            .as_ref()
            .and_then(|d| d.requires_login)
            .unwrap_or(self.login.is_some())
    }

    fn validate(&mut self) -> Result<()> {
        if self.site.trim().is_empty() {
            return Err(IndexerError::validation("site", "missing site key"));
        }
        if self.links.is_empty() {
            return Err(IndexerError::validation("links", "at least one link is required"));
        }
        for link in &self.links {
            url::Url::parse(link)
                .map_err(|e| IndexerError::validation("links", format!("{}: {}", link, e)))?;
        }

        let search = &self.search;
        if search.search_paths().is_empty() {
            return Err(IndexerError::validation(
                "search.paths",
                "at least one search path is required",
            ));
        }
        if search.rows.selector.trim().is_empty() {
            return Err(IndexerError::validation("search.rows.selector", "missing"));
        }
        if !search.fields.contains("title") {
            return Err(IndexerError::validation("search.fields.title", "missing"));
        }
        if !search.fields.contains("download") && !search.fields.contains("magnet") {
            return Err(IndexerError::validation(
                "search.fields.download",
                "a download or magnet field is required",
            ));
        }

        let css = search.response == ResponseKind::Html;
        if css {
            check_css("search.rows.selector", &search.rows.selector)?;
        }
        for (name, block) in search.fields.iter() {
            check_block(&format!("search.fields.{}", name), block, css)?;
        }
        if let Some(pagination) = &search.pagination {
            if let Some(next) = &pagination.next {
                check_block("search.pagination.next", next, css)?;
            }
            if let Some(total) = &pagination.total {
                check_block("search.pagination.total", total, css)?;
            }
        }

        if let Some(login) = &self.login {
            for step in login.steps() {
                if let LoginStep::Form { selector } = step {
                    check_css("login.form", &selector)?;
                }
            }
            for error in &login.error {
                check_css("login.error", &error.selector)?;
                if let Some(message) = &error.message {
                    check_block("login.error.message", message, true)?;
                }
            }
            if let Some(test) = &login.test {
                check_css("login.test.selector", &test.selector)?;
            }
            for selector in &login.logged_out {
                check_css("login.logged_out", selector)?;
            }
        }
        if let Some(download) = &self.download {
            if let Some(block) = &download.selector {
                check_block("download.selector", block, true)?;
            }
        }
        if let Some(ratio) = &self.ratio {
            check_block("ratio", &ratio.value, true)?;
        }

        self.capabilities = resolve_caps(&self.caps)?;
        Ok(())
    }
}

fn check_css(field: &str, selector: &str) -> Result<()> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| IndexerError::validation(field, format!("bad selector '{}': {:?}", selector, e)))
}

fn check_block(field: &str, block: &SelectorBlock, css: bool) -> Result<()> {
    if css {
        if let Some(selector) = block.selector.as_deref().filter(|s| !s.trim().is_empty()) {
            check_css(field, selector)?;
        }
        if let Some(remove) = &block.remove {
            check_css(field, remove)?;
        }
        if let Some(case) = &block.case {
            for (selector, _) in case.iter() {
                if selector != "*" {
                    check_css(field, selector)?;
                }
            }
        }
    }
    for filter in &block.filters {
        if !filters::is_known(&filter.name) {
            return Err(IndexerError::validation(
                format!("{}.filters", field),
                format!("unknown filter '{}'", filter.name),
            ));
        }
    }
    Ok(())
}

fn resolve_caps(caps: &CapsBlock) -> Result<Capabilities> {
    let mut resolved = Capabilities::default();

    for (site_id, name) in caps.categories.iter() {
        let category = name
            .parse::<u32>()
            .ok()
            .and_then(categories::by_id)
            .or_else(|| categories::by_name(name))
            .ok_or_else(|| {
                IndexerError::validation(
                    format!("caps.categories.{}", site_id),
                    format!("unknown category '{}'", name),
                )
            })?;
        resolved.categories.push(CategoryMapping {
            site_id: site_id.clone(),
            category,
        });
    }

    resolved.modes = caps.modes.clone();
    resolved
        .modes
        .entry("search".to_string())
        .or_insert_with(|| vec!["q".to_string()]);
    Ok(resolved)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Parses and validates a definition document.
pub fn parse_definition(source: &str) -> Result<Definition> {
    let mut definition: Definition = serde_yaml::from_str(source)
        .map_err(|e| IndexerError::validation("document", e.to_string()))?;
    definition.validate()?;
    Ok(definition)
}

/// Reads and parses a definition file.
pub fn load_definition_file(path: &Path) -> Result<Definition> {
    let source = std::fs::read_to_string(path)?;
    parse_definition(&source)
}
