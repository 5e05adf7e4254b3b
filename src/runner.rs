//! Definition interpreter.
//!
//! A `Runner` executes one site definition: it logs in when needed,
//! renders search requests, extracts and normalizes results, follows
//! pagination and fetches downloads. It owns its session, so operations
//! take `&mut self`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::definition::{Definition, HttpMethod, LoginBlock, LoginStep, RatioBlock, ResponseKind, SearchPath};
use crate::extract::{self, Form};
use crate::indexer::{Download, Indexer, IndexerInfo};
use crate::session::{build_request, Session};
use crate::torznab::{categories, Capabilities, Feed, Query};
use crate::transport::{HttpTransport, Request, Response, Transport};
use crate::{config, template, IndexerError, Result};

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Uninitialized,
    LoggedOut,
    LoggingIn,
    LoggedIn,
    Searching,
    Downloading,
    ComputingRatio,
}

/// Options shared by the runners of one process.
#[derive(Clone)]
pub struct RunnerOpts {
    pub config: Arc<dyn Config>,
    /// Write every fetched page to the cache directory.
    pub cache_pages: bool,
    pub cache_dir: Option<PathBuf>,
    /// Global cap on pages fetched per search.
    pub max_pages: usize,
    pub request_timeout: Duration,
    /// Transport to use instead of the live network.
    pub transport: Option<Arc<dyn Transport>>,
}

impl RunnerOpts {
    pub fn new(config: Arc<dyn Config>) -> Self {
        Self {
            config,
            cache_pages: false,
            cache_dir: None,
            max_pages: 10,
            request_timeout: Duration::from_secs(30),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enables the page cache; `None` uses the default cache directory.
    pub fn with_page_cache(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_pages = true;
        self.cache_dir = dir;
        self
    }
}

/// Executes one definition.
pub struct Runner {
    definition: Arc<Definition>,
    config: Arc<dyn Config>,
    max_pages: usize,
    session: Session,
    state: RunnerState,
}

impl Runner {
    pub fn new(definition: Arc<Definition>, opts: RunnerOpts) -> Result<Self> {
        let transport: Arc<dyn Transport> = match &opts.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new(opts.request_timeout)?),
        };

        let delay = definition
            .request_delay
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64);
        let site_url = site_url(&definition, opts.config.as_ref())?;
        let mut session =
            Session::new(definition.site.clone(), &site_url, transport).with_delay(delay);
        if opts.cache_pages {
            let dir = match &opts.cache_dir {
                Some(dir) => dir.clone(),
                None => config::cache_dir()?,
            };
            session = session.with_page_cache(dir);
        }

        Ok(Self {
            definition,
            config: opts.config,
            max_pages: opts.max_pages.max(1),
            session,
            state: RunnerState::Uninitialized,
        })
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Logs in unless the session is already logged in.
    pub async fn ensure_login(&mut self) -> Result<()> {
        let def = Arc::clone(&self.definition);
        let now = Utc::now();

        let Some(login) = &def.login else {
            if !self.session.is_logged_in() {
                self.session.mark_logged_in(now);
            }
            self.state = RunnerState::LoggedIn;
            return Ok(());
        };

        if self.state == RunnerState::LoggedIn
            && self.session.is_logged_in()
            && !self.session.login_expired(login.ttl, now)
        {
            return Ok(());
        }

        self.state = RunnerState::LoggingIn;
        debug!(site = %def.site, "Logging in");
        match self.run_login(login).await {
            Ok(()) => {
                self.session.mark_logged_in(Utc::now());
                self.state = RunnerState::LoggedIn;
                info!(site = %def.site, "Logged in");
                Ok(())
            }
            Err(e) => {
                self.session.clear();
                self.state = RunnerState::LoggedOut;
                warn!(site = %def.site, "Login failed: {}", e);
                Err(match e {
                    IndexerError::Validation { .. }
                    | IndexerError::Extraction { .. }
                    | IndexerError::Status { .. } => IndexerError::Auth(e.to_string()),
                    other => other,
                })
            }
        }
    }

    async fn run_login(&mut self, login: &LoginBlock) -> Result<()> {
        let context = self.context(None, &[], 0, 0)?;
        let base = self.base_url()?;
        let mut page: Option<Response> = None;
        let mut form: Option<Form> = None;

        for step in login.steps() {
            match step {
                LoginStep::Fetch { path } => {
                    let url = base.join(&template::render(&path, &context)?)?;
                    page = Some(self.session.fetch(Request::get(url)).await?);
                }
                LoginStep::Form { selector } => {
                    let current = page
                        .as_ref()
                        .ok_or_else(|| IndexerError::Auth("form step before any page was fetched".to_string()))?;
                    form = Some(extract::find_form(&current.text(), &selector, &current.url)?);
                }
                LoginStep::Fill { inputs } => {
                    let selected = form
                        .as_mut()
                        .ok_or_else(|| IndexerError::Auth("fill step without a selected form".to_string()))?;
                    for (name, value) in inputs.iter() {
                        selected.set(name, template::render(value, &context)?);
                    }
                }
                LoginStep::Submit => {
                    let submitted = form
                        .take()
                        .ok_or_else(|| IndexerError::Auth("submit step without a selected form".to_string()))?;
                    let request = build_request(&submitted.action, "", submitted.method, &submitted.fields)?;
                    page = Some(self.session.fetch(request).await?);
                }
                LoginStep::Request {
                    path,
                    method,
                    inputs,
                } => {
                    let inputs = render_inputs(inputs.iter(), &context)?;
                    let path = template::render(&path, &context)?;
                    let request = build_request(&base, &path, method, &inputs)?;
                    page = Some(self.session.fetch(request).await?);
                }
                LoginStep::Cookie { value } => {
                    self.session.set_raw_cookie(&template::render(&value, &context)?);
                }
            }
        }

        if let Some(response) = &page {
            if let Some(message) = extract::login_error(&response.text(), &login.error, &context)? {
                return Err(IndexerError::Auth(message));
            }
        }

        if let Some(test) = &login.test {
            let url = base.join(&template::render(&test.path, &context)?)?;
            let response = self.session.fetch(Request::get(url)).await?;
            if !extract::html_matches(&response.text(), &test.selector)? {
                return Err(IndexerError::Auth(format!(
                    "login test selector '{}' did not match",
                    test.selector
                )));
            }
        }
        Ok(())
    }

    /// Site root: the `url` setting of the site's config section when set,
    /// else the definition's first link.
    pub fn base_url(&self) -> Result<Url> {
        site_url(&self.definition, self.config.as_ref())
    }

    /// Whether a response shows the session was logged out.
    fn is_logged_out(&self, response: &Response, requested: &Url) -> Result<bool> {
        let Some(login) = &self.definition.login else {
            return Ok(false);
        };

        if response.is_html() && !login.logged_out.is_empty() {
            let body = response.text();
            for selector in &login.logged_out {
                if extract::html_matches(&body, selector)? {
                    return Ok(true);
                }
            }
        }

        if let Some(path) = login.login_path() {
            let context = self.context(None, &[], 0, 0)?;
            let login_url = self.base_url()?.join(&template::render(&path, &context)?)?;
            if response.url.path() == login_url.path() && requested.path() != login_url.path() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Maps an attempt's result onto the state machine. `Ok(None)` asks the
    /// caller to log in again and retry; that happens at most once.
    ///
    /// Only a logged-out page earns the retry. A login rejected by the site
    /// (`Auth`) is returned as is, both on the first login and on the
    /// re-login, since sending the same credentials again cannot succeed.
    fn settle<T>(&mut self, result: Result<T>, retried: &mut bool) -> Result<Option<T>> {
        match result {
            Ok(value) => {
                self.state = self.resting_state();
                Ok(Some(value))
            }
            Err(IndexerError::SessionExpired) => {
                warn!(site = %self.definition.site, retried = *retried, "Session is logged out");
                self.session.clear();
                self.state = RunnerState::LoggedOut;
                if *retried {
                    Err(IndexerError::Auth(
                        "still logged out after logging in again".to_string(),
                    ))
                } else {
                    *retried = true;
                    Ok(None)
                }
            }
            Err(e) => {
                self.state = if e.is_transport() {
                    RunnerState::LoggedOut
                } else {
                    self.resting_state()
                };
                Err(e)
            }
        }
    }

    fn resting_state(&self) -> RunnerState {
        if self.session.is_logged_in() {
            RunnerState::LoggedIn
        } else {
            RunnerState::LoggedOut
        }
    }

    /// Data context for templates.
    fn context(&self, query: Option<&Query>, site_categories: &[String], page: usize, offset: usize) -> Result<Value> {
        let mut settings = Map::new();
        for setting in &self.definition.settings {
            if let Some(default) = &setting.default {
                settings.insert(setting.name.clone(), Value::String(default.clone()));
            }
        }
        for (key, value) in self.config.section(&self.definition.site)? {
            settings.insert(key, Value::String(value));
        }

        let query_value = match query {
            Some(q) => json!({
                "Type": q.kind().as_param(),
                "Q": q.term().unwrap_or_default(),
                "Keywords": q.keywords(),
                "Season": q.season(),
                "Ep": q.episode(),
                "IMDBID": q.imdb_id(),
                "IMDBIDShort": q.imdb_id().map(|id| id.trim_start_matches("tt").to_string()),
                "TVDBID": q.tvdb_id(),
                "TVMazeID": q.tvmaze_id(),
                "TVRageID": q.tvrage_id(),
                "Limit": q.limit(),
                "Offset": q.offset(),
                "Categories": q.categories(),
            }),
            None => json!({}),
        };

        Ok(json!({
            "Config": settings,
            "Query": query_value,
            "Keywords": query.map(|q| q.keywords()).unwrap_or_default(),
            "Categories": site_categories,
            "Page": page,
            "Offset": offset,
        }))
    }

    async fn search_once(&mut self, query: &Query) -> Result<Feed> {
        let def = Arc::clone(&self.definition);
        let search = &def.search;
        let base = self.base_url()?;
        let site_categories = def.capabilities().site_categories(query.categories());

        let paths = search.search_paths();
        let path = select_path(&paths, &site_categories)
            .ok_or_else(|| IndexerError::validation("search.paths", "no search path"))?;
        let method = path.method.unwrap_or(search.method);

        let pagination = search.pagination.as_ref();
        let max_pages = pagination
            .map(|p| p.max_pages.min(self.max_pages))
            .unwrap_or(1)
            .max(1);
        let wanted = query.limit().map(|limit| query.offset() + limit);
        let now = Utc::now();

        let mut feed = Feed::new(self.info().into());
        let mut rows_seen = 0;

        for page in 0..max_pages {
            let context = self.context(Some(query), &site_categories, page, rows_seen)?;
            let (path_template, input_templates) = match pagination {
                Some(p) if page > 0 => {
                    let mut inputs = search.inputs.0.clone();
                    for (name, value) in p.inputs.iter() {
                        match inputs.iter_mut().find(|(k, _)| k == name) {
                            Some(existing) => existing.1 = value.clone(),
                            None => inputs.push((name.clone(), value.clone())),
                        }
                    }
                    (p.path.clone().unwrap_or_else(|| path.path.clone()), inputs)
                }
                _ => (path.path.clone(), search.inputs.0.clone()),
            };

            let mut inputs = render_inputs(input_templates.iter(), &context)?;
            let raw = take_raw(&mut inputs);
            let mut request = build_request(&base, &template::render(&path_template, &context)?, method, &inputs)?;
            if let Some(raw) = raw {
                append_raw(&mut request, &raw);
            }
            let requested = request.url.clone();

            let response = self.session.fetch(request).await?;
            if self.is_logged_out(&response, &requested)? {
                return Err(IndexerError::SessionExpired);
            }

            let extracted = extract::extract_search_page(&def, &response.text(), &context)?;
            let row_count = extracted.rows.len();
            rows_seen += row_count;

            for row in &extracted.rows {
                let item = extract::build_item(&def, row, &response.url, now)?;
                let wanted_category = query.categories().is_empty()
                    || item.categories.is_empty()
                    || item
                        .categories
                        .iter()
                        .any(|c| categories::matches(query.categories(), *c));
                if wanted_category {
                    feed.items.push(item);
                }
            }
            debug!(site = %def.site, page, rows = row_count, kept = feed.items.len(), "Extracted page");

            if page + 1 >= max_pages || row_count == 0 {
                break;
            }
            if matches!(extracted.total, Some(total) if rows_seen >= total) {
                break;
            }
            if extracted.has_next == Some(false) {
                break;
            }
            if matches!(wanted, Some(wanted) if feed.items.len() >= wanted) {
                break;
            }
        }

        let items = std::mem::take(&mut feed.items);
        feed.items = items
            .into_iter()
            .skip(query.offset())
            .take(query.limit().unwrap_or(usize::MAX))
            .collect();
        Ok(feed)
    }

    async fn download_once(&mut self, link: &str) -> Result<Download> {
        let def = Arc::clone(&self.definition);
        if link.trim_start().starts_with("magnet:") {
            return Err(IndexerError::NotSupported("magnet links have no file to download".to_string()));
        }
        let mut url = self.base_url()?.join(link)?;

        if let Some(selector) = def.download.as_ref().and_then(|d| d.selector.as_ref()) {
            let requested = url.clone();
            let details = self.session.fetch(Request::get(url.clone())).await?;
            if self.is_logged_out(&details, &requested)? {
                return Err(IndexerError::SessionExpired);
            }
            let context = self.context(None, &[], 0, 0)?;
            let found = extract::extract_page_value(&details.text(), ResponseKind::Html, selector, &context)
                .map_err(|e| IndexerError::extraction(&def.site, "download.selector", e.to_string()))?
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| IndexerError::extraction(&def.site, "download.selector", "no link on details page"))?;
            if found.trim_start().starts_with("magnet:") {
                return Err(IndexerError::NotSupported("magnet links have no file to download".to_string()));
            }
            url = details.url.join(found.trim())?;
        }

        let requested = url.clone();
        let response = self.session.fetch(Request::get(url)).await?;
        if response.is_html() && self.is_logged_out(&response, &requested)? {
            return Err(IndexerError::SessionExpired);
        }
        debug!(site = %def.site, url = %requested, bytes = response.body.len(), "Downloaded");

        Ok(Download {
            content_type: response.content_type().map(str::to_string),
            body: response.body,
        })
    }

    async fn ratio_once(&mut self, ratio: &RatioBlock) -> Result<f64> {
        let def = Arc::clone(&self.definition);
        let context = self.context(None, &[], 0, 0)?;
        let url = self.base_url()?.join(&template::render(&ratio.path, &context)?)?;
        let requested = url.clone();
        let response = self.session.fetch(Request::get(url)).await?;
        if self.is_logged_out(&response, &requested)? {
            return Err(IndexerError::SessionExpired);
        }

        let value = extract::extract_page_value(&response.text(), ResponseKind::Html, &ratio.value, &context)
            .map_err(|e| IndexerError::extraction(&def.site, "ratio", e.to_string()))?
            .ok_or_else(|| IndexerError::extraction(&def.site, "ratio", "selector did not match"))?;
        extract::parse_number(&value)
            .ok_or_else(|| IndexerError::extraction(&def.site, "ratio", format!("'{}' is not a number", value)))
    }
}

#[async_trait]
impl Indexer for Runner {
    fn info(&self) -> IndexerInfo {
        let def = &self.definition;
        IndexerInfo {
            key: def.site.clone(),
            title: def.display_name().to_string(),
            description: def.description.clone(),
            link: self
                .base_url()
                .map(|url| url.to_string())
                .unwrap_or_else(|_| def.links.first().cloned().unwrap_or_default()),
            language: def.language.clone(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.definition.capabilities().clone()
    }

    async fn search(&mut self, query: &Query) -> Result<Feed> {
        let mut retried = false;
        loop {
            self.ensure_login().await?;
            self.state = RunnerState::Searching;
            debug!(site = %self.definition.site, query = ?query.to_params(), "Searching");
            let result = self.search_once(query).await;
            if let Some(feed) = self.settle(result, &mut retried)? {
                return Ok(feed);
            }
        }
    }

    async fn download(&mut self, url: &str) -> Result<Download> {
        let mut retried = false;
        loop {
            if self.definition.download_requires_login() {
                self.ensure_login().await?;
            }
            self.state = RunnerState::Downloading;
            let result = self.download_once(url).await;
            if let Some(download) = self.settle(result, &mut retried)? {
                return Ok(download);
            }
        }
    }

    async fn ratio(&mut self) -> Result<f64> {
        let Some(ratio) = self.definition.ratio.clone() else {
            return Err(IndexerError::NotSupported(format!(
                "{} has no ratio workflow",
                self.definition.site
            )));
        };
        let mut retried = false;
        loop {
            self.ensure_login().await?;
            self.state = RunnerState::ComputingRatio;
            let result = self.ratio_once(&ratio).await;
            if let Some(value) = self.settle(result, &mut retried)? {
                return Ok(value);
            }
        }
    }
}

/// Picks the path whose categories intersect the requested site
/// categories, else the first path without categories, else the first.
fn site_url(definition: &Definition, config: &dyn Config) -> Result<Url> {
    match config.get(&definition.site, "url")? {
        Some(url) if !url.trim().is_empty() => Ok(Url::parse(url.trim())?),
        _ => definition.base_url(),
    }
}

fn select_path<'a>(paths: &'a [SearchPath], site_categories: &[String]) -> Option<&'a SearchPath> {
    paths
        .iter()
        .find(|p| {
            !p.categories.is_empty() && p.categories.iter().any(|c| site_categories.contains(c))
        })
        .or_else(|| paths.iter().find(|p| p.categories.is_empty()))
        .or_else(|| paths.first())
}

fn render_inputs<'a>(
    inputs: impl Iterator<Item = &'a (String, String)>,
    context: &Value,
) -> Result<Vec<(String, String)>> {
    inputs
        .map(|(name, value)| Ok((name.clone(), template::render(value, context)?)))
        .collect()
}

/// Removes the `$raw` input, which carries a preformatted query string.
fn take_raw(inputs: &mut Vec<(String, String)>) -> Option<String> {
    let index = inputs.iter().position(|(k, _)| k == "$raw")?;
    let (_, raw) = inputs.remove(index);
    let raw = raw.trim_start_matches(['&', '?']).trim_end_matches('&').to_string();
    (!raw.is_empty()).then_some(raw)
}

fn append_raw(request: &mut Request, raw: &str) {
    match request.method {
        HttpMethod::Get => {
            let query = match request.url.query() {
                Some(existing) if !existing.is_empty() => format!("{}&{}", existing, raw),
                _ => raw.to_string(),
            };
            request.url.set_query(Some(&query));
        }
        HttpMethod::Post => {
            request.body = Some(match request.body.take() {
                Some(body) if !body.is_empty() => format!("{}&{}", body, raw),
                _ => raw.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::definition::parse_definition;
    use std::sync::Mutex;

    type Reply = (u16, Vec<(&'static str, String)>, String);
    type Handler = Box<dyn Fn(&Request, usize) -> Reply + Send + Sync>;

    /// In-process fake tracker. The handler gets the request and how many
    /// requests were made to the same path before it.
    struct FakeSite {
        handler: Handler,
        seen: Mutex<Vec<Request>>,
    }

    impl FakeSite {
        fn new<F>(handler: F) -> Arc<Self>
        where
            F: Fn(&Request, usize) -> Reply + Send + Sync + 'static,
        {
            Arc::new(Self {
                handler: Box::new(handler),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, path: &str) -> usize {
            self.seen.lock().unwrap().iter().filter(|r| r.url.path() == path).count()
        }
    }

    #[async_trait]
    impl Transport for FakeSite {
        async fn round_trip(&self, request: &Request) -> Result<Response> {
            let nth = self.count(request.url.path());
            self.seen.lock().unwrap().push(request.clone());
            let (status, headers, body) = (self.handler)(request, nth);
            let mut headers: Vec<(String, String)> =
                headers.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
            if !headers.iter().any(|(k, _)| k == "Content-Type") {
                headers.push(("Content-Type".to_string(), "text/html".to_string()));
            }
            Ok(Response {
                status,
                url: request.url.clone(),
                headers,
                body: body.into_bytes(),
            })
        }

        fn throttled(&self) -> bool {
            false
        }
    }

    const SITE: &str = r#"
site: fake
name: Fake
links: [https://fake.test/]
settings:
  - { name: username, type: text }
  - { name: password, type: password }
caps:
  categories: { "1": TV, "2": Movies }
login:
  path: /login.php
  method: post
  inputs: { username: "{{ .Config.username }}", password: "{{ .Config.password }}" }
  error:
    - selector: div.error
  logged_out: ["form#login"]
search:
  paths:
    - { path: /tv.php, categories: ["1"] }
    - { path: /browse.php }
  inputs: { q: "{{ .Keywords }}", page: "{{ .Page }}" }
  rows: { selector: tr.row }
  fields:
    title: { selector: a.title }
    download: { selector: a.dl, attribute: href }
    category: { text: "1" }
  pagination:
    max_pages: 5
    next: { selector: a.next }
ratio:
  path: /user.php
  selector: span.ratio
"#;

    fn rows(n: usize, next: bool) -> String {
        let mut body = String::from("<html><body><table>");
        for i in 0..n {
            body.push_str(&format!(
                "<tr class='row'><td><a class='title'>Item {i}</a><a class='dl' href='/dl/{i}'>d</a></td></tr>"
            ));
        }
        body.push_str("</table>");
        if next {
            body.push_str("<a class='next' href='?page=next'>next</a>");
        }
        body.push_str("</body></html>");
        body
    }

    fn runner(source: &str, site: Arc<FakeSite>, max_pages: usize) -> Runner {
        let config = MemoryConfig::new()
            .with("fake", "username", "me")
            .with("fake", "password", "secret");
        let opts = RunnerOpts::new(Arc::new(config))
            .with_transport(site)
            .with_max_pages(max_pages);
        Runner::new(Arc::new(parse_definition(source).unwrap()), opts).unwrap()
    }

    fn ok(body: String) -> Reply {
        (200, vec![], body)
    }

    #[tokio::test]
    async fn test_search_logs_in_with_config_credentials() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>welcome</html>".to_string()),
            _ => ok(rows(2, false)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        assert_eq!(runner.state(), RunnerState::Uninitialized);

        let feed = runner.search(&Query::keywords_only("foo")).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.items[0].title, "Item 0");
        assert_eq!(feed.items[0].link, "https://fake.test/dl/0");
        assert_eq!(feed.info.key, "fake");
        assert_eq!(runner.state(), RunnerState::LoggedIn);

        let seen = site.seen.lock().unwrap();
        assert_eq!(seen[0].body.as_deref(), Some("username=me&password=secret"));
        assert_eq!(seen[1].url.path(), "/browse.php");
        assert!(seen[1].url.query().unwrap().contains("q=foo"));
    }

    #[tokio::test]
    async fn test_login_error_is_auth_error() {
        let site = FakeSite::new(|_, _| ok("<div class='error'>Wrong password</div>".to_string()));
        let mut runner = runner(SITE, site, 10);
        match runner.search(&Query::keywords_only("foo")).await {
            Err(IndexerError::Auth(message)) => assert_eq!(message, "Wrong password"),
            other => panic!("unexpected {:?}", other.map(|f| f.len())),
        }
        assert_eq!(runner.state(), RunnerState::LoggedOut);
    }

    #[tokio::test]
    async fn test_relogin_exactly_once() {
        let site = FakeSite::new(|req, nth| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ if nth == 0 => ok("<form id='login'></form>".to_string()),
            _ => ok(rows(1, false)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        let feed = runner.search(&Query::keywords_only("foo")).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(site.count("/login.php"), 2);
        assert_eq!(site.count("/browse.php"), 2);
    }

    #[tokio::test]
    async fn test_rejected_relogin_is_not_retried() {
        let site = FakeSite::new(|req, nth| match req.url.path() {
            "/login.php" if nth == 0 => ok("<html>ok</html>".to_string()),
            "/login.php" => ok("<div class='error'>Account disabled</div>".to_string()),
            _ => ok("<form id='login'></form>".to_string()),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        match runner.search(&Query::keywords_only("foo")).await {
            Err(IndexerError::Auth(message)) => assert_eq!(message, "Account disabled"),
            other => panic!("unexpected {:?}", other.map(|f| f.len())),
        }
        assert_eq!(site.count("/login.php"), 2);
        assert_eq!(site.count("/browse.php"), 1);
    }

    #[tokio::test]
    async fn test_second_logout_surfaces_auth_error() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => ok("<form id='login'></form>".to_string()),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        let err = runner.search(&Query::keywords_only("foo")).await.unwrap_err();
        assert!(matches!(err, IndexerError::Auth(_)));
        assert_eq!(site.count("/login.php"), 2);
        assert_eq!(runner.state(), RunnerState::LoggedOut);
    }

    #[tokio::test]
    async fn test_redirect_to_login_counts_as_logged_out() {
        let site = FakeSite::new(|req, nth| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            "/browse.php" if nth == 0 => (302, vec![("Location", "/login.php".to_string())], String::new()),
            _ => ok(rows(1, false)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        assert_eq!(runner.search(&Query::keywords_only("foo")).await.unwrap().len(), 1);
        assert_eq!(site.count("/browse.php"), 2);
    }

    #[tokio::test]
    async fn test_pagination_capped_under_endless_next() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => ok(rows(1, true)),
        });
        let mut runner = runner(SITE, site.clone(), 3);
        let feed = runner.search(&Query::keywords_only("foo")).await.unwrap();
        assert_eq!(feed.len(), 3);
        assert_eq!(site.count("/browse.php"), 3);

        let pages: Vec<String> = site
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/browse.php")
            .map(|r| r.url.query().unwrap_or_default().to_string())
            .collect();
        assert!(pages[2].contains("page=2"));
    }

    #[tokio::test]
    async fn test_pagination_stops_without_next() {
        let site = FakeSite::new(|req, nth| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => ok(rows(2, nth == 0)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        assert_eq!(runner.search(&Query::keywords_only("foo")).await.unwrap().len(), 4);
        assert_eq!(site.count("/browse.php"), 2);
    }

    #[tokio::test]
    async fn test_pagination_stops_on_empty_page() {
        let site = FakeSite::new(|req, nth| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ if nth == 0 => ok(rows(2, true)),
            _ => ok(rows(0, true)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        assert_eq!(runner.search(&Query::keywords_only("foo")).await.unwrap().len(), 2);
        assert_eq!(site.count("/browse.php"), 2);
    }

    #[tokio::test]
    async fn test_limit_and_offset() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => ok(rows(3, true)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        let query = Query::parse([("q", "foo"), ("limit", "2"), ("offset", "2")]).unwrap();
        let feed = runner.search(&query).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.items[0].title, "Item 2");
        assert_eq!(feed.items[1].title, "Item 0");
        assert_eq!(site.count("/browse.php"), 2);
    }

    #[tokio::test]
    async fn test_category_selects_search_path() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => ok(rows(1, false)),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        let query = Query::parse([("t", "tvsearch"), ("q", "foo"), ("cat", "5000")]).unwrap();
        let feed = runner.search(&query).await.unwrap();
        assert_eq!(site.count("/tv.php"), 1);
        assert_eq!(feed.items[0].categories, vec![5000]);

        let query = Query::parse([("q", "foo"), ("cat", "2000")]).unwrap();
        let feed = runner.search(&query).await.unwrap();
        assert_eq!(site.count("/browse.php"), 1);
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn test_ratio() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/user.php" => ok("<span class='ratio'>1,234.50</span>".to_string()),
            _ => ok("<html>ok</html>".to_string()),
        });
        let mut runner = runner(SITE, site, 10);
        assert_eq!(runner.ratio().await.unwrap(), 1234.5);
        assert_eq!(runner.state(), RunnerState::LoggedIn);
    }

    #[tokio::test]
    async fn test_ratio_infinite() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/user.php" => ok("<span class='ratio'>Inf.</span>".to_string()),
            _ => ok("<html>ok</html>".to_string()),
        });
        let mut runner = runner(SITE, site, 10);
        assert_eq!(runner.ratio().await.unwrap(), f64::INFINITY);
    }

    #[tokio::test]
    async fn test_ratio_not_supported() {
        let source = SITE.replace("ratio:\n  path: /user.php\n  selector: span.ratio\n", "");
        let site = FakeSite::new(|_, _| ok(String::new()));
        let mut runner = runner(&source, site.clone(), 10);
        assert!(matches!(runner.ratio().await, Err(IndexerError::NotSupported(_))));
        assert!(site.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_returns_bytes() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/dl/1" => (
                200,
                vec![("Content-Type", "application/x-bittorrent".to_string())],
                "d8:announce".to_string(),
            ),
            _ => ok("<html>ok</html>".to_string()),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        let download = runner.download("https://fake.test/dl/1").await.unwrap();
        assert_eq!(download.body, b"d8:announce".to_vec());
        assert_eq!(download.content_type.as_deref(), Some("application/x-bittorrent"));
        assert_eq!(site.count("/login.php"), 1);
    }

    #[tokio::test]
    async fn test_session_cookie_not_sent_off_site() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => (
                200,
                vec![("Set-Cookie", "sid=s3cret; Path=/".to_string())],
                "<html>ok</html>".to_string(),
            ),
            "/dl/1" => (
                200,
                vec![("Content-Type", "application/x-bittorrent".to_string())],
                "d8:announce".to_string(),
            ),
            _ => ok("<html>ok</html>".to_string()),
        });
        let mut runner = runner(SITE, site.clone(), 10);
        runner.download("https://fake.test/dl/1").await.unwrap();
        runner.download("https://cdn.elsewhere.test/dl/1").await.unwrap();

        let seen = site.seen.lock().unwrap();
        let downloads: Vec<_> = seen.iter().filter(|r| r.url.path() == "/dl/1").collect();
        assert_eq!(downloads.len(), 2);
        assert_eq!(downloads[0].header("Cookie"), Some("sid=s3cret"));
        assert_eq!(downloads[1].header("Cookie"), None);
    }

    #[tokio::test]
    async fn test_download_via_details_selector() {
        let source = format!("{}download:\n  selector: {{ selector: a.file, attribute: href }}\n", SITE);
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/details/1" => ok("<a class='file' href='/files/1.torrent'>get</a>".to_string()),
            "/files/1.torrent" => (
                200,
                vec![("Content-Type", "application/x-bittorrent".to_string())],
                "d4:info".to_string(),
            ),
            _ => ok("<html>ok</html>".to_string()),
        });
        let mut runner = runner(&source, site.clone(), 10);
        let download = runner.download("/details/1").await.unwrap();
        assert_eq!(download.body, b"d4:info".to_vec());
        assert_eq!(site.count("/files/1.torrent"), 1);
    }

    #[tokio::test]
    async fn test_download_magnet_not_supported() {
        let site = FakeSite::new(|_, _| ok("<html>ok</html>".to_string()));
        let mut runner = runner(SITE, site, 10);
        assert!(matches!(
            runner.download("magnet:?xt=urn:btih:abc").await,
            Err(IndexerError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_returns_to_logged_out() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => (500, vec![], "boom".to_string()),
        });
        let mut runner = runner(SITE, site, 10);
        let err = runner.search(&Query::keywords_only("foo")).await.unwrap_err();
        assert!(matches!(err, IndexerError::Status { status: 500, .. }));
        assert_eq!(runner.state(), RunnerState::LoggedOut);
    }

    #[tokio::test]
    async fn test_no_login_definition() {
        let source = r#"
site: open
links: [https://open.test/]
search:
  path: /search
  inputs: { $raw: "{{ range .Categories }}c={{ . }}&{{ end }}", q: "{{ .Keywords }}" }
  rows: { selector: tr.row }
  fields:
    title: { selector: a.title }
    download: { selector: a.dl, attribute: href }
"#;
        let site = FakeSite::new(|_, _| ok(rows(1, false)));
        let mut runner = runner(source, site.clone(), 10);
        let feed = runner.search(&Query::keywords_only("foo")).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(runner.state(), RunnerState::LoggedIn);
        let seen = site.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url.query(), Some("q=foo"));
    }

    #[tokio::test]
    async fn test_url_setting_overrides_link() {
        let site = FakeSite::new(|req, _| match req.url.path() {
            "/login.php" => ok("<html>ok</html>".to_string()),
            _ => ok(rows(1, false)),
        });
        let config = MemoryConfig::new().with("fake", "url", "http://127.0.0.1:9117/");
        let opts = RunnerOpts::new(Arc::new(config)).with_transport(site.clone());
        let mut runner = Runner::new(Arc::new(parse_definition(SITE).unwrap()), opts).unwrap();

        assert_eq!(runner.info().link, "http://127.0.0.1:9117/");
        let feed = runner.search(&Query::keywords_only("foo")).await.unwrap();
        assert_eq!(feed.items[0].link, "http://127.0.0.1:9117/dl/0");
        assert!(site
            .seen
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.url.host_str() == Some("127.0.0.1")));
    }

    #[test]
    fn test_select_path() {
        let paths = vec![
            SearchPath {
                path: "/tv".to_string(),
                method: None,
                categories: vec!["1".to_string()],
            },
            SearchPath {
                path: "/all".to_string(),
                method: None,
                categories: vec![],
            },
        ];
        assert_eq!(select_path(&paths, &["1".to_string()]).unwrap().path, "/tv");
        assert_eq!(select_path(&paths, &["9".to_string()]).unwrap().path, "/all");
        assert_eq!(select_path(&paths, &[]).unwrap().path, "/all");
        assert!(select_path(&[], &[]).is_none());
    }

    #[test]
    fn test_append_raw() {
        let mut get = Request::get(Url::parse("https://a.test/s?q=x").unwrap());
        append_raw(&mut get, "c=1&c=2");
        assert_eq!(get.url.query(), Some("q=x&c=1&c=2"));

        let mut post = Request::post_form(Url::parse("https://a.test/s").unwrap(), &[]);
        append_raw(&mut post, "c=1");
        assert_eq!(post.body.as_deref(), Some("c=1"));
    }

    #[test]
    fn test_take_raw() {
        let mut inputs = vec![
            ("q".to_string(), "x".to_string()),
            ("$raw".to_string(), "&c=1".to_string()),
        ];
        assert_eq!(take_raw(&mut inputs), Some("c=1".to_string()));
        assert_eq!(inputs.len(), 1);
        assert_eq!(take_raw(&mut inputs), None);
    }
}
