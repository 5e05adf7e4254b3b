//! Definition self-tests, against the live site or a recorded archive.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::archive::Archive;
use crate::definition::{Definition, TestCase};
use crate::indexer::Indexer;
use crate::runner::{Runner, RunnerOpts};
use crate::torznab::{Feed, Query};
use crate::transport::{HttpTransport, RecordingTransport, ReplayTransport, Transport};
use crate::{IndexerError, Result};

/// Where test traffic goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMode {
    Live,
    /// Live, writing every exchange to an archive at the path.
    Save(PathBuf),
    /// Served from the archive at the path; the network is never used.
    Replay(PathBuf),
}

#[derive(Clone)]
pub struct TesterOpts {
    pub mode: TestMode,
    /// Include the download case in the default suite.
    pub download: bool,
    pub runner: RunnerOpts,
}

impl TesterOpts {
    pub fn new(mode: TestMode, runner: RunnerOpts) -> Self {
        Self {
            mode,
            download: false,
            runner,
        }
    }

    pub fn with_download(mut self, download: bool) -> Self {
        self.download = download;
        self
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    pub site: String,
    pub cases: Vec<CaseResult>,
}

impl TestReport {
    /// Whether at least one case ran and every case passed.
    pub fn passed(&self) -> bool {
        !self.cases.is_empty() && self.cases.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed)
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for case in &self.cases {
            let mark = if case.passed { "ok" } else { "FAIL" };
            writeln!(f, "{} {:<4} {}: {}", self.site, mark, case.name, case.message)?;
        }
        let verdict = if self.passed() { "passed" } else { "failed" };
        write!(f, "{}: {}", self.site, verdict)
    }
}

enum CaseFailure {
    Check(String),
    Error(IndexerError),
}

impl From<IndexerError> for CaseFailure {
    fn from(err: IndexerError) -> Self {
        CaseFailure::Error(err)
    }
}

type CaseOutcome = std::result::Result<String, CaseFailure>;

/// Runs a definition's test cases.
pub struct Tester {
    definition: Arc<Definition>,
    opts: TesterOpts,
}

impl Tester {
    pub fn new(definition: Arc<Definition>, opts: TesterOpts) -> Self {
        Self { definition, opts }
    }

    /// The embedded cases, or the default suite when there are none.
    pub fn cases(&self) -> Vec<TestCase> {
        if !self.definition.tests.is_empty() {
            return self.definition.tests.clone();
        }
        let mut cases = vec![
            TestCase::Login,
            TestCase::Search {
                query: None,
                params: None,
                min_results: 1,
            },
        ];
        if self.opts.download {
            cases.push(TestCase::Download);
        }
        cases
    }

    /// Runs every case. A replay mismatch stops the run. In save mode the
    /// archive is written whatever the outcome.
    pub async fn run(&self) -> Result<TestReport> {
        let mut recording: Option<(PathBuf, Arc<RecordingTransport>)> = None;
        let transport: Arc<dyn Transport> = match &self.opts.mode {
            TestMode::Live => self.live_transport()?,
            TestMode::Save(path) => {
                let recorder = Arc::new(RecordingTransport::new(self.live_transport()?));
                recording = Some((path.clone(), Arc::clone(&recorder)));
                recorder
            }
            TestMode::Replay(path) => Arc::new(ReplayTransport::new(Archive::load(path)?)),
        };

        let runner_opts = self.opts.runner.clone().with_transport(transport);
        let mut runner = Runner::new(Arc::clone(&self.definition), runner_opts)?;
        let mut report = TestReport {
            site: self.definition.site.clone(),
            cases: Vec::new(),
        };
        let mut last_feed: Option<Feed> = None;

        for case in self.cases() {
            let name = case_name(&case);
            let outcome = run_case(&mut runner, &case, &mut last_feed).await;
            let (passed, message, fatal) = match outcome {
                Ok(message) => (true, message, false),
                Err(CaseFailure::Check(message)) => (false, message, false),
                Err(CaseFailure::Error(err)) => (false, err.to_string(), err.is_fatal()),
            };
            if passed {
                info!(site = %self.definition.site, case = %name, "Test passed: {}", message);
            } else {
                warn!(site = %self.definition.site, case = %name, "Test failed: {}", message);
            }
            report.cases.push(CaseResult {
                name,
                passed,
                message,
            });
            if fatal {
                break;
            }
        }

        if let Some((path, recorder)) = recording {
            let archive = recorder
                .archive()
                .lock()
                .map_err(|_| IndexerError::Transport("archive lock poisoned".to_string()))?
                .clone();
            archive.save(&path)?;
            info!(site = %self.definition.site, path = %path.display(), entries = archive.len(), "Saved archive");
        }

        Ok(report)
    }

    fn live_transport(&self) -> Result<Arc<dyn Transport>> {
        match &self.opts.runner.transport {
            Some(transport) => Ok(Arc::clone(transport)),
            None => Ok(Arc::new(HttpTransport::new(self.opts.runner.request_timeout)?)),
        }
    }
}

fn case_name(case: &TestCase) -> String {
    match case {
        TestCase::Login => "login".to_string(),
        TestCase::Search { query, .. } => format!("search '{}'", query.as_deref().unwrap_or_default()),
        TestCase::Download => "download".to_string(),
        TestCase::Ratio => "ratio".to_string(),
    }
}

/// Every result needs a title, a link and a publish date.
fn check_feed(feed: &Feed, min_results: usize) -> Option<String> {
    if feed.len() < min_results {
        return Some(format!(
            "expected at least {} results, got {}",
            min_results,
            feed.len()
        ));
    }
    feed.items.iter().enumerate().find_map(|(i, item)| {
        let missing = if item.title.trim().is_empty() {
            "title"
        } else if item.link.trim().is_empty() {
            "link"
        } else if item.publish_date.is_none() {
            "publish date"
        } else {
            return None;
        };
        Some(format!("result {} has no {}", i, missing))
    })
}

async fn run_case(runner: &mut Runner, case: &TestCase, last_feed: &mut Option<Feed>) -> CaseOutcome {
    match case {
        TestCase::Login => {
            runner.ensure_login().await?;
            Ok("logged in".to_string())
        }
        TestCase::Search {
            query,
            params,
            min_results,
        } => {
            let mut pairs: Vec<(String, String)> = params.as_ref().map(|p| p.0.clone()).unwrap_or_default();
            if let Some(term) = query {
                pairs.push(("q".to_string(), term.clone()));
            }
            let query = Query::parse(pairs)?;
            let feed = runner.search(&query).await?;

            let problem = check_feed(&feed, *min_results);
            let count = feed.len();
            *last_feed = Some(feed);
            match problem {
                Some(problem) => Err(CaseFailure::Check(problem)),
                None => Ok(format!("{} results", count)),
            }
        }
        TestCase::Download => {
            let link = last_feed
                .as_ref()
                .and_then(|f| f.items.first())
                .map(|item| item.link.clone())
                .ok_or_else(|| CaseFailure::Check("no search result to download".to_string()))?;
            let download = runner.download(&link).await?;
            if download.is_empty() {
                return Err(CaseFailure::Check(format!("{} returned an empty body", link)));
            }
            Ok(format!("{} bytes", download.len()))
        }
        TestCase::Ratio => {
            let ratio = runner.ratio().await?;
            Ok(format!("ratio {}", ratio))
        }
    }
}
