//! Composite indexer over several members.

use std::cmp::Ordering;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use url::Url;

use crate::indexer::{Download, Indexer, IndexerInfo};
use crate::torznab::{Capabilities, Feed, Query, ResultItem};
use crate::{IndexerError, Result};

/// Key the aggregate answers to.
pub const AGGREGATE_KEY: &str = "aggregate";

/// A member that failed or timed out during the last fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub key: String,
    pub message: String,
}

/// Fans queries out to its members and merges their feeds.
pub struct Aggregate {
    members: Vec<Box<dyn Indexer>>,
    member_timeout: Duration,
    failures: Vec<MemberFailure>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            member_timeout: Duration::from_secs(60),
            failures: Vec::new(),
        }
    }

    /// Sets the time each member gets per operation.
    pub fn with_timeout(mut self, member_timeout: Duration) -> Self {
        self.member_timeout = member_timeout;
        self
    }

    pub fn add<I: Indexer + 'static>(&mut self, indexer: I) {
        self.members.push(Box::new(indexer));
    }

    pub fn add_boxed(&mut self, indexer: Box<dyn Indexer>) {
        self.members.push(indexer);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.members.iter().map(|m| m.key()).collect()
    }

    /// Members that failed during the most recent search.
    pub fn failures(&self) -> &[MemberFailure] {
        &self.failures
    }

    fn member_mut(&mut self, key: &str) -> Result<&mut Box<dyn Indexer>> {
        self.members
            .iter_mut()
            .find(|m| m.key() == key)
            .ok_or_else(|| IndexerError::NotFound(key.to_string()))
    }

    /// Downloads through the member with the given key.
    pub async fn download_from(&mut self, key: &str, url: &str) -> Result<Download> {
        self.member_mut(key)?.download(url).await
    }

    /// Reads the ratio of the member with the given key.
    pub async fn ratio_of(&mut self, key: &str) -> Result<f64> {
        self.member_mut(key)?.ratio().await
    }

    /// Reads every member's ratio concurrently.
    pub async fn ratios(&mut self) -> Vec<(String, Result<f64>)> {
        let member_timeout = self.member_timeout;
        let futures = self.members.iter_mut().map(|member| async move {
            let key = member.key();
            let result = match timeout(member_timeout, member.ratio()).await {
                Ok(result) => result,
                Err(_) => Err(IndexerError::Timeout),
            };
            (key, result)
        });
        join_all(futures).await
    }
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::new()
    }
}

/// Orders items newest first with undated items last, then by site key.
/// The sort is stable so each member's own order survives ties.
fn merge(feeds: Vec<Feed>) -> Vec<ResultItem> {
    let mut items: Vec<ResultItem> = feeds.into_iter().flat_map(|f| f.items).collect();
    items.sort_by(|a, b| {
        let by_date = match (a.publish_date, b.publish_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_date.then_with(|| a.site.cmp(&b.site))
    });
    items
}

fn origin(url: &Url) -> Option<(String, Option<u16>)> {
    url.host_str()
        .map(|host| (host.to_ascii_lowercase(), url.port_or_known_default()))
}

#[async_trait]
impl Indexer for Aggregate {
    fn info(&self) -> IndexerInfo {
        IndexerInfo {
            key: AGGREGATE_KEY.to_string(),
            title: "Aggregate".to_string(),
            description: "All enabled indexers".to_string(),
            link: String::new(),
            language: "en-us".to_string(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        for member in &self.members {
            caps.merge(&member.capabilities());
        }
        caps
    }

    async fn search(&mut self, query: &Query) -> Result<Feed> {
        let start = Instant::now();
        let member_timeout = self.member_timeout;
        debug!("Searching {} indexers", self.members.len());

        let futures = self.members.iter_mut().map(|member| async move {
            let key = member.key();
            match timeout(member_timeout, member.search(query)).await {
                Ok(Ok(feed)) => {
                    debug!("Indexer {} returned {} results", key, feed.len());
                    Ok(feed)
                }
                Ok(Err(e)) => {
                    warn!("Indexer {} failed: {}", key, e);
                    Err(MemberFailure {
                        key,
                        message: e.to_string(),
                    })
                }
                Err(_) => {
                    warn!("Indexer {} timed out", key);
                    Err(MemberFailure {
                        key,
                        message: IndexerError::Timeout.to_string(),
                    })
                }
            }
        });
        let outcomes = join_all(futures).await;

        let mut feeds = Vec::new();
        self.failures.clear();
        for outcome in outcomes {
            match outcome {
                Ok(feed) => feeds.push(feed),
                Err(failure) => self.failures.push(failure),
            }
        }

        let mut feed = Feed::new(self.info().into());
        feed.items = merge(feeds);
        debug!(
            results = feed.len(),
            failed = self.failures.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Aggregate search finished"
        );
        Ok(feed)
    }

    /// Downloads through the member whose link shares the URL's host and port.
    async fn download(&mut self, url: &str) -> Result<Download> {
        let target = origin(&Url::parse(url)?)
            .ok_or_else(|| IndexerError::validation("url", format!("'{}' has no host", url)))?;
        let member = self
            .members
            .iter_mut()
            .find(|m| {
                Url::parse(&m.info().link)
                    .ok()
                    .and_then(|link| origin(&link))
                    .is_some_and(|o| o == target)
            })
            .ok_or_else(|| IndexerError::NotFound(format!("no indexer serves {}", target.0)))?;
        member.download(url).await
    }

    async fn ratio(&mut self) -> Result<f64> {
        Err(IndexerError::NotSupported(
            "the aggregate has no ratio; ask a member".to_string(),
        ))
    }
}
