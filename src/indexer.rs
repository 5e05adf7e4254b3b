//! The indexer capability shared by runners and the aggregate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::torznab::{Capabilities, Feed, FeedInfo, Query};
use crate::Result;

/// Identity of an indexer as shown in feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerInfo {
    pub key: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub language: String,
}

impl From<IndexerInfo> for FeedInfo {
    fn from(info: IndexerInfo) -> Self {
        FeedInfo {
            key: info.key,
            title: info.title,
            description: info.description,
            link: info.link,
            language: info.language,
        }
    }
}

/// A downloaded file. The caller owns the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Download {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Download {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Search, download and ratio over one tracker or a group of trackers.
///
/// Operations take `&mut self`: an indexer owns its session and is used
/// by one caller at a time.
#[async_trait]
pub trait Indexer: Send {
    fn info(&self) -> IndexerInfo;

    fn capabilities(&self) -> Capabilities;

    /// Runs a query and returns the matching results.
    async fn search(&mut self, query: &Query) -> Result<Feed>;

    /// Fetches the file behind a result link.
    async fn download(&mut self, url: &str) -> Result<Download>;

    /// Reads the account's share ratio.
    async fn ratio(&mut self) -> Result<f64>;

    /// Returns the indexer key.
    fn key(&self) -> String {
        self.info().key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_into_feed_info() {
        let info = IndexerInfo {
            key: "demo".to_string(),
            title: "Demo".to_string(),
            link: "https://demo.test/".to_string(),
            ..Default::default()
        };
        let feed_info: FeedInfo = info.into();
        assert_eq!(feed_info.key, "demo");
        assert_eq!(feed_info.title, "Demo");
    }

    struct Fixed;

    #[async_trait]
    impl Indexer for Fixed {
        fn info(&self) -> IndexerInfo {
            IndexerInfo {
                key: "fixed".to_string(),
                ..Default::default()
            }
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn search(&mut self, _query: &Query) -> Result<Feed> {
            Ok(Feed::new(self.info().into()))
        }

        async fn download(&mut self, url: &str) -> Result<Download> {
            Err(crate::IndexerError::NotSupported(url.to_string()))
        }

        async fn ratio(&mut self) -> Result<f64> {
            Ok(1.5)
        }
    }

    #[test]
    fn test_boxed_indexer() {
        let mut indexer: Box<dyn Indexer> = Box::new(Fixed);
        assert_eq!(indexer.key(), "fixed");

        let feed = tokio_test::block_on(indexer.search(&Query::keywords_only("x"))).unwrap();
        assert_eq!(feed.info.key, "fixed");
        assert!(feed.is_empty());
        assert_eq!(tokio_test::block_on(indexer.ratio()).unwrap(), 1.5);
        assert!(tokio_test::block_on(indexer.download("https://x.test/1")).is_err());
    }

    #[test]
    fn test_download_len() {
        let download = Download {
            content_type: Some("application/x-bittorrent".to_string()),
            body: b"d8:announce".to_vec(),
        };
        assert_eq!(download.len(), 11);
        assert!(!download.is_empty());
        assert!(Download::default().is_empty());
    }
}
