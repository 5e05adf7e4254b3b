//! # tracker-proxy
//!
//! A Torznab proxy for torrent trackers described by declarative
//! definitions.
//!
//! Each site is a YAML definition: how to log in, how to build a search
//! request, how to read result rows and how to follow pagination. A
//! [`Runner`] interprets one definition and exposes it through the
//! [`Indexer`] trait, an [`Aggregate`] fans a query out to several runners,
//! and the [`Tester`] checks definitions against live sites or recorded
//! HTTP archives.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tracker_proxy::{BuiltinLoader, DefinitionLoader, Indexer, MemoryConfig, Query, Runner, RunnerOpts};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MemoryConfig::new()
//!         .with("demo", "username", "me")
//!         .with("demo", "password", "secret");
//!     let definition = Arc::new(BuiltinLoader.load("demo")?);
//!     let mut runner = Runner::new(definition, RunnerOpts::new(Arc::new(config)))?;
//!
//!     let feed = runner.search(&Query::keywords_only("ubuntu")).await?;
//!     for item in &feed.items {
//!         println!("{}: {}", item.title, item.link);
//!     }
//!     Ok(())
//! }
//! ```

mod aggregate;
mod error;
mod indexer;
mod runner;
mod session;
mod tester;

pub mod archive;
pub mod config;
pub mod definition;
pub mod definitions;
pub mod extract;
pub mod filters;
pub mod loader;
pub mod template;
pub mod torznab;
pub mod transport;

pub use aggregate::{Aggregate, MemberFailure, AGGREGATE_KEY};
pub use config::{Config, JsonConfig, MemoryConfig};
pub use definition::{load_definition_file, parse_definition, Definition};
pub use error::{IndexerError, Result};
pub use indexer::{Download, Indexer, IndexerInfo};
pub use loader::{default_loader, list_enabled, BuiltinLoader, DefinitionLoader, DirectoryLoader, LayeredLoader};
pub use runner::{Runner, RunnerOpts, RunnerState};
pub use session::Session;
pub use tester::{CaseResult, TestMode, TestReport, Tester, TesterOpts};
pub use torznab::{Capabilities, Feed, FeedInfo, Query, ResultItem, SearchKind};
