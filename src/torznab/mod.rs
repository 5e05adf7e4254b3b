//! Torznab protocol layer: query parsing, result feeds and capabilities.

pub mod categories;
mod caps;
mod feed;
mod query;

pub use caps::{Capabilities, CategoryMapping};
pub use categories::Category;
pub use feed::{Feed, FeedInfo, ResultItem};
pub use query::{Query, SearchKind};
