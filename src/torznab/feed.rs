//! Result records, feeds and their wire encodings.

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::{IndexerError, Result};

const TORZNAB_NS: &str = "http://torznab.com/schemas/2015/feed";

/// One torrent returned by a site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    /// Key of the site that produced the record.
    pub site: String,
    pub title: String,
    /// Stable identifier, usually the details or download URL.
    pub guid: String,
    /// Download URL.
    pub link: String,
    /// Details page URL.
    pub comments: Option<String>,
    pub publish_date: Option<DateTime<Utc>>,
    /// Size in bytes.
    pub size: Option<u64>,
    pub seeders: Option<u32>,
    /// Seeders plus leechers.
    pub peers: Option<u32>,
    /// Torznab category ids.
    pub categories: Vec<u32>,
    pub grabs: Option<u32>,
    pub files: Option<u32>,
    pub imdb_id: Option<String>,
    pub magnet: Option<String>,
    pub description: Option<String>,
    #[serde(default, with = "float_text")]
    pub download_volume_factor: Option<f64>,
    #[serde(default, with = "float_text")]
    pub upload_volume_factor: Option<f64>,
    /// May be infinite on sites that print `∞`.
    #[serde(default, with = "float_text")]
    pub minimum_ratio: Option<f64>,
    /// Minimum seed time in seconds.
    pub minimum_seed_time: Option<u64>,
}

impl ResultItem {
    /// Creates a record with the required fields.
    pub fn new(site: impl Into<String>, title: impl Into<String>, link: impl Into<String>) -> Self {
        let link = link.into();
        Self {
            site: site.into(),
            title: title.into(),
            guid: link.clone(),
            link,
            ..Default::default()
        }
    }

    /// Number of leechers, derived from peers and seeders.
    pub fn leechers(&self) -> Option<u32> {
        match (self.peers, self.seeders) {
            (Some(peers), Some(seeders)) => Some(peers.saturating_sub(seeders)),
            (Some(peers), None) => Some(peers),
            _ => None,
        }
    }
}

/// Identity of the indexer that produced a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedInfo {
    pub key: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub language: String,
}

/// Ordered search results plus indexer identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub info: FeedInfo,
    pub items: Vec<ResultItem>,
}

impl Feed {
    /// Creates an empty feed for an indexer.
    pub fn new(info: FeedInfo) -> Self {
        Self {
            info,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encodes the feed as JSON.
    pub fn to_json(&self) -> String {
        // plain in-memory data, serialization cannot fail
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Decodes a feed produced by [`Feed::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encodes the feed as a Torznab RSS document.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<rss version=\"2.0\" xmlns:atom=\"http://www.w3.org/2005/Atom\" xmlns:torznab=\"{}\">\n",
            TORZNAB_NS
        ));
        out.push_str("  <channel>\n");
        out.push_str(&format!(
            "    <torznab:indexer id=\"{}\"/>\n",
            escape(self.info.key.as_str())
        ));
        element(&mut out, 4, "title", &self.info.title);
        element(&mut out, 4, "description", &self.info.description);
        element(&mut out, 4, "link", &self.info.link);
        element(&mut out, 4, "language", &self.info.language);

        for item in &self.items {
            write_item(&mut out, item);
        }

        out.push_str("  </channel>\n</rss>\n");
        out
    }

    /// Decodes a feed produced by [`Feed::to_xml`].
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut feed = Feed::default();
        let mut item: Option<ResultItem> = None;
        let mut leaf: Option<String> = None;
        let mut text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = element_name(&e);
                    if name == "item" {
                        item = Some(ResultItem::default());
                    } else if name != "rss" && name != "channel" {
                        leaf = Some(name);
                        text.clear();
                    }
                }
                Ok(Event::Empty(e)) => {
                    let name = element_name(&e);
                    let attrs = attributes(&e)?;
                    match (&mut item, name.as_str()) {
                        (Some(item), "torznab:attr") => apply_attr(item, &attrs)?,
                        (None, "torznab:indexer") => {
                            feed.info.key = attr_value(&attrs, "id").unwrap_or_default()
                        }
                        _ => {}
                    }
                }
                Ok(Event::Text(t)) => {
                    if leaf.is_some() {
                        let value = t.unescape().map_err(xml_error)?;
                        text.push_str(&value);
                    }
                }
                Ok(Event::CData(c)) => {
                    if leaf.is_some() {
                        text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if name == "item" {
                        if let Some(done) = item.take() {
                            feed.items.push(done);
                        }
                    } else if leaf.as_deref() == Some(name.as_str()) {
                        let value = std::mem::take(&mut text);
                        match &mut item {
                            Some(item) => apply_item_element(item, &name, value)?,
                            None => apply_channel_element(&mut feed.info, &name, value),
                        }
                        leaf = None;
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(xml_error(e)),
                _ => {}
            }
        }

        Ok(feed)
    }
}

fn element(out: &mut String, indent: usize, name: &str, value: &str) {
    out.push_str(&format!(
        "{:indent$}<{name}>{}</{name}>\n",
        "",
        escape(value),
        indent = indent,
        name = name
    ));
}

fn torznab_attr(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!(
        "      <torznab:attr name=\"{}\" value=\"{}\"/>\n",
        name,
        escape(value)
    ));
}

fn write_item(out: &mut String, item: &ResultItem) {
    out.push_str("    <item>\n");
    element(out, 6, "title", &item.title);
    element(out, 6, "guid", &item.guid);
    element(out, 6, "link", &item.link);
    if let Some(comments) = &item.comments {
        element(out, 6, "comments", comments);
    }
    if let Some(date) = &item.publish_date {
        element(out, 6, "pubDate", &date.to_rfc2822());
    }
    if let Some(size) = item.size {
        element(out, 6, "size", &size.to_string());
    }
    if let Some(description) = &item.description {
        element(out, 6, "description", description);
    }
    for cat in &item.categories {
        element(out, 6, "category", &cat.to_string());
    }
    out.push_str(&format!(
        "      <enclosure url=\"{}\" length=\"{}\" type=\"application/x-bittorrent\"/>\n",
        escape(item.link.as_str()),
        item.size.unwrap_or(0)
    ));

    torznab_attr(out, "site", &item.site);
    if let Some(v) = item.seeders {
        torznab_attr(out, "seeders", &v.to_string());
    }
    if let Some(v) = item.peers {
        torznab_attr(out, "peers", &v.to_string());
    }
    if let Some(v) = item.grabs {
        torznab_attr(out, "grabs", &v.to_string());
    }
    if let Some(v) = item.files {
        torznab_attr(out, "files", &v.to_string());
    }
    if let Some(v) = &item.imdb_id {
        torznab_attr(out, "imdbid", v);
    }
    if let Some(v) = &item.magnet {
        torznab_attr(out, "magneturl", v);
    }
    if let Some(v) = item.download_volume_factor {
        torznab_attr(out, "downloadvolumefactor", &v.to_string());
    }
    if let Some(v) = item.upload_volume_factor {
        torznab_attr(out, "uploadvolumefactor", &v.to_string());
    }
    if let Some(v) = item.minimum_ratio {
        torznab_attr(out, "minimumratio", &v.to_string());
    }
    if let Some(v) = item.minimum_seed_time {
        torznab_attr(out, "minimumseedtime", &v.to_string());
    }
    out.push_str("    </item>\n");
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_error)?.into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}

fn attr_value(attrs: &[(String, String)], key: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn apply_channel_element(info: &mut FeedInfo, name: &str, value: String) {
    match name {
        "title" => info.title = value,
        "description" => info.description = value,
        "link" => info.link = value,
        "language" => info.language = value,
        _ => {}
    }
}

fn apply_item_element(item: &mut ResultItem, name: &str, value: String) -> Result<()> {
    match name {
        "title" => item.title = value,
        "guid" => item.guid = value,
        "link" => item.link = value,
        "comments" => item.comments = Some(value),
        "description" => item.description = Some(value),
        "pubDate" => {
            let date = DateTime::parse_from_rfc2822(value.trim())
                .map_err(|e| IndexerError::validation("pubDate", e.to_string()))?;
            item.publish_date = Some(date.with_timezone(&Utc));
        }
        "size" => item.size = Some(number("size", &value)?),
        "category" => item.categories.push(number("category", &value)?),
        _ => {}
    }
    Ok(())
}

fn apply_attr(item: &mut ResultItem, attrs: &[(String, String)]) -> Result<()> {
    let (Some(name), Some(value)) = (attr_value(attrs, "name"), attr_value(attrs, "value")) else {
        return Ok(());
    };
    match name.as_str() {
        "site" => item.site = value,
        "seeders" => item.seeders = Some(number(&name, &value)?),
        "peers" => item.peers = Some(number(&name, &value)?),
        "grabs" => item.grabs = Some(number(&name, &value)?),
        "files" => item.files = Some(number(&name, &value)?),
        "imdbid" => item.imdb_id = Some(value),
        "magneturl" => item.magnet = Some(value),
        "downloadvolumefactor" => item.download_volume_factor = Some(number(&name, &value)?),
        "uploadvolumefactor" => item.upload_volume_factor = Some(number(&name, &value)?),
        "minimumratio" => item.minimum_ratio = Some(number(&name, &value)?),
        "minimumseedtime" => item.minimum_seed_time = Some(number(&name, &value)?),
        _ => {}
    }
    Ok(())
}

fn number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| IndexerError::validation(field, format!("'{}' is not a number", value)))
}

/// JSON has no infinity; non-finite values travel as `"inf"`, `"-inf"` or
/// `"NaN"` strings and finite ones as plain numbers.
mod float_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) if v.is_finite() => serializer.serialize_some(v),
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Number(v)) => Ok(Some(v)),
            Some(Repr::Text(text)) => text
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("'{}' is not a number", text))),
        }
    }
}

fn xml_error(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::validation("feed", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_feed() -> Feed {
        let mut feed = Feed::new(FeedInfo {
            key: "demo".to_string(),
            title: "Demo & Friends".to_string(),
            description: "A <demo> tracker".to_string(),
            link: "https://demo.test/".to_string(),
            language: "en-us".to_string(),
        });

        let mut full = ResultItem::new("demo", "Show.S01E01.720p", "https://demo.test/dl/1?key=a&b=c");
        full.guid = "https://demo.test/details/1".to_string();
        full.comments = Some("https://demo.test/details/1".to_string());
        full.publish_date = Some(Utc.with_ymd_and_hms(2024, 3, 9, 18, 4, 5).unwrap());
        full.size = Some(1_073_741_824);
        full.seeders = Some(12);
        full.peers = Some(15);
        full.categories = vec![5000, 5040];
        full.grabs = Some(99);
        full.files = Some(3);
        full.imdb_id = Some("tt0111161".to_string());
        full.magnet = Some("magnet:?xt=urn:btih:abc&dn=x".to_string());
        full.description = Some("  spaced \"quoted\"  ".to_string());
        full.download_volume_factor = Some(0.5);
        full.upload_volume_factor = Some(1.0);
        full.minimum_ratio = Some(0.8);
        full.minimum_seed_time = Some(172_800);
        feed.items.push(full);

        feed.items.push(ResultItem::new("other", "Bare", "https://other.test/2"));
        feed
    }

    #[test]
    fn test_result_item_new_uses_link_as_guid() {
        let item = ResultItem::new("demo", "t", "https://demo.test/dl");
        assert_eq!(item.guid, "https://demo.test/dl");
        assert!(item.publish_date.is_none());
    }

    #[test]
    fn test_leechers() {
        let mut item = ResultItem::new("demo", "t", "l");
        assert!(item.leechers().is_none());
        item.peers = Some(10);
        assert_eq!(item.leechers(), Some(10));
        item.seeders = Some(4);
        assert_eq!(item.leechers(), Some(6));
    }

    #[test]
    fn test_xml_round_trip() {
        let feed = sample_feed();
        let decoded = Feed::from_xml(&feed.to_xml()).unwrap();
        assert_eq!(decoded, feed);
    }

    #[test]
    fn test_json_round_trip() {
        let feed = sample_feed();
        let decoded = Feed::from_json(&feed.to_json()).unwrap();
        assert_eq!(decoded, feed);
    }

    #[test]
    fn test_infinite_ratio_round_trips() {
        let mut item = ResultItem::new("demo", "Unlimited", "https://demo.test/dl/9");
        item.minimum_ratio = Some(f64::INFINITY);
        item.download_volume_factor = Some(f64::NEG_INFINITY);
        item.upload_volume_factor = Some(2.0);
        let mut feed = Feed::default();
        feed.items.push(item);

        let json = feed.to_json();
        assert!(json.contains("\"inf\""));
        let decoded = Feed::from_json(&json).unwrap();
        assert_eq!(decoded, feed);
        assert_eq!(decoded.items[0].minimum_ratio, Some(f64::INFINITY));

        assert_eq!(Feed::from_xml(&feed.to_xml()).unwrap(), feed);
    }

    #[test]
    fn test_json_accepts_missing_factors() {
        let json = r#"{"info":{"key":"d","title":"","description":"","link":"","language":""},
            "items":[{"site":"d","title":"t","guid":"g","link":"l","comments":null,
            "publish_date":null,"size":null,"seeders":null,"peers":null,"categories":[],
            "grabs":null,"files":null,"imdb_id":null,"magnet":null,"description":null,
            "minimum_seed_time":null}]}"#;
        let feed = Feed::from_json(json).unwrap();
        assert_eq!(feed.items[0].minimum_ratio, None);
    }

    #[test]
    fn test_empty_feed_round_trips() {
        let feed = Feed::default();
        assert_eq!(Feed::from_xml(&feed.to_xml()).unwrap(), feed);
        assert_eq!(Feed::from_json(&feed.to_json()).unwrap(), feed);
    }

    #[test]
    fn test_xml_preserves_order() {
        let mut feed = Feed::default();
        for i in 0..5 {
            feed.items
                .push(ResultItem::new("demo", format!("item {i}"), format!("https://d/{i}")));
        }
        let decoded = Feed::from_xml(&feed.to_xml()).unwrap();
        let titles: Vec<_> = decoded.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["item 0", "item 1", "item 2", "item 3", "item 4"]);
    }

    #[test]
    fn test_xml_contains_torznab_attrs() {
        let xml = sample_feed().to_xml();
        assert!(xml.contains("xmlns:torznab=\"http://torznab.com/schemas/2015/feed\""));
        assert!(xml.contains("<torznab:attr name=\"seeders\" value=\"12\"/>"));
        assert!(xml.contains("type=\"application/x-bittorrent\""));
        assert!(xml.contains("Demo &amp; Friends"));
    }

    #[test]
    fn test_from_xml_rejects_bad_number() {
        let xml = "<rss><channel><item><title>x</title><size>big</size></item></channel></rss>";
        assert!(matches!(
            Feed::from_xml(xml),
            Err(IndexerError::Validation { .. })
        ));
    }

    #[test]
    fn test_json_field_names() {
        let json = sample_feed().to_json();
        assert!(json.contains("\"publish_date\""));
        assert!(json.contains("\"site\": \"demo\""));
    }
}
