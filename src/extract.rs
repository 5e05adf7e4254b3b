//! Response documents and extraction rules.
//!
//! HTML is parsed with `scraper`; XML/RSS responses are read with
//! `quick-xml` into a small element tree that answers tag-path selectors
//! such as `channel item` or `torznab:attr[name=seeders]`. Everything here
//! is synchronous: callers fetch first, then hand the body over.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use url::Url;

use crate::definition::{Definition, ErrorBlock, HttpMethod, ResponseKind, SelectorBlock};
use crate::torznab::{categories, Capabilities, ResultItem};
use crate::{filters, template, IndexerError, Result};

/// An element of a parsed XML response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

impl XmlElement {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn text_excluding(&self, remove: &[XmlStep], out: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(t) => {
                    out.push_str(t);
                    out.push(' ');
                }
                XmlNode::Element(e) => {
                    if !remove.iter().any(|step| step.matches(e)) {
                        e.text_excluding(remove, out);
                    }
                }
            }
        }
    }
}

/// Parses an XML document into a tree under a synthetic root.
pub fn parse_xml(body: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut stack = vec![XmlElement::new("#document")];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from(&e)?),
            Ok(Event::Empty(e)) => {
                let element = element_from(&e)?;
                push_child(&mut stack, XmlNode::Element(element));
            }
            Ok(Event::Text(t)) => {
                let decoded = t.unescape().map(|s| s.into_owned()).ok();
                let text = match decoded {
                    Some(s) => s,
                    None => String::from_utf8_lossy(&t.into_inner()).into_owned(),
                };
                push_child(&mut stack, XmlNode::Text(text));
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                push_child(&mut stack, XmlNode::Text(text));
            }
            Ok(Event::End(_)) => {
                if stack.len() > 1 {
                    if let Some(done) = stack.pop() {
                        push_child(&mut stack, XmlNode::Element(done));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IndexerError::validation("xml", e.to_string())),
            _ => {}
        }
    }

    while stack.len() > 1 {
        if let Some(done) = stack.pop() {
            push_child(&mut stack, XmlNode::Element(done));
        }
    }
    stack
        .pop()
        .ok_or_else(|| IndexerError::validation("xml", "empty document"))
}

fn push_child(stack: &mut [XmlElement], node: XmlNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| IndexerError::validation("xml", e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map(|v| v.into_owned()).ok();
        let value = value.unwrap_or_else(|| String::from_utf8_lossy(&attr.value).into_owned());
        element.attrs.push((key, value));
    }
    Ok(element)
}

/// One step of an XML tag path: `name` or `name[attr=value]`.
#[derive(Debug, Clone, PartialEq)]
struct XmlStep {
    name: String,
    attr: Option<(String, String)>,
}

impl XmlStep {
    fn matches(&self, element: &XmlElement) -> bool {
        let name_matches = element.name == self.name
            || (!self.name.contains(':')
                && element.name.rsplit(':').next() == Some(self.name.as_str()));
        name_matches
            && match &self.attr {
                Some((k, v)) => element.attr(k) == Some(v.as_str()),
                None => true,
            }
    }
}

static XML_STEP_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"^([\w:.-]+)(?:\[([\w:.-]+)=["']?([^"'\]]*)["']?\])?$"#));

static SIZE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*([\d.,]+)\s*([kmgtp]?)(i?)(b|bytes?)?\s*$").ok());

static NUMBER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"-?[\d.,]*\d").ok());

fn parse_xml_path(selector: &str) -> Result<Vec<XmlStep>> {
    let step_re = XML_STEP_RE
        .as_ref()
        .map_err(|e| IndexerError::validation("selector", e.to_string()))?;
    selector
        .split_whitespace()
        .map(|part| {
            let caps = step_re.captures(part).ok_or_else(|| {
                IndexerError::validation("selector", format!("bad tag path '{}'", selector))
            })?;
            Ok(XmlStep {
                name: caps[1].to_string(),
                attr: caps
                    .get(2)
                    .zip(caps.get(3))
                    .map(|(k, v)| (k.as_str().to_string(), v.as_str().to_string())),
            })
        })
        .collect()
}

fn select_xml<'a>(element: &'a XmlElement, steps: &[XmlStep], out: &mut Vec<&'a XmlElement>) {
    let Some(first) = steps.first() else {
        return;
    };
    for child in element.elements() {
        if first.matches(child) {
            if steps.len() == 1 {
                if !out.iter().any(|e| std::ptr::eq(*e, child)) {
                    out.push(child);
                }
            } else {
                select_xml(child, &steps[1..], out);
            }
        }
        select_xml(child, steps, out);
    }
}

/// A parsed response.
pub enum Document {
    Html(Html),
    Xml(XmlElement),
}

impl Document {
    pub fn parse(body: &str, kind: ResponseKind) -> Result<Self> {
        match kind {
            ResponseKind::Html => Ok(Self::Html(Html::parse_document(body))),
            ResponseKind::Xml => Ok(Self::Xml(parse_xml(body)?)),
        }
    }

    pub fn root(&self) -> Node<'_> {
        match self {
            Self::Html(html) => Node::Html(html.root_element()),
            Self::Xml(root) => Node::Xml(root),
        }
    }
}

/// A position in a document that selectors are evaluated against.
#[derive(Clone, Copy)]
pub enum Node<'a> {
    Html(ElementRef<'a>),
    Xml(&'a XmlElement),
}

impl<'a> Node<'a> {
    /// All matches below this node.
    pub fn select(&self, selector: &str) -> Result<Vec<Node<'a>>> {
        match self {
            Node::Html(element) => {
                let selector = css(selector)?;
                Ok(element.select(&selector).map(Node::Html).collect())
            }
            Node::Xml(element) => {
                let steps = parse_xml_path(selector)?;
                let mut out = Vec::new();
                select_xml(element, &steps, &mut out);
                Ok(out.into_iter().map(Node::Xml).collect())
            }
        }
    }

    /// Whether this node itself matches the selector.
    pub fn matches(&self, selector: &str) -> Result<bool> {
        match self {
            Node::Html(element) => Ok(css(selector)?.matches(element)),
            Node::Xml(element) => {
                let steps = parse_xml_path(selector)?;
                Ok(steps.len() == 1 && steps[0].matches(element))
            }
        }
    }

    pub fn select_first(&self, selector: &str) -> Result<Option<Node<'a>>> {
        Ok(self.select(selector)?.into_iter().next())
    }

    /// Whitespace-collapsed text, skipping descendants matching `remove`.
    pub fn text(&self, remove: Option<&str>) -> Result<String> {
        let raw = match self {
            Node::Html(element) => match remove {
                None => element.text().collect::<Vec<_>>().join(" "),
                Some(remove) => {
                    let selector = css(remove)?;
                    let removed: Vec<_> = element.select(&selector).map(|e| e.id()).collect();
                    let mut out = String::new();
                    for node in element.descendants() {
                        if let Some(text) = node.value().as_text() {
                            if !node.ancestors().any(|a| removed.contains(&a.id())) {
                                out.push_str(text);
                                out.push(' ');
                            }
                        }
                    }
                    out
                }
            },
            Node::Xml(element) => {
                let remove = match remove {
                    Some(r) => parse_xml_path(r)?,
                    None => Vec::new(),
                };
                let mut out = String::new();
                element.text_excluding(&remove, &mut out);
                out
            }
        };
        Ok(collapse_whitespace(&raw))
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        match self {
            Node::Html(element) => element.value().attr(name).map(|v| v.trim().to_string()),
            Node::Xml(element) => element.attr(name).map(|v| v.trim().to_string()),
        }
    }
}

fn css(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        IndexerError::validation("selector", format!("bad selector '{}': {:?}", selector, e))
    })
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Evaluates a selector block against a node. `None` means nothing was
/// found and there is no default.
pub fn extract_value(node: Node<'_>, block: &SelectorBlock, context: &Value) -> Result<Option<String>> {
    let raw = if let Some(text) = &block.text {
        Some(template::render(text, context)?)
    } else if let Some(case) = &block.case {
        let target = match block.selector.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(selector) => node.select_first(selector)?,
            None => Some(node),
        };
        let mut found = None;
        if let Some(target) = target {
            for (selector, value) in case.iter() {
                let hit = selector == "*"
                    || target.matches(selector)?
                    || target.select_first(selector)?.is_some();
                if hit {
                    found = Some(template::render(value, context)?);
                    break;
                }
            }
        }
        found
    } else {
        let target = match block.selector.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(selector) => node.select_first(selector)?,
            None => Some(node),
        };
        match target {
            Some(target) => match &block.attribute {
                Some(attr) => target.attr(attr),
                None => Some(target.text(block.remove.as_deref())?),
            },
            None => None,
        }
    };

    let value = match raw {
        Some(v) => Some(v),
        None => block.default.as_ref().map(|d| template::render(d, context)).transpose()?,
    };

    value.map(|v| filters::apply(&block.filters, &v)).transpose()
}

/// Extracted rows of one search page.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    /// Field values per row, in declaration order.
    pub rows: Vec<Vec<(String, String)>>,
    /// Whether the next-page rule matched; `None` without a rule.
    pub has_next: Option<bool>,
    /// Total result count reported by the site.
    pub total: Option<usize>,
}

/// Extracts rows and fields from a search response.
pub fn extract_search_page(definition: &Definition, body: &str, context: &Value) -> Result<SearchPage> {
    let site = definition.site.as_str();
    let search = &definition.search;

    let document = Document::parse(body, search.response)
        .map_err(|e| IndexerError::extraction(site, "response", e.to_string()))?;
    let root = document.root();

    let rows = root
        .select(&search.rows.selector)
        .map_err(|e| IndexerError::extraction(site, "rows", e.to_string()))?;

    let mut page = SearchPage::default();
    for row in rows.into_iter().skip(search.rows.skip) {
        let mut row_context = context.clone();
        let mut result = Map::new();
        let mut values = Vec::new();

        for (name, block) in search.fields.iter() {
            let rule = format!("fields.{}", name);
            if let Some(object) = row_context.as_object_mut() {
                object.insert("Result".to_string(), Value::Object(result.clone()));
            }
            let value = extract_value(row, block, &row_context)
                .map_err(|e| IndexerError::extraction(site, &rule, e.to_string()))?;
            match value {
                Some(value) => {
                    result.insert(name.clone(), Value::String(value.clone()));
                    values.push((name.clone(), value));
                }
                None if block.optional => {}
                None => {
                    return Err(IndexerError::extraction(site, &rule, "no match on row"));
                }
            }
        }
        page.rows.push(values);
    }

    if let Some(pagination) = &search.pagination {
        if let Some(next) = &pagination.next {
            let found = extract_value(root, next, context)
                .map_err(|e| IndexerError::extraction(site, "pagination.next", e.to_string()))?;
            page.has_next = Some(found.is_some());
        }
        if let Some(total) = &pagination.total {
            page.total = extract_value(root, total, context)
                .map_err(|e| IndexerError::extraction(site, "pagination.total", e.to_string()))?
                .and_then(|v| parse_count(&v))
                .map(|n| n as usize);
        }
    }

    Ok(page)
}

/// Builds a result item from extracted field values.
pub fn build_item(
    definition: &Definition,
    fields: &[(String, String)],
    base: &Url,
    now: DateTime<Utc>,
) -> Result<ResultItem> {
    let site = definition.site.as_str();
    let caps = definition.capabilities();
    let get = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    };
    let url_field = |name: &str| -> Result<Option<String>> {
        get(name)
            .map(|v| {
                resolve_url(base, v)
                    .map_err(|e| IndexerError::extraction(site, format!("fields.{}", name), e.to_string()))
            })
            .transpose()
    };

    let title = get("title").unwrap_or_default().to_string();
    let magnet = get("magnet").map(str::to_string);
    let link = match url_field("download")? {
        Some(link) => link,
        None => magnet.clone().ok_or_else(|| {
            IndexerError::extraction(site, "fields.download", "row has no download or magnet link")
        })?,
    };

    let mut item = ResultItem::new(site, title, link);
    item.magnet = magnet;
    item.comments = url_field("details")?.or(url_field("comments")?);
    item.guid = get("guid")
        .map(str::to_string)
        .or_else(|| item.comments.clone())
        .unwrap_or_else(|| item.link.clone());
    item.publish_date = get("date")
        .or_else(|| get("publish_date"))
        .and_then(|v| filters::parse_date(v, now));
    item.size = get("size").and_then(parse_size);
    let count = |name: &str| get(name).and_then(parse_count).map(saturate_u32);
    item.seeders = count("seeders");
    let leechers = count("leechers");
    item.peers = count("peers").or_else(|| match (item.seeders, leechers) {
        (Some(s), Some(l)) => Some(s.saturating_add(l)),
        (None, Some(l)) => Some(l),
        _ => None,
    });
    item.grabs = count("grabs");
    item.files = count("files");
    item.imdb_id = get("imdb").and_then(normalize_imdb);
    item.description = get("description").map(str::to_string);
    item.download_volume_factor = get("downloadvolumefactor").and_then(parse_number);
    item.upload_volume_factor = get("uploadvolumefactor").and_then(parse_number);
    item.minimum_ratio = get("minimumratio").and_then(parse_number);
    item.minimum_seed_time = get("minimumseedtime").and_then(parse_count);
    if let Some(category) = get("category") {
        item.categories = map_category(caps, category);
    }

    Ok(item)
}

fn saturate_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Site category id to Torznab ids; a bare Torznab id passes through.
fn map_category(caps: &Capabilities, site_id: &str) -> Vec<u32> {
    let site_id = site_id.trim();
    let mapped = caps.torznab_categories(site_id);
    if !mapped.is_empty() {
        return mapped;
    }
    site_id
        .parse::<u32>()
        .ok()
        .and_then(categories::by_id)
        .map(|c| vec![c.id])
        .unwrap_or_default()
}

/// Resolves a possibly relative link against the page URL.
pub fn resolve_url(base: &Url, value: &str) -> Result<String> {
    let value = value.trim();
    if value.starts_with("magnet:") {
        return Ok(value.to_string());
    }
    Ok(base.join(value)?.to_string())
}

fn normalize_imdb(value: &str) -> Option<String> {
    let digits: String = value
        .trim()
        .trim_start_matches("tt")
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("tt{:0>7}", digits))
    }
}

/// Reads `1,234.5`, `1.234,5`, `1,5` and `1,024` as plain decimals.
///
/// With both separators present the last one is the decimal point. A lone
/// kind of separator is a thousands separator when every group after it
/// has three digits, and a decimal point otherwise.
fn normalize_decimal(number: &str) -> Option<String> {
    let last_comma = number.rfind(',');
    let last_dot = number.rfind('.');
    let (decimal, thousands) = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => (',', '.'),
        (Some(_), Some(_)) => ('.', ','),
        (Some(_), None) => {
            if is_grouped(number, ',') {
                return Some(number.replace(',', ""));
            }
            (',', '.')
        }
        (None, Some(_)) => {
            if number.matches('.').count() > 1 && is_grouped(number, '.') {
                return Some(number.replace('.', ""));
            }
            ('.', ',')
        }
        (None, None) => return Some(number.to_string()),
    };
    let cleaned = number.replace(thousands, "");
    if cleaned.matches(decimal).count() > 1 {
        return None;
    }
    Some(cleaned.replace(decimal, "."))
}

fn is_grouped(number: &str, separator: char) -> bool {
    let mut groups = number.split(separator);
    let head = groups.next().unwrap_or_default();
    let head = head.trim_start_matches('-');
    !head.is_empty()
        && head.len() <= 3
        && !head.starts_with('0')
        && groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

/// Parses a size like `1.5 GB`, `1,5 GB`, `700 MiB`, `1,024 KB` or raw
/// bytes. Both decimal and binary unit spellings count in powers of 1024.
pub fn parse_size(value: &str) -> Option<u64> {
    let caps = SIZE_RE.as_ref()?.captures(value.trim())?;
    let amount: f64 = normalize_decimal(&caps[1])?.parse().ok()?;
    let multiplier = match caps[2].to_ascii_lowercase().as_str() {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024f64.powi(2),
        "g" => 1024f64.powi(3),
        "t" => 1024f64.powi(4),
        "p" => 1024f64.powi(5),
        _ => return None,
    };
    Some((amount * multiplier).round() as u64)
}

/// Parses a count like `1,234`; non-digits are dropped.
pub fn parse_count(value: &str) -> Option<u64> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.' || c.is_whitespace())
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parses a decimal number, tolerating `,` separators and infinity marks.
pub fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim();
    let lower = value.to_lowercase();
    if value.contains('∞') || lower.starts_with("inf") {
        return Some(f64::INFINITY);
    }
    let m = NUMBER_RE.as_ref()?.find(value)?;
    normalize_decimal(m.as_str())?.parse().ok()
}

/// Whether an HTML page matches a selector.
pub fn html_matches(body: &str, selector: &str) -> Result<bool> {
    let document = Html::parse_document(body);
    Ok(document.select(&css(selector)?).next().is_some())
}

/// Evaluates one selector block against a whole page.
pub fn extract_page_value(
    body: &str,
    kind: ResponseKind,
    block: &SelectorBlock,
    context: &Value,
) -> Result<Option<String>> {
    let document = Document::parse(body, kind)?;
    extract_value(document.root(), block, context)
}

/// Returns the message of the first declared login error present on a page.
pub fn login_error(body: &str, errors: &[ErrorBlock], context: &Value) -> Result<Option<String>> {
    let document = Html::parse_document(body);
    for error in errors {
        let selector = css(&error.selector)?;
        if let Some(element) = document.select(&selector).next() {
            let message = match &error.message {
                Some(block) => extract_value(Node::Html(document.root_element()), block, context)?,
                None => Some(Node::Html(element).text(None)?),
            };
            let message = message.filter(|m| !m.is_empty());
            return Ok(Some(message.unwrap_or_else(|| "login error".to_string())));
        }
    }
    Ok(None)
}

/// A form scraped from a login page.
#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub action: Url,
    pub method: HttpMethod,
    pub fields: Vec<(String, String)>,
}

impl Form {
    /// Sets a field, replacing an existing value.
    pub fn set(&mut self, name: &str, value: String) {
        match self.fields.iter_mut().find(|(k, _)| k == name) {
            Some(field) => field.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }
}

/// Finds a form and collects its default field values.
pub fn find_form(body: &str, selector: &str, page_url: &Url) -> Result<Form> {
    let document = Html::parse_document(body);
    let form = document
        .select(&css(selector)?)
        .next()
        .ok_or_else(|| IndexerError::Auth(format!("login form '{}' not found", selector)))?;

    let action = match form.value().attr("action").map(str::trim) {
        Some(action) if !action.is_empty() => page_url.join(action)?,
        _ => page_url.clone(),
    };
    let method = match form.value().attr("method") {
        Some(m) if m.eq_ignore_ascii_case("post") => HttpMethod::Post,
        _ => HttpMethod::Get,
    };

    let controls = css("input[name], select[name], textarea[name]")?;
    let options = css("option")?;
    let mut fields = Vec::new();
    for control in form.select(&controls) {
        let element = control.value();
        let name = element.attr("name").unwrap_or_default().to_string();
        let value = match element.name() {
            "select" => {
                let mut chosen = None;
                for option in control.select(&options) {
                    if chosen.is_none() || option.value().attr("selected").is_some() {
                        let value = option
                            .value()
                            .attr("value")
                            .map(str::to_string)
                            .unwrap_or_else(|| collapse_whitespace(&option.text().collect::<String>()));
                        let selected = option.value().attr("selected").is_some();
                        chosen = Some(value);
                        if selected {
                            break;
                        }
                    }
                }
                chosen.unwrap_or_default()
            }
            "textarea" => control.text().collect(),
            _ => {
                let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "submit" | "button" | "image" | "reset" | "file" => continue,
                    "checkbox" | "radio" if element.attr("checked").is_none() => continue,
                    "checkbox" | "radio" => element.attr("value").unwrap_or("on").to_string(),
                    _ => element.attr("value").unwrap_or_default().to_string(),
                }
            }
        };
        fields.push((name, value));
    }

    Ok(Form {
        action,
        method,
        fields,
    })
}
