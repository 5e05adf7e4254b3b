//! Value filters applied to extracted text.
//!
//! Each selector block may list filters that run in order over the raw
//! value, e.g.
//!
//! ```yaml
//! date:
//!   selector: td.added
//!   filters:
//!     - name: dateparse
//!       args: "2006-01-02 15:04"
//! ```
//!
//! Date filters emit RFC 3339 so later normalization sees one format.

use chrono::{
    DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Timelike,
    Utc,
};
use regex::Regex;
use std::sync::LazyLock;
use serde_yaml::Value;

use crate::definition::FilterSpec;
use crate::{IndexerError, Result};

const KNOWN: &[&str] = &[
    "querystring",
    "dateparse",
    "timeago",
    "reltime",
    "fuzzytime",
    "regexp",
    "split",
    "replace",
    "re_replace",
    "trim",
    "append",
    "prepend",
    "tolower",
    "toupper",
    "urldecode",
    "urlencode",
];

/// Whether a filter name is supported.
pub fn is_known(name: &str) -> bool {
    KNOWN.contains(&name)
}

/// Runs a filter chain over a value.
pub fn apply(filters: &[FilterSpec], value: &str) -> Result<String> {
    apply_at(filters, value, Utc::now())
}

/// Runs a filter chain with an explicit clock for relative dates.
pub fn apply_at(filters: &[FilterSpec], value: &str, now: DateTime<Utc>) -> Result<String> {
    let mut current = value.to_string();
    for filter in filters {
        current = apply_one(filter, &current, now)?;
    }
    Ok(current)
}

fn apply_one(filter: &FilterSpec, value: &str, now: DateTime<Utc>) -> Result<String> {
    let args = filter.args.as_ref();
    let name = filter.name.as_str();

    match name {
        "querystring" => {
            let param = arg(args, 0).ok_or_else(|| missing_arg(name))?;
            let query = value.split_once('?').map(|(_, q)| q).unwrap_or(value);
            let query = query.split('#').next().unwrap_or_default();
            Ok(url::form_urlencoded::parse(query.as_bytes())
                .find(|(k, _)| *k == param)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default())
        }
        "dateparse" => {
            let layout = arg(args, 0).ok_or_else(|| missing_arg(name))?;
            let parsed = parse_layout(value.trim(), &layout).ok_or_else(|| {
                filter_error(name, format!("'{}' does not match layout '{}'", value, layout))
            })?;
            Ok(rfc3339(parsed))
        }
        "timeago" | "reltime" => {
            let parsed = parse_relative(value, now)
                .ok_or_else(|| filter_error(name, format!("'{}' is not a relative time", value)))?;
            Ok(rfc3339(parsed))
        }
        "fuzzytime" => {
            let parsed = parse_date(value, now)
                .ok_or_else(|| filter_error(name, format!("cannot read date '{}'", value)))?;
            Ok(rfc3339(parsed))
        }
        "regexp" => {
            let pattern = arg(args, 0).ok_or_else(|| missing_arg(name))?;
            let re = compile(name, &pattern)?;
            Ok(re
                .captures(value)
                .map(|caps| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
                .unwrap_or_default())
        }
        "split" => {
            let sep = arg(args, 0).ok_or_else(|| missing_arg(name))?;
            let index: i64 = arg(args, 1)
                .unwrap_or_else(|| "0".to_string())
                .parse()
                .map_err(|_| filter_error(name, "index must be an integer"))?;
            let parts: Vec<&str> = value.split(sep.as_str()).collect();
            let idx = if index < 0 {
                parts.len() as i64 + index
            } else {
                index
            };
            usize::try_from(idx)
                .ok()
                .and_then(|i| parts.get(i))
                .map(|s| s.to_string())
                .ok_or_else(|| filter_error(name, format!("no part {} in '{}'", index, value)))
        }
        "replace" => {
            let from = arg(args, 0).ok_or_else(|| missing_arg(name))?;
            let to = arg(args, 1).unwrap_or_default();
            Ok(value.replace(&from, &to))
        }
        "re_replace" => {
            let pattern = arg(args, 0).ok_or_else(|| missing_arg(name))?;
            let to = arg(args, 1).unwrap_or_default();
            Ok(compile(name, &pattern)?
                .replace_all(value, to.as_str())
                .into_owned())
        }
        "trim" => match arg(args, 0) {
            Some(chars) => Ok(value
                .trim_matches(|c| chars.contains(c))
                .to_string()),
            None => Ok(value.trim().to_string()),
        },
        "append" => Ok(format!("{}{}", value, arg(args, 0).unwrap_or_default())),
        "prepend" => Ok(format!("{}{}", arg(args, 0).unwrap_or_default(), value)),
        "tolower" => Ok(value.to_lowercase()),
        "toupper" => Ok(value.to_uppercase()),
        "urldecode" => urlencoding::decode(&value.replace('+', " "))
            .map(|s| s.into_owned())
            .map_err(|e| filter_error(name, e.to_string())),
        "urlencode" => Ok(urlencoding::encode(value).into_owned()),
        other => Err(filter_error(other, "unknown filter")),
    }
}

/// Reads the n-th argument; a scalar argument counts as a one-element list.
fn arg(args: Option<&Value>, index: usize) -> Option<String> {
    match args? {
        Value::Sequence(items) => items.get(index).and_then(scalar),
        other if index == 0 => scalar(other),
        _ => None,
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| filter_error(name, format!("bad pattern: {}", e)))
}

fn missing_arg(name: &str) -> IndexerError {
    filter_error(name, "missing argument")
}

fn filter_error(name: &str, message: impl Into<String>) -> IndexerError {
    IndexerError::validation(format!("filters.{}", name), message)
}

fn rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Translates a Go reference-time layout (`2006-01-02 15:04:05`) into a
/// chrono format string.
pub fn go_layout(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("January", "%B"),
        ("Monday", "%A"),
        ("Z07:00", "%:z"),
        ("-07:00", "%:z"),
        ("-0700", "%z"),
        ("2006", "%Y"),
        ("Jan", "%b"),
        ("Mon", "%a"),
        ("MST", "%Z"),
        ("_2", "%e"),
        ("01", "%m"),
        ("02", "%d"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("06", "%y"),
        ("15", "%H"),
        ("PM", "%p"),
        ("pm", "%P"),
        ("1", "%m"),
        ("2", "%d"),
        ("3", "%I"),
        ("4", "%M"),
        ("5", "%S"),
    ];

    let mut out = String::new();
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (go, chrono) in TOKENS {
            if let Some(tail) = rest.strip_prefix(go) {
                out.push_str(chrono);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}

/// Parses a value with a Go layout; naive results are taken as UTC.
pub fn parse_layout(value: &str, layout: &str) -> Option<DateTime<Utc>> {
    parse_with_format(value, &go_layout(layout))
}

fn parse_with_format(value: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(value, format) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, format) {
        return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }
    None
}

const COMMON_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d/%m/%Y",
    "%d-%m-%Y %H:%M",
    "%d-%m-%Y",
    "%d.%m.%Y %H:%M",
    "%d.%m.%Y",
    "%d %b %Y %H:%M",
    "%d %b %Y",
    "%b %d %Y %H:%M",
    "%b %d %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

/// Best-effort date reader used for every `date` field: RFC 3339,
/// RFC 2822, unix seconds, common layouts, "today"/"yesterday" with an
/// optional time, and relative "3 hours ago" forms. Second precision.
pub fn parse_date(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let parsed = parse_absolute(value).or_else(|| parse_relative(value, now))?;
    parsed.with_nanosecond(0)
}

fn parse_absolute(value: &str) -> Option<DateTime<Utc>> {
    if value.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = value.parse().ok()?;
        return if value.len() >= 13 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    COMMON_FORMATS
        .iter()
        .find_map(|format| parse_with_format(value, format))
}

static RELATIVE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(\d+(?:\.\d+)?)\s*(seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h|days?|d|weeks?|w|months?|mo|years?|yrs?|y)\b",
    )
    .ok()
});

/// Reads "today", "yesterday 10:30", "just now" and "2 days, 3 hours ago".
pub fn parse_relative(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = value.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower == "now" || lower == "just now" {
        return Some(now);
    }

    for (word, days_back) in [("today", 0), ("yesterday", 1)] {
        if let Some(rest) = lower.strip_prefix(word) {
            let day = (now - Duration::days(days_back)).date_naive();
            let rest = rest.trim().trim_start_matches("at").trim().trim_start_matches(',').trim();
            let time = if rest.is_empty() {
                NaiveTime::MIN
            } else {
                NaiveTime::parse_from_str(rest, "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(rest, "%H:%M"))
                    .or_else(|_| NaiveTime::parse_from_str(&rest.to_uppercase(), "%I:%M %p"))
                    .ok()?
            };
            return Some(Utc.from_utc_datetime(&day.and_time(time)));
        }
    }

    let re = RELATIVE_RE.as_ref()?;
    let mut total = 0.0f64;
    let mut matched = false;
    for caps in re.captures_iter(&lower) {
        let amount: f64 = caps[1].parse().ok()?;
        let unit = &caps[2];
        let seconds = match unit {
            u if u.starts_with("mo") => 30.0 * 86_400.0,
            u if u.starts_with('s') => 1.0,
            u if u.starts_with('m') => 60.0,
            u if u.starts_with('h') => 3_600.0,
            u if u.starts_with('d') => 86_400.0,
            u if u.starts_with('w') => 7.0 * 86_400.0,
            u if u.starts_with('y') => 365.0 * 86_400.0,
            _ => return None,
        };
        total += amount * seconds;
        matched = true;
    }

    if !matched {
        return None;
    }
    // out-of-range ages give no date
    let delta = Duration::try_seconds(total.round() as i64)?;
    now.checked_sub_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, args: Option<Value>) -> FilterSpec {
        FilterSpec {
            name: name.to_string(),
            args,
        }
    }

    fn s(v: &str) -> Option<Value> {
        Some(Value::String(v.to_string()))
    }

    fn list(items: &[&str]) -> Option<Value> {
        Some(Value::Sequence(
            items.iter().map(|i| Value::String(i.to_string())).collect(),
        ))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn run(filters: &[FilterSpec], value: &str) -> String {
        apply_at(filters, value, now()).unwrap()
    }

    #[test]
    fn test_is_known() {
        assert!(is_known("dateparse"));
        assert!(is_known("re_replace"));
        assert!(!is_known("explode"));
    }

    #[test]
    fn test_querystring() {
        let f = [step("querystring", s("id"))];
        assert_eq!(run(&f, "/details.php?id=42&hit=1"), "42");
        assert_eq!(run(&f, "/details.php?x=1"), "");
    }

    #[test]
    fn test_regexp_first_group() {
        let f = [step("regexp", s(r"(\d+) seeders"))];
        assert_eq!(run(&f, "has 12 seeders"), "12");
        assert_eq!(run(&f, "none"), "");
    }

    #[test]
    fn test_split_and_negative_index() {
        assert_eq!(run(&[step("split", list(&["/", "1"]))], "a/b/c"), "b");
        assert_eq!(run(&[step("split", list(&["/", "-1"]))], "a/b/c"), "c");
        assert!(apply_at(&[step("split", list(&["/", "9"]))], "a/b", now()).is_err());
    }

    #[test]
    fn test_replace_chain() {
        let f = [
            step("replace", list(&["-", " "])),
            step("toupper", None),
            step("append", s("!")),
            step("prepend", s(">")),
        ];
        assert_eq!(run(&f, "a-b"), ">A B!");
    }

    #[test]
    fn test_re_replace() {
        let f = [step("re_replace", list(&[r"\s+", " "]))];
        assert_eq!(run(&f, "a   b\n c"), "a b c");
    }

    #[test]
    fn test_trim() {
        assert_eq!(run(&[step("trim", None)], "  x "), "x");
        assert_eq!(run(&[step("trim", s("[]"))], "[x]"), "x");
    }

    #[test]
    fn test_url_codec() {
        assert_eq!(run(&[step("urldecode", None)], "a%20b+c"), "a b c");
        assert_eq!(run(&[step("urlencode", None)], "a b"), "a%20b");
    }

    #[test]
    fn test_missing_argument() {
        let err = apply_at(&[step("regexp", None)], "x", now()).unwrap_err();
        assert!(matches!(err, IndexerError::Validation { field, .. } if field == "filters.regexp"));
    }

    #[test]
    fn test_go_layout() {
        assert_eq!(go_layout("2006-01-02 15:04:05"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(go_layout("Jan 2, 2006"), "%b %d, %Y");
        assert_eq!(go_layout("02/01/06 3:04 PM"), "%d/%m/%y %I:%M %p");
    }

    #[test]
    fn test_dateparse() {
        let f = [step("dateparse", s("2006-01-02 15:04"))];
        assert_eq!(run(&f, "2024-01-05 10:30"), "2024-01-05T10:30:00Z");
        let f = [step("dateparse", s("02.01.2006"))];
        assert_eq!(run(&f, "05.01.2024"), "2024-01-05T00:00:00Z");
        assert!(apply_at(&f, "garbage", now()).is_err());
    }

    #[test]
    fn test_timeago() {
        let f = [step("timeago", None)];
        assert_eq!(run(&f, "2 hours ago"), "2024-03-10T10:00:00Z");
        assert_eq!(run(&f, "1 day, 3 hours ago"), "2024-03-09T09:00:00Z");
        assert_eq!(run(&f, "2 weeks ago"), "2024-02-25T12:00:00Z");
    }

    #[test]
    fn test_parse_relative_days() {
        assert_eq!(
            parse_relative("Yesterday at 10:15", now()),
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 10, 15, 0).unwrap())
        );
        assert_eq!(
            parse_relative("today", now()),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_relative("just now", now()), Some(now()));
        assert_eq!(parse_relative("whenever", now()), None);
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).unwrap();
        assert_eq!(parse_date("2024-01-05T10:30:00Z", now()), Some(expected));
        assert_eq!(parse_date("2024-01-05T11:30:00+01:00", now()), Some(expected));
        assert_eq!(parse_date("Fri, 05 Jan 2024 10:30:00 +0000", now()), Some(expected));
        assert_eq!(parse_date("1704450600", now()), Some(expected));
        assert_eq!(parse_date("2024-01-05 10:30", now()), Some(expected));
        assert_eq!(parse_date("", now()), None);
        assert_eq!(parse_date("not a date", now()), None);
    }

    #[test]
    fn test_parse_date_truncates_to_seconds() {
        let parsed = parse_date("2024-01-05T10:30:00.750Z", now()).unwrap();
        assert_eq!(parsed.nanosecond(), 0);
    }

    #[test]
    fn test_out_of_range_age_has_no_date() {
        assert_eq!(parse_date("1000000 years ago", now()), None);
        assert_eq!(parse_date("300000000 years ago", now()), None);
        assert_eq!(parse_relative(&format!("{} s ago", "9".repeat(400)), now()), None);
        assert!(apply_at(&[step("timeago", None)], "1000000 years ago", now()).is_err());
        assert_eq!(
            parse_date("100 years ago", now()),
            Some(now() - Duration::days(36_500))
        );
    }

    #[test]
    fn test_fuzzytime() {
        let f = [step("fuzzytime", None)];
        assert_eq!(run(&f, "05/01/2024"), "2024-01-05T00:00:00Z");
        assert_eq!(run(&f, "3 days ago"), "2024-03-07T12:00:00Z");
    }
}
