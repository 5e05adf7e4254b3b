//! Torznab query representation and parsing.

use serde::{Deserialize, Serialize};

use crate::{IndexerError, Result};

/// The Torznab function requested by the `t` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchKind {
    #[default]
    Search,
    TvSearch,
    Movie,
    Music,
    Book,
    Caps,
}

impl SearchKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "search" => Ok(Self::Search),
            "tvsearch" | "tv-search" => Ok(Self::TvSearch),
            "movie" | "movie-search" => Ok(Self::Movie),
            "music" | "music-search" => Ok(Self::Music),
            "book" | "book-search" => Ok(Self::Book),
            "caps" => Ok(Self::Caps),
            other => Err(IndexerError::validation(
                "t",
                format!("unknown function '{}'", other),
            )),
        }
    }

    /// The value sent as the `t` parameter.
    pub fn as_param(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::TvSearch => "tvsearch",
            Self::Movie => "movie",
            Self::Music => "music",
            Self::Book => "book",
            Self::Caps => "caps",
        }
    }

    /// The key used in capability search modes.
    pub fn mode_key(&self) -> &'static str {
        match self {
            Self::Search | Self::Caps => "search",
            Self::TvSearch => "tv-search",
            Self::Movie => "movie-search",
            Self::Music => "music-search",
            Self::Book => "book-search",
        }
    }
}

/// A normalized search request.
///
/// Only [`Query::parse`] builds a query, so every caller sees the same
/// canonical shape regardless of how the parameters were spelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    kind: SearchKind,
    term: Option<String>,
    categories: Vec<u32>,
    season: Option<u32>,
    episode: Option<String>,
    imdb_id: Option<String>,
    tvdb_id: Option<u64>,
    tvmaze_id: Option<u64>,
    tvrage_id: Option<u64>,
    limit: Option<usize>,
    offset: usize,
    extended: bool,
}

impl Query {
    /// Parses Torznab key/value parameters.
    ///
    /// Unknown parameter names are ignored. Malformed values fail with a
    /// validation error naming the parameter.
    pub fn parse<I, K, V>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Query::default();

        for (key, value) in params {
            let value = value.as_ref().trim();
            match key.as_ref() {
                "t" => query.kind = SearchKind::parse(value)?,
                "q" => query.term = non_empty(value),
                "cat" => {
                    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        let id = parse_number::<u32>("cat", part)?;
                        if !query.categories.contains(&id) {
                            query.categories.push(id);
                        }
                    }
                }
                "season" => {
                    query.season = match non_empty(value) {
                        Some(v) => {
                            let digits = v.trim_start_matches(['S', 's']);
                            Some(parse_number("season", digits)?)
                        }
                        None => None,
                    }
                }
                "ep" => {
                    query.episode = non_empty(value.trim_start_matches(['E', 'e']));
                }
                "imdbid" => query.imdb_id = parse_imdb(value)?,
                "tvdbid" => query.tvdb_id = parse_optional("tvdbid", value)?,
                "tvmazeid" => query.tvmaze_id = parse_optional("tvmazeid", value)?,
                "rid" => query.tvrage_id = parse_optional("rid", value)?,
                "limit" => query.limit = parse_optional("limit", value)?,
                "offset" => query.offset = parse_optional("offset", value)?.unwrap_or(0),
                "extended" => query.extended = matches!(value, "1" | "true"),
                _ => {}
            }
        }

        Ok(query)
    }

    /// A plain free-text search.
    pub fn keywords_only(term: &str) -> Self {
        Self::parse([("q", term)]).unwrap_or_default()
    }

    /// Emits the canonical parameter list; parsing it yields an equal query.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("t".to_string(), self.kind.as_param().to_string())];
        let mut push = |key: &str, value: String| params.push((key.to_string(), value));

        if let Some(term) = &self.term {
            push("q", term.clone());
        }
        if !self.categories.is_empty() {
            let joined = self
                .categories
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            push("cat", joined);
        }
        if let Some(season) = self.season {
            push("season", season.to_string());
        }
        if let Some(ep) = &self.episode {
            push("ep", ep.clone());
        }
        if let Some(imdb) = &self.imdb_id {
            push("imdbid", imdb.clone());
        }
        if let Some(id) = self.tvdb_id {
            push("tvdbid", id.to_string());
        }
        if let Some(id) = self.tvmaze_id {
            push("tvmazeid", id.to_string());
        }
        if let Some(id) = self.tvrage_id {
            push("rid", id.to_string());
        }
        if let Some(limit) = self.limit {
            push("limit", limit.to_string());
        }
        if self.offset > 0 {
            push("offset", self.offset.to_string());
        }
        if self.extended {
            push("extended", "1".to_string());
        }
        params
    }

    /// The term sites usually expect, with `SxxEyy` appended for TV searches.
    pub fn keywords(&self) -> String {
        let mut words = self.term.clone().unwrap_or_default();

        if self.kind == SearchKind::TvSearch {
            if let Some(season) = self.season {
                words.push_str(&format!(" S{:02}", season));
                if let Some(ep) = &self.episode {
                    match ep.parse::<u32>() {
                        Ok(n) => words.push_str(&format!("E{:02}", n)),
                        Err(_) => words.push_str(&format!(" {}", ep)),
                    }
                }
            } else if let Some(ep) = &self.episode {
                words.push_str(&format!(" {}", ep));
            }
        }

        words.trim().to_string()
    }

    pub fn kind(&self) -> SearchKind {
        self.kind
    }

    pub fn term(&self) -> Option<&str> {
        self.term.as_deref()
    }

    pub fn categories(&self) -> &[u32] {
        &self.categories
    }

    pub fn season(&self) -> Option<u32> {
        self.season
    }

    pub fn episode(&self) -> Option<&str> {
        self.episode.as_deref()
    }

    pub fn imdb_id(&self) -> Option<&str> {
        self.imdb_id.as_deref()
    }

    pub fn tvdb_id(&self) -> Option<u64> {
        self.tvdb_id
    }

    pub fn tvmaze_id(&self) -> Option<u64> {
        self.tvmaze_id
    }

    pub fn tvrage_id(&self) -> Option<u64> {
        self.tvrage_id
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn extended(&self) -> bool {
        self.extended
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| IndexerError::validation(field, format!("'{}' is not a number", value)))
}

fn parse_optional<T: std::str::FromStr>(field: &str, value: &str) -> Result<Option<T>> {
    match non_empty(value) {
        Some(v) => parse_number(field, &v).map(Some),
        None => Ok(None),
    }
}

fn parse_imdb(value: &str) -> Result<Option<String>> {
    let Some(value) = non_empty(value) else {
        return Ok(None);
    };
    let digits = value.trim_start_matches("tt");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(IndexerError::validation(
            "imdbid",
            format!("'{}' is not an IMDb id", value),
        ));
    }
    Ok(Some(format!("tt{}", digits)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(pairs: &[(&str, &str)]) -> Result<Query> {
        Query::parse(pairs.iter().copied())
    }

    #[test]
    fn test_parse_defaults() {
        let query = parse(&[]).unwrap();
        assert_eq!(query.kind(), SearchKind::Search);
        assert!(query.term().is_none());
        assert!(query.categories().is_empty());
        assert_eq!(query.offset(), 0);
        assert!(query.limit().is_none());
    }

    #[test]
    fn test_parse_full_tv_search() {
        let query = parse(&[
            ("t", "tvsearch"),
            ("q", " The Show "),
            ("cat", "5000,5040"),
            ("season", "2"),
            ("ep", "7"),
            ("tvdbid", "1234"),
            ("limit", "50"),
            ("offset", "10"),
        ])
        .unwrap();
        assert_eq!(query.kind(), SearchKind::TvSearch);
        assert_eq!(query.term(), Some("The Show"));
        assert_eq!(query.categories(), &[5000, 5040]);
        assert_eq!(query.season(), Some(2));
        assert_eq!(query.episode(), Some("7"));
        assert_eq!(query.tvdb_id(), Some(1234));
        assert_eq!(query.limit(), Some(50));
        assert_eq!(query.offset(), 10);
    }

    #[test]
    fn test_parse_ignores_unknown_params() {
        let query = parse(&[("q", "foo"), ("apikey", "secret"), ("future", "x")]).unwrap();
        assert_eq!(query.term(), Some("foo"));
    }

    #[test]
    fn test_parse_malformed_limit_names_field() {
        let err = parse(&[("limit", "lots")]).unwrap_err();
        match err {
            IndexerError::Validation { field, .. } => assert_eq!(field, "limit"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_function() {
        assert!(matches!(
            parse(&[("t", "dance")]),
            Err(IndexerError::Validation { .. })
        ));
    }

    #[test]
    fn test_parse_imdb_normalized() {
        let query = parse(&[("imdbid", "0111161")]).unwrap();
        assert_eq!(query.imdb_id(), Some("tt0111161"));
        let query = parse(&[("imdbid", "tt0111161")]).unwrap();
        assert_eq!(query.imdb_id(), Some("tt0111161"));
        assert!(parse(&[("imdbid", "abc")]).is_err());
    }

    #[test]
    fn test_parse_season_prefix() {
        let query = parse(&[("season", "S03"), ("ep", "E04")]).unwrap();
        assert_eq!(query.season(), Some(3));
        assert_eq!(query.episode(), Some("04"));
    }

    #[test]
    fn test_parse_dedupes_categories() {
        let query = parse(&[("cat", "2000"), ("cat", "2000,5000")]).unwrap();
        assert_eq!(query.categories(), &[2000, 5000]);
    }

    #[test]
    fn test_conflicting_filters_preserved() {
        let query = parse(&[("q", "show s01e02"), ("season", "1"), ("ep", "2")]).unwrap();
        assert_eq!(query.term(), Some("show s01e02"));
        assert_eq!(query.season(), Some(1));
        assert_eq!(query.episode(), Some("2"));
    }

    #[test]
    fn test_canonical_round_trip() {
        let query = parse(&[
            ("t", "tv-search"),
            ("q", "foo"),
            ("cat", "5030, 5040"),
            ("season", "S1"),
            ("ep", "12"),
            ("imdbid", "123"),
            ("tvmazeid", "9"),
            ("rid", "77"),
            ("limit", "5"),
            ("offset", "3"),
            ("extended", "1"),
        ])
        .unwrap();
        let reparsed = Query::parse(query.to_params()).unwrap();
        assert_eq!(reparsed, query);
        assert_eq!(Query::parse(reparsed.to_params()).unwrap(), reparsed);
    }

    #[test]
    fn test_keywords_tv() {
        let query = parse(&[("t", "tvsearch"), ("q", "show"), ("season", "1"), ("ep", "2")]).unwrap();
        assert_eq!(query.keywords(), "show S01E02");

        let query = parse(&[("t", "tvsearch"), ("q", "show"), ("season", "4")]).unwrap();
        assert_eq!(query.keywords(), "show S04");

        let query =
            parse(&[("t", "tvsearch"), ("q", "daily"), ("season", "2020"), ("ep", "01/05")]).unwrap();
        assert_eq!(query.keywords(), "daily S2020 01/05");
    }

    #[test]
    fn test_keywords_plain_search_ignores_episode() {
        let query = parse(&[("q", "foo"), ("season", "1")]).unwrap();
        assert_eq!(query.keywords(), "foo");
    }

    #[test]
    fn test_keywords_only() {
        let query = Query::keywords_only("foo");
        assert_eq!(query.term(), Some("foo"));
        assert_eq!(query.kind(), SearchKind::Search);
    }
}
