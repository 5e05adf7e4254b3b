//! Indexer capabilities and the Torznab `caps` document.

use std::collections::BTreeMap;

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use super::categories::{self, Category};

/// Maps one site-specific category id onto a Torznab category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMapping {
    pub site_id: String,
    pub category: Category,
}

/// What an indexer can search for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Search mode key (e.g. `tv-search`) to supported parameters.
    pub modes: BTreeMap<String, Vec<String>>,
    /// Site category mappings in declaration order.
    pub categories: Vec<CategoryMapping>,
}

impl Capabilities {
    /// Whether the search mode is declared.
    pub fn supports_mode(&self, mode: &str) -> bool {
        self.modes.contains_key(mode)
    }

    /// Site category ids whose Torznab category satisfies the requested ids.
    pub fn site_categories(&self, requested: &[u32]) -> Vec<String> {
        let mut ids = Vec::new();
        for mapping in &self.categories {
            if categories::matches(requested, mapping.category.id) && !ids.contains(&mapping.site_id)
            {
                ids.push(mapping.site_id.clone());
            }
        }
        ids
    }

    /// Torznab category ids for a site category id.
    pub fn torznab_categories(&self, site_id: &str) -> Vec<u32> {
        self.categories
            .iter()
            .filter(|m| m.site_id == site_id)
            .map(|m| m.category.id)
            .collect()
    }

    /// Distinct Torznab categories, sorted by id.
    pub fn distinct_categories(&self) -> Vec<Category> {
        let mut cats: Vec<Category> = Vec::new();
        for mapping in &self.categories {
            if !cats.iter().any(|c| c.id == mapping.category.id) {
                cats.push(mapping.category.clone());
            }
        }
        cats.sort_by_key(|c| c.id);
        cats
    }

    /// Merges another indexer's capabilities into this one.
    pub fn merge(&mut self, other: &Capabilities) {
        for (mode, params) in &other.modes {
            let entry = self.modes.entry(mode.clone()).or_default();
            for param in params {
                if !entry.contains(param) {
                    entry.push(param.clone());
                }
            }
        }
        for mapping in &other.categories {
            if !self.categories.contains(mapping) {
                self.categories.push(mapping.clone());
            }
        }
    }

    /// Renders the Torznab `caps` response.
    pub fn to_xml(&self, server_title: &str) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<caps>\n");
        out.push_str(&format!(
            "  <server title=\"{}\"/>\n  <searching>\n",
            escape(server_title)
        ));

        for (mode, params) in &self.modes {
            let tag = match mode.as_str() {
                "tv-search" => "tv-search",
                "movie-search" => "movie-search",
                "music-search" => "audio-search",
                "book-search" => "book-search",
                _ => "search",
            };
            out.push_str(&format!(
                "    <{} available=\"yes\" supportedParams=\"{}\"/>\n",
                tag,
                escape(params.join(",").as_str())
            ));
        }
        out.push_str("  </searching>\n  <categories>\n");

        let cats = self.distinct_categories();
        let mut parents: Vec<u32> = cats.iter().map(|c| c.parent_id()).collect();
        parents.dedup();

        for parent in parents {
            let name = categories::by_id(parent)
                .map(|c| c.name)
                .unwrap_or_else(|| parent.to_string());
            out.push_str(&format!(
                "    <category id=\"{}\" name=\"{}\">\n",
                parent,
                escape(name.as_str())
            ));
            for sub in cats.iter().filter(|c| c.parent_id() == parent && !c.is_parent()) {
                out.push_str(&format!(
                    "      <subcat id=\"{}\" name=\"{}\"/>\n",
                    sub.id,
                    escape(sub.name.as_str())
                ));
            }
            out.push_str("    </category>\n");
        }

        out.push_str("  </categories>\n</caps>\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        let mut modes = BTreeMap::new();
        modes.insert("search".to_string(), vec!["q".to_string()]);
        modes.insert(
            "tv-search".to_string(),
            vec!["q".to_string(), "season".to_string(), "ep".to_string()],
        );
        Capabilities {
            modes,
            categories: vec![
                CategoryMapping {
                    site_id: "1".to_string(),
                    category: Category::new(5040, "TV/HD"),
                },
                CategoryMapping {
                    site_id: "2".to_string(),
                    category: Category::new(2000, "Movies"),
                },
                CategoryMapping {
                    site_id: "3".to_string(),
                    category: Category::new(5030, "TV/SD"),
                },
            ],
        }
    }

    #[test]
    fn test_site_categories_parent_filter() {
        assert_eq!(caps().site_categories(&[5000]), vec!["1", "3"]);
        assert_eq!(caps().site_categories(&[2000]), vec!["2"]);
        assert!(caps().site_categories(&[7000]).is_empty());
    }

    #[test]
    fn test_torznab_categories() {
        assert_eq!(caps().torznab_categories("1"), vec![5040]);
        assert!(caps().torznab_categories("99").is_empty());
    }

    #[test]
    fn test_merge_unions() {
        let mut a = caps();
        let mut b = Capabilities::default();
        b.modes.insert("search".to_string(), vec!["q".to_string(), "imdbid".to_string()]);
        b.categories.push(CategoryMapping {
            site_id: "7".to_string(),
            category: Category::new(3000, "Audio"),
        });
        a.merge(&b);
        assert_eq!(a.modes["search"], vec!["q", "imdbid"]);
        assert_eq!(a.categories.len(), 4);
        a.merge(&b);
        assert_eq!(a.categories.len(), 4);
    }

    #[test]
    fn test_caps_xml() {
        let xml = caps().to_xml("tracker-proxy");
        assert!(xml.contains("<server title=\"tracker-proxy\"/>"));
        assert!(xml.contains("<tv-search available=\"yes\" supportedParams=\"q,season,ep\"/>"));
        assert!(xml.contains("<category id=\"5000\" name=\"TV\">"));
        assert!(xml.contains("<subcat id=\"5040\" name=\"TV/HD\"/>"));
        assert!(xml.contains("<category id=\"2000\" name=\"Movies\">"));
    }

    #[test]
    fn test_supports_mode() {
        assert!(caps().supports_mode("tv-search"));
        assert!(!caps().supports_mode("movie-search"));
    }
}
