//! Standard Torznab categories.

use serde::{Deserialize, Serialize};

/// A Torznab category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    /// Numeric Torznab id (e.g. 5040).
    pub id: u32,
    /// Display name (e.g. "TV/HD").
    pub name: String,
}

impl Category {
    /// Creates a category.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Id of the top-level category this one belongs to.
    pub fn parent_id(&self) -> u32 {
        parent_id(self.id)
    }

    /// Whether this is a top-level category.
    pub fn is_parent(&self) -> bool {
        self.id % 1000 == 0
    }
}

/// Id of the top-level category for any category id.
pub fn parent_id(id: u32) -> u32 {
    id - id % 1000
}

const STANDARD: &[(u32, &str)] = &[
    (1000, "Console"),
    (1010, "Console/NDS"),
    (1020, "Console/PSP"),
    (1030, "Console/Wii"),
    (1040, "Console/Xbox"),
    (1050, "Console/Xbox 360"),
    (1080, "Console/PS3"),
    (2000, "Movies"),
    (2010, "Movies/Foreign"),
    (2020, "Movies/Other"),
    (2030, "Movies/SD"),
    (2040, "Movies/HD"),
    (2045, "Movies/UHD"),
    (2050, "Movies/BluRay"),
    (2060, "Movies/3D"),
    (3000, "Audio"),
    (3010, "Audio/MP3"),
    (3020, "Audio/Video"),
    (3030, "Audio/Audiobook"),
    (3040, "Audio/Lossless"),
    (4000, "PC"),
    (4010, "PC/0day"),
    (4020, "PC/ISO"),
    (4030, "PC/Mac"),
    (4050, "PC/Games"),
    (5000, "TV"),
    (5020, "TV/Foreign"),
    (5030, "TV/SD"),
    (5040, "TV/HD"),
    (5045, "TV/UHD"),
    (5060, "TV/Sport"),
    (5070, "TV/Anime"),
    (5080, "TV/Documentary"),
    (6000, "XXX"),
    (7000, "Books"),
    (7020, "Books/EBook"),
    (7030, "Books/Comics"),
    (8000, "Other"),
    (8010, "Other/Misc"),
];

/// All standard categories in id order.
pub fn all() -> Vec<Category> {
    STANDARD
        .iter()
        .map(|(id, name)| Category::new(*id, *name))
        .collect()
}

/// Looks up a standard category by id.
pub fn by_id(id: u32) -> Option<Category> {
    STANDARD
        .iter()
        .find(|(cid, _)| *cid == id)
        .map(|(id, name)| Category::new(*id, *name))
}

/// Looks up a standard category by name, case-insensitively.
///
/// Accepts both `TV/HD` and `TV HD` spellings.
pub fn by_name(name: &str) -> Option<Category> {
    let wanted = name.trim().replace(' ', "/").to_lowercase();
    STANDARD
        .iter()
        .find(|(_, n)| n.replace(' ', "/").to_lowercase() == wanted)
        .map(|(id, name)| Category::new(*id, *name))
}

/// Whether `candidate` satisfies a filter of requested category ids.
///
/// A request for a parent category matches all of its children.
pub fn matches(requested: &[u32], candidate: u32) -> bool {
    requested
        .iter()
        .any(|&r| r == candidate || (r % 1000 == 0 && parent_id(candidate) == r))
}
