//! Definitions compiled into the binary, keyed by site.

pub const BUILTIN: &[(&str, &str)] = &[
    ("demo", include_str!("demo.yml")),
    ("demo-rss", include_str!("demo-rss.yml")),
];
