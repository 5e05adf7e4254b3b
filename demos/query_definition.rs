//! Example: Search one tracker definition and print the Torznab feed.
//!
//! Usage: cargo run --example query_definition -- <key or file.yml> <term> [username] [password]

use std::path::Path;
use std::sync::Arc;

use tracker_proxy::{
    load_definition_file, BuiltinLoader, DefinitionLoader, Indexer, MemoryConfig, Query, Runner, RunnerOpts,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let target = args.first().map(String::as_str).unwrap_or("demo");
    let term = args.get(1).map(String::as_str).unwrap_or("ubuntu");

    let definition = if Path::new(target).is_file() {
        load_definition_file(Path::new(target))?
    } else {
        BuiltinLoader.load(target)?
    };

    // Credentials go in the config section named after the site
    let mut config = MemoryConfig::new();
    if let (Some(username), Some(password)) = (args.get(2), args.get(3)) {
        config = config
            .with(&definition.site, "username", username)
            .with(&definition.site, "password", password);
    }

    println!("Searching {} for: {}", definition.display_name(), term);
    println!();

    let mut runner = Runner::new(Arc::new(definition), RunnerOpts::new(Arc::new(config)))?;
    let feed = runner.search(&Query::keywords_only(term)).await?;

    println!("Found {} results", feed.len());
    println!();
    println!("{}", feed.to_xml());

    Ok(())
}
