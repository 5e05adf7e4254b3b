//! Example: Test the built-in demo definition against a recorded session.
//!
//! The archive is written to a temporary directory and replayed by the
//! tester, so no network access happens.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracker_proxy::archive::{Archive, Entry};
use tracker_proxy::transport::{Request, Response};
use tracker_proxy::{BuiltinLoader, DefinitionLoader, MemoryConfig, RunnerOpts, TestMode, Tester, TesterOpts};
use url::Url;

const BASE: &str = "https://demo.tracker-proxy.test";

const RESULTS: &str = r#"<html><body>
<table class="torrents"><tbody>
<tr>
  <td class="cat"><a href="/browse.php?cat=2">TV/HD</a></td>
  <td class="name"><a href="/details.php?id=1">Foo S01E01 720p</a></td>
  <td class="dl"><a href="/download.php?id=1">DL</a></td>
  <td class="size">1.4 GB</td><td class="added">2024-05-01 12:00</td>
  <td class="seeders">12</td><td class="leechers">3</td><td class="snatched">40</td>
</tr>
<tr>
  <td class="cat"><a href="/browse.php?cat=3">Movies</a></td>
  <td class="name"><a href="/details.php?id=2">Foo the Movie 1080p</a></td>
  <td class="dl"><a href="/download.php?id=2">DL</a></td>
  <td class="size">700 MiB</td><td class="added">2024-04-28 08:30</td>
  <td class="seeders">5</td><td class="leechers">0</td><td class="snatched">9</td>
</tr>
</tbody></table>
</body></html>"#;

fn url(path: &str) -> anyhow::Result<Url> {
    Ok(Url::parse(&format!("{}{}", BASE, path))?)
}

fn exchange(request: Request, content_type: &str, body: &[u8]) -> Entry {
    let response = Response {
        status: 200,
        url: request.url.clone(),
        headers: vec![("Content-Type".to_string(), content_type.to_string())],
        body: body.to_vec(),
    };
    Entry::from_exchange(&request, &response, Utc::now(), Duration::from_millis(40))
}

fn recorded_session() -> anyhow::Result<Archive> {
    let credentials = vec![
        ("username".to_string(), "me".to_string()),
        ("password".to_string(), "secret".to_string()),
    ];

    let mut archive = Archive::new();
    let entries = archive.entries_mut();
    entries.push(exchange(
        Request::post_form(url("/login.php")?, &credentials),
        "text/html",
        b"<html>Welcome back</html>",
    ));
    entries.push(exchange(
        Request::get(url("/index.php")?),
        "text/html",
        b"<html><a href=\"/logout.php\">Log out</a></html>",
    ));
    entries.push(exchange(
        Request::get(url("/browse.php?search=foo")?),
        "text/html",
        RESULTS.as_bytes(),
    ));
    entries.push(exchange(
        Request::get(url("/download.php?id=1")?),
        "application/x-bittorrent",
        b"d8:announce35:udp://tracker.demo.test:1337/announcee",
    ));
    entries.push(exchange(
        Request::get(url("/user.php")?),
        "text/html",
        b"<html><span class=\"ratio\">2.471</span></html>",
    ));
    Ok(archive)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("demo.har");
    recorded_session()?.save(&path)?;
    println!("Recorded session written to {}", path.display());

    let config = MemoryConfig::new()
        .with("demo", "username", "me")
        .with("demo", "password", "secret");
    let opts = TesterOpts::new(TestMode::Replay(path), RunnerOpts::new(Arc::new(config)));

    let definition = Arc::new(BuiltinLoader.load("demo")?);
    let report = Tester::new(definition, opts).run().await?;

    println!();
    println!("{}", report);

    if !report.passed() {
        anyhow::bail!("replay failed");
    }
    Ok(())
}
