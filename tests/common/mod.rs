//! Fake tracker pages shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use httpmock::prelude::*;
use httpmock::Mock;
use tracker_proxy::{MemoryConfig, RunnerOpts};

pub const RESULTS: &str = r#"<html><body>
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

pub const TORRENT: &[u8] = b"d8:announce35:udp://tracker.demo.test:1337/announcee";

/// Config pointing the built-in `demo` definition at the mock server.
pub fn demo_config(server: &MockServer) -> MemoryConfig {
    MemoryConfig::new()
        .with("demo", "url", &server.url("/"))
        .with("demo", "username", "me")
        .with("demo", "password", "secret")
        .with("demo", "enabled", "true")
}

pub fn demo_opts(server: &MockServer) -> RunnerOpts {
    RunnerOpts::new(Arc::new(demo_config(server)))
}

pub struct DemoMocks<'a> {
    pub login: Mock<'a>,
    pub index: Mock<'a>,
    pub browse: Mock<'a>,
    pub download: Mock<'a>,
    pub ratio: Mock<'a>,
}

/// Serves a well-behaved demo tracker.
pub fn mock_demo(server: &MockServer) -> DemoMocks<'_> {
    let login = server.mock(|when, then| {
        when.method(POST)
            .path("/login.php")
            .body("username=me&password=secret");
        then.status(200)
            .header("content-type", "text/html")
            .header("set-cookie", "uid=42; Path=/")
            .body("<html>Welcome back</html>");
    });
    let index = server.mock(|when, then| {
        when.method(GET).path("/index.php").header("cookie", "uid=42");
        then.status(200)
            .header("content-type", "text/html")
            .body(r#"<html><a href="/logout.php">Log out</a></html>"#);
    });
    let browse = server.mock(|when, then| {
        when.method(GET)
            .path("/browse.php")
            .query_param("search", "foo")
            .header("cookie", "uid=42");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(RESULTS);
    });
    let download = server.mock(|when, then| {
        when.method(GET).path("/download.php").query_param("id", "1");
        then.status(200)
            .header("content-type", "application/x-bittorrent")
            .body(TORRENT);
    });
    let ratio = server.mock(|when, then| {
        when.method(GET).path("/user.php");
        then.status(200)
            .header("content-type", "text/html")
            .body(r#"<html><span class="ratio">2.471</span></html>"#);
    });
    DemoMocks {
        login,
        index,
        browse,
        download,
        ratio,
    }
}
