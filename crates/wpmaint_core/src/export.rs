use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::MaintConfig;
use crate::rewrite::{content_hash, unix_timestamp};
use crate::runtime::normalize_for_display;
use crate::store::{ContentFilter, ContentItem, SiteStore};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Source of rendered page HTML.
pub trait PageFetcher {
    fn fetch(&mut self, url: &str) -> Result<String>;
}

pub struct HttpPageFetcher {
    client: Client,
    user_agent: String,
}

impl HttpPageFetcher {
    pub fn new(user_agent: &str, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build export HTTP client")?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    pub fn from_config(config: &MaintConfig) -> Result<Self> {
        Self::new(&config.user_agent(), config.http_timeout_ms())
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch(&mut self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .header("Accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.1")
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} while fetching {}", status.as_u16(), url);
        }
        response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))
    }
}

#[derive(Debug, Clone)]
pub struct StaticExportOptions {
    pub output_dir: PathBuf,
    pub post_types: Vec<String>,
    pub archive: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportedPage {
    pub id: i64,
    pub url: String,
    pub file: String,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportFailure {
    pub id: i64,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticExportReport {
    pub site_url: String,
    pub output_dir: String,
    pub manifest_path: String,
    pub archive_path: Option<String>,
    pub pages: Vec<ExportedPage>,
    pub failures: Vec<ExportFailure>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    site_url: &'a str,
    generated_at: u64,
    pages: &'a [ExportedPage],
    failures: &'a [ExportFailure],
}

/// Public site URL from config/env, falling back to the `home` option.
pub fn resolve_site_url(config: &MaintConfig, store: &SiteStore) -> Result<String> {
    if let Some(url) = config.site_url() {
        return Ok(url);
    }
    match store.get_option("home")? {
        Some(home) if !home.trim().is_empty() => Ok(home.trim().trim_end_matches('/').to_string()),
        _ => bail!("site URL unknown (set [site].url or WPMAINT_SITE_URL)"),
    }
}

pub fn export_static_pages(
    store: &SiteStore,
    config: &MaintConfig,
    options: &StaticExportOptions,
) -> Result<StaticExportReport> {
    let site_url = resolve_site_url(config, store)?;
    let mut fetcher = HttpPageFetcher::from_config(config)?;
    export_static_pages_with_fetcher(store, &site_url, options, &mut fetcher)
}

/// Fetch every published item of the selected types and save it as
/// root-relative static HTML. A failed page is recorded and the loop moves on.
pub fn export_static_pages_with_fetcher(
    store: &SiteStore,
    site_url: &str,
    options: &StaticExportOptions,
    fetcher: &mut dyn PageFetcher,
) -> Result<StaticExportReport> {
    let site_url = site_url.trim().trim_end_matches('/');
    if site_url.is_empty() {
        bail!("site URL cannot be empty");
    }
    fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("failed to create {}", options.output_dir.display()))?;

    let items = store.list_content(&ContentFilter {
        post_types: options.post_types.clone(),
        statuses: vec!["publish".to_string()],
    })?;
    let front_page = front_page_id(store)?;
    let structure = store
        .get_option("permalink_structure")?
        .unwrap_or_default();

    let mut used_names = BTreeSet::new();
    let mut pages = Vec::new();
    let mut failures = Vec::new();
    for item in &items {
        let path = store.permalink_path(item)?;
        let url = if Some(item.id) == front_page {
            format!("{site_url}/")
        } else {
            item_url(site_url, item, &path, &structure)
        };
        let file_name = unique_file_name(&page_file_name(item, &path), item.id, &mut used_names);

        let html = match fetcher.fetch(&url) {
            Ok(html) => relativize_urls(&html, site_url),
            Err(error) => {
                warn!(id = item.id, url = %url, error = %format!("{error:#}"), "page fetch failed");
                failures.push(ExportFailure {
                    id: item.id,
                    url,
                    error: format!("{error:#}"),
                });
                continue;
            }
        };
        let target = options.output_dir.join(&file_name);
        if let Err(error) = fs::write(&target, &html) {
            warn!(file = %target.display(), %error, "failed to write page");
            failures.push(ExportFailure {
                id: item.id,
                url,
                error: format!("failed to write {}: {error}", normalize_for_display(&target)),
            });
            continue;
        }
        debug!(id = item.id, file = %file_name, "page exported");
        pages.push(ExportedPage {
            id: item.id,
            url,
            file: file_name,
            sha256: content_hash(&html),
            bytes: html.len(),
        });
    }

    let manifest_path = options.output_dir.join(MANIFEST_FILE_NAME);
    let manifest = Manifest {
        site_url,
        generated_at: unix_timestamp()?,
        pages: &pages,
        failures: &failures,
    };
    let rendered =
        serde_json::to_string_pretty(&manifest).context("failed to serialize export manifest")?;
    fs::write(&manifest_path, rendered)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

    let archive_path = if options.archive {
        let archive = options.output_dir.with_extension("zip");
        write_archive(&archive, &options.output_dir, &pages)?;
        Some(normalize_for_display(&archive))
    } else {
        None
    };

    info!(
        pages = pages.len(),
        failures = failures.len(),
        "static export finished"
    );
    Ok(StaticExportReport {
        site_url: site_url.to_string(),
        output_dir: normalize_for_display(&options.output_dir),
        manifest_path: normalize_for_display(&manifest_path),
        archive_path,
        pages,
        failures,
    })
}

/// Rewrite absolute links to the site host as root-relative paths. Covers
/// `https://host`, `http://host`, `//host` and the JSON-escaped `https:\/\/host`.
pub fn relativize_urls(html: &str, site_url: &str) -> String {
    let Some(host) = site_host(site_url) else {
        return html.to_string();
    };
    let prefixes = [
        format!("https:\\/\\/{host}"),
        format!("http:\\/\\/{host}"),
        format!("https://{host}"),
        format!("http://{host}"),
        format!("//{host}"),
    ];

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(ch) = rest.chars().next() {
        let matched = prefixes
            .iter()
            .find(|prefix| rest.starts_with(prefix.as_str()) && at_host_boundary(&rest[prefix.len()..]));
        match matched {
            Some(prefix) => {
                let tail = &rest[prefix.len()..];
                if !tail.starts_with('/') && !tail.starts_with("\\/") {
                    out.push('/');
                }
                rest = tail;
            }
            None => {
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    out
}

fn site_host(site_url: &str) -> Option<&str> {
    let trimmed = site_url.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .or_else(|| trimmed.strip_prefix("//"))
        .unwrap_or(trimmed);
    let host = without_scheme.split('/').next().unwrap_or_default();
    (!host.is_empty()).then_some(host)
}

/// The match must end the host name, so `example.org` never matches `example.org.evil`.
fn at_host_boundary(tail: &str) -> bool {
    match tail.chars().next() {
        None => true,
        Some(ch) => !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | ':' | '@')),
    }
}

fn front_page_id(store: &SiteStore) -> Result<Option<i64>> {
    if store.get_option("show_on_front")?.as_deref() != Some("page") {
        return Ok(None);
    }
    Ok(store
        .get_option("page_on_front")?
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|id| *id > 0))
}

/// `<slug>.html`, nested items joined with `-`, `page-<id>.html` when the slug is empty.
fn page_file_name(item: &ContentItem, permalink_path: &str) -> String {
    if item.slug.trim().is_empty() || permalink_path.is_empty() {
        return format!("page-{}.html", item.id);
    }
    let stem = permalink_path
        .split('/')
        .map(|segment| {
            segment
                .chars()
                .map(|ch| {
                    if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '%') {
                        ch
                    } else {
                        '-'
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-");
    format!("{stem}.html")
}

fn unique_file_name(name: &str, id: i64, used: &mut BTreeSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let stem = name.strip_suffix(".html").unwrap_or(name);
    let mut candidate = format!("{stem}-{id}.html");
    let mut counter = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{stem}-{id}-{counter}.html");
        counter += 1;
    }
    candidate
}

/// Public URL of an item under the site's `permalink_structure`. An empty
/// structure means plain `?page_id=`/`?p=` links.
fn item_url(site_url: &str, item: &ContentItem, path: &str, structure: &str) -> String {
    let structure = structure.trim();
    if structure.is_empty() || path.is_empty() {
        return query_url(site_url, item);
    }
    match item.post_type.as_str() {
        "page" => format!("{site_url}/{path}/"),
        "post" => expand_structure(structure, item, path)
            .map(|expanded| format!("{site_url}{expanded}"))
            .unwrap_or_else(|| query_url(site_url, item)),
        // Custom types have their own rewrite slugs; WordPress redirects the
        // query form to the canonical permalink.
        _ => query_url(site_url, item),
    }
}

fn query_url(site_url: &str, item: &ContentItem) -> String {
    match item.post_type.as_str() {
        "page" => format!("{site_url}/?page_id={}", item.id),
        "post" => format!("{site_url}/?p={}", item.id),
        other => format!("{site_url}/?post_type={other}&p={}", item.id),
    }
}

/// `None` when the structure uses a tag that needs data outside the posts
/// table (`%category%`, `%author%`, custom tags).
fn expand_structure(structure: &str, item: &ContentItem, path: &str) -> Option<String> {
    let mut out = String::new();
    let mut rest = structure;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('%')?;
        let value = match &after[..end] {
            "postname" => path.to_string(),
            "post_id" => item.id.to_string(),
            "year" => item.date.get(0..4)?.to_string(),
            "monthnum" => item.date.get(5..7)?.to_string(),
            "day" => item.date.get(8..10)?.to_string(),
            "hour" => item.date.get(11..13)?.to_string(),
            "minute" => item.date.get(14..16)?.to_string(),
            "second" => item.date.get(17..19)?.to_string(),
            _ => return None,
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    if !out.starts_with('/') {
        out.insert(0, '/');
    }
    Some(out)
}

fn write_archive(archive: &Path, output_dir: &Path, pages: &[ExportedPage]) -> Result<()> {
    let file =
        File::create(archive).with_context(|| format!("failed to create {}", archive.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let names = pages
        .iter()
        .map(|page| page.file.as_str())
        .chain(std::iter::once(MANIFEST_FILE_NAME));
    for name in names {
        let path = output_dir.join(name);
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        writer
            .start_file(name, options)
            .with_context(|| format!("failed to add {name} to archive"))?;
        writer
            .write_all(&bytes)
            .with_context(|| format!("failed to write {name} to archive"))?;
    }
    writer
        .finish()
        .with_context(|| format!("failed to finalize {}", archive.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::fixtures::Fixture;

    const SITE: &str = "https://example.org";

    struct MockFetcher {
        failing: BTreeSet<String>,
        requested: Vec<String>,
    }

    impl MockFetcher {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|url| url.to_string()).collect(),
                requested: Vec::new(),
            }
        }
    }

    impl PageFetcher for MockFetcher {
        fn fetch(&mut self, url: &str) -> Result<String> {
            self.requested.push(url.to_string());
            if self.failing.contains(url) {
                bail!("HTTP 500 while fetching {url}");
            }
            Ok(format!(
                "<html><a href=\"{url}\">self</a><img src=\"https://example.org/wp-content/a.png\"></html>"
            ))
        }
    }

    fn options(fixture: &Fixture) -> StaticExportOptions {
        StaticExportOptions {
            output_dir: fixture.paths.exports_dir.join("static"),
            post_types: vec!["page".to_string()],
            archive: false,
        }
    }

    #[test]
    fn exports_one_file_per_published_page_and_survives_failures() {
        let fixture = Fixture::new();
        fixture.option("permalink_structure", "/%postname%/");
        fixture.post("Home", "home", "page", "publish");
        let about = fixture.post("About", "about", "page", "publish");
        fixture.child_post("Team", "team", "page", "publish", about);
        fixture.post("Contact", "contact", "page", "publish");
        fixture.post("Draft", "draft", "page", "draft");
        fixture.post("News", "news", "post", "publish");
        let options = options(&fixture);
        let mut fetcher = MockFetcher::new(&["https://example.org/contact/"]);

        let report =
            export_static_pages_with_fetcher(&fixture.store, SITE, &options, &mut fetcher)
                .expect("export");

        assert_eq!(fetcher.requested.len(), 4);
        assert_eq!(report.pages.len(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].url, "https://example.org/contact/");
        let files = report
            .pages
            .iter()
            .map(|page| page.file.as_str())
            .collect::<Vec<_>>();
        assert_eq!(files, vec!["home.html", "about.html", "about-team.html"]);
        for page in &report.pages {
            assert!(options.output_dir.join(&page.file).is_file());
            assert_eq!(page.sha256.len(), 64);
        }
        assert!(!options.output_dir.join("contact.html").exists());

        let team = fs::read_to_string(options.output_dir.join("about-team.html")).expect("read");
        assert!(team.contains("href=\"/about/team/\""));
        assert!(team.contains("src=\"/wp-content/a.png\""));

        let manifest: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(options.output_dir.join(MANIFEST_FILE_NAME)).expect("manifest"),
        )
        .expect("json");
        assert_eq!(manifest["pages"].as_array().map(Vec::len), Some(3));
        assert_eq!(manifest["failures"].as_array().map(Vec::len), Some(1));
        assert_eq!(manifest["site_url"], "https://example.org");
    }

    #[test]
    fn front_page_uses_site_root_and_empty_slug_uses_id() {
        let fixture = Fixture::new();
        let home = fixture.post("Home", "home", "page", "publish");
        let untitled = fixture.post("Untitled", "", "page", "publish");
        fixture.option("show_on_front", "page");
        fixture.option("page_on_front", &home.to_string());
        let options = options(&fixture);
        let mut fetcher = MockFetcher::new(&[]);

        let report =
            export_static_pages_with_fetcher(&fixture.store, "https://example.org/", &options, &mut fetcher)
                .expect("export");
        let by_id = report
            .pages
            .iter()
            .map(|page| (page.id, page))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(by_id[&home].url, "https://example.org/");
        assert_eq!(by_id[&home].file, "home.html");
        assert_eq!(by_id[&untitled].file, format!("page-{untitled}.html"));
    }

    #[test]
    fn archive_contains_pages_and_manifest() {
        let fixture = Fixture::new();
        fixture.post("Home", "home", "page", "publish");
        fixture.post("About", "about", "page", "publish");
        let mut options = options(&fixture);
        options.archive = true;
        let mut fetcher = MockFetcher::new(&[]);

        let report = export_static_pages_with_fetcher(&fixture.store, SITE, &options, &mut fetcher)
            .expect("export");
        let archive_path = options.output_dir.with_extension("zip");
        assert!(report.archive_path.is_some());
        let archive =
            zip::ZipArchive::new(File::open(&archive_path).expect("open zip")).expect("read zip");
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn relativize_handles_scheme_variants_and_host_boundaries() {
        let html = concat!(
            "<a href=\"https://example.org/about/\">a</a>",
            "<a href=\"http://example.org\">b</a>",
            "<img src=\"//example.org/img.png\">",
            "<script>var u = \"https:\\/\\/example.org\\/wp-json\\/\";</script>",
            "<a href=\"https://example.org.evil.test/\">c</a>",
            "<a href=\"https://cdn.example.org/x.js\">d</a>"
        );
        let out = relativize_urls(html, "https://example.org");
        assert!(out.contains("href=\"/about/\""));
        assert!(out.contains("href=\"/\""));
        assert!(out.contains("src=\"/img.png\""));
        assert!(out.contains("\"\\/wp-json\\/\""));
        assert!(out.contains("https://example.org.evil.test/"));
        assert!(out.contains("https://cdn.example.org/x.js"));
    }

    #[test]
    fn site_url_falls_back_to_home_option() {
        let fixture = Fixture::new();
        let config = MaintConfig::default();
        let err = resolve_site_url(&config, &fixture.store).expect_err("unknown");
        assert!(err.to_string().contains("site URL unknown"));
        fixture.option("home", "https://example.org/");
        assert_eq!(
            resolve_site_url(&config, &fixture.store).expect("home"),
            "https://example.org"
        );
    }

    #[test]
    fn colliding_names_get_id_suffix() {
        let mut used = BTreeSet::new();
        assert_eq!(unique_file_name("a-b.html", 1, &mut used), "a-b.html");
        assert_eq!(unique_file_name("a-b.html", 7, &mut used), "a-b-7.html");
        used.insert("c-3.html".to_string());
        assert_eq!(unique_file_name("c.html", 9, &mut used), "c.html");
        assert_eq!(unique_file_name("c.html", 3, &mut used), "c-3-2.html");
    }

    #[test]
    fn double_collision_keeps_every_page_on_disk() {
        let fixture = Fixture::new();
        fixture.option("permalink_structure", "/%postname%/");
        fixture.post("Team four", "about-team-4", "page", "publish");
        fixture.post("About team", "about-team", "page", "publish");
        let about = fixture.post("About", "about", "page", "publish");
        fixture.child_post("Team", "team", "page", "publish", about);
        let options = options(&fixture);
        let mut fetcher = MockFetcher::new(&[]);

        let report = export_static_pages_with_fetcher(&fixture.store, SITE, &options, &mut fetcher)
            .expect("export");

        let files = report
            .pages
            .iter()
            .map(|page| page.file.clone())
            .collect::<BTreeSet<_>>();
        assert_eq!(report.pages.len(), 4);
        assert_eq!(files.len(), 4);
        assert!(files.contains("about-team-4-2.html"));
        let on_disk = fs::read_dir(&options.output_dir)
            .expect("read output")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "html"))
            .count();
        assert_eq!(on_disk, 4);
    }

    #[test]
    fn plain_permalinks_use_query_urls() {
        let fixture = Fixture::new();
        let about = fixture.post("About", "about", "page", "publish");
        let news = fixture.post("News", "news", "post", "publish");
        let event = fixture.post("Launch", "launch", "event", "publish");
        let mut options = options(&fixture);
        options.post_types = vec!["page".to_string(), "post".to_string(), "event".to_string()];
        let mut fetcher = MockFetcher::new(&[]);

        export_static_pages_with_fetcher(&fixture.store, SITE, &options, &mut fetcher)
            .expect("export");

        assert_eq!(
            fetcher.requested,
            vec![
                format!("https://example.org/?page_id={about}"),
                format!("https://example.org/?p={news}"),
                format!("https://example.org/?post_type=event&p={event}"),
            ]
        );
    }

    #[test]
    fn post_urls_follow_date_based_structure() {
        let fixture = Fixture::new();
        fixture.option("permalink_structure", "/%year%/%monthnum%/%day%/%postname%/");
        let news = fixture.post("News", "news", "post", "publish");
        fixture.post_date(news, "2023-07-09 14:30:00");
        let tagged = fixture.post("Tagged", "tagged", "post", "publish");
        let about = fixture.post("About", "about", "page", "publish");
        let mut options = options(&fixture);
        options.post_types = vec!["page".to_string(), "post".to_string()];
        let mut fetcher = MockFetcher::new(&[]);

        export_static_pages_with_fetcher(&fixture.store, SITE, &options, &mut fetcher)
            .expect("export");
        assert_eq!(
            fetcher.requested,
            vec![
                "https://example.org/2023/07/09/news/".to_string(),
                "https://example.org/2024/01/01/tagged/".to_string(),
                "https://example.org/about/".to_string(),
            ]
        );

        let item = fixture.store.get_content(about).expect("read").expect("page");
        assert_eq!(
            item_url(SITE, &item, "about", "/%category%/%postname%/"),
            "https://example.org/about/"
        );
        let post = fixture.store.get_content(tagged).expect("read").expect("post");
        assert_eq!(
            item_url(SITE, &post, "tagged", "/%category%/%postname%/"),
            format!("https://example.org/?p={tagged}")
        );
    }
}
