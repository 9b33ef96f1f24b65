use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TABLE_PREFIX: &str = "wp_";
pub const DEFAULT_USER_AGENT: &str = "wpmaint/0.1";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WP_CLI: &str = "wp";
pub const DEFAULT_CSS_SUBDIR: &str = "elementor/css";
pub const DEFAULT_CACHE_META_KEYS: &[&str] = &[
    "_elementor_css",
    "_elementor_element_cache",
    "_elementor_page_assets",
];
pub const DEFAULT_CACHE_OPTION_KEYS: &[&str] =
    &["_elementor_global_css", "elementor-custom-breakpoints-files"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MaintConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub builder: BuilderSection,
    #[serde(default)]
    pub importer: ImporterSection,
    #[serde(default)]
    pub export: ExportSection,
    #[serde(default)]
    pub rewrite: RewriteSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub table_prefix: Option<String>,
    pub db_path: Option<String>,
    pub uploads_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BuilderSection {
    pub meta_keys: Option<Vec<String>>,
    pub option_keys: Option<Vec<String>>,
    pub css_subdir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImporterSection {
    pub wp_cli: Option<String>,
    #[serde(default)]
    pub fetch_attachments: bool,
    #[serde(default)]
    pub create_users: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExportSection {
    pub output_dir: Option<String>,
    #[serde(default)]
    pub post_types: Vec<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RewriteSection {
    #[serde(default)]
    pub rules: Vec<RewriteRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

impl MaintConfig {
    /// Public site URL: env WPMAINT_SITE_URL > config > None (callers fall back to the `home` option).
    pub fn site_url(&self) -> Option<String> {
        env_override("WPMAINT_SITE_URL")
            .or_else(|| self.site.url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    pub fn table_prefix(&self) -> String {
        env_override("WPMAINT_TABLE_PREFIX")
            .or_else(|| self.site.table_prefix.clone())
            .unwrap_or_else(|| DEFAULT_TABLE_PREFIX.to_string())
    }

    pub fn user_agent(&self) -> String {
        env_override("WPMAINT_USER_AGENT")
            .or_else(|| self.export.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn http_timeout_ms(&self) -> u64 {
        env_override("WPMAINT_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.export.timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
    }

    pub fn wp_cli(&self) -> String {
        env_override("WPMAINT_WP_CLI")
            .or_else(|| self.importer.wp_cli.clone())
            .unwrap_or_else(|| DEFAULT_WP_CLI.to_string())
    }

    pub fn export_post_types(&self) -> Vec<String> {
        if self.export.post_types.is_empty() {
            vec!["page".to_string()]
        } else {
            self.export.post_types.clone()
        }
    }

    pub fn cache_meta_keys(&self) -> Vec<String> {
        self.builder.meta_keys.clone().unwrap_or_else(|| {
            DEFAULT_CACHE_META_KEYS
                .iter()
                .map(|key| (*key).to_string())
                .collect()
        })
    }

    pub fn cache_option_keys(&self) -> Vec<String> {
        self.builder.option_keys.clone().unwrap_or_else(|| {
            DEFAULT_CACHE_OPTION_KEYS
                .iter()
                .map(|key| (*key).to_string())
                .collect()
        })
    }

    pub fn css_subdir(&self) -> &str {
        self.builder
            .css_subdir
            .as_deref()
            .unwrap_or(DEFAULT_CSS_SUBDIR)
    }

    pub fn rewrite_rules(&self) -> &[RewriteRule] {
        &self.rewrite.rules
    }
}

/// Load and parse a MaintConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MaintConfig> {
    if !config_path.exists() {
        return Ok(MaintConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MaintConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, MaintConfig::default());
        assert_eq!(config.export_post_types(), vec!["page".to_string()]);
        assert_eq!(config.css_subdir(), "elementor/css");
        assert_eq!(config.cache_meta_keys().len(), 3);
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[site]
url = "https://example.org/"
table_prefix = "site_"
db_path = "db/.ht.sqlite"

[builder]
meta_keys = ["_custom_css"]

[importer]
wp_cli = "/usr/local/bin/wp"
fetch_attachments = true

[export]
post_types = ["page", "post"]
timeout_ms = 5000

[[rewrite.rules]]
from = "http://localhost:8080"
to = "https://example.org"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.site.url.as_deref(), Some("https://example.org/"));
        assert_eq!(config.site.db_path.as_deref(), Some("db/.ht.sqlite"));
        assert_eq!(config.cache_meta_keys(), vec!["_custom_css".to_string()]);
        assert_eq!(config.cache_option_keys().len(), 2);
        assert!(config.importer.fetch_attachments);
        assert!(!config.importer.create_users);
        assert_eq!(config.export_post_types().len(), 2);
        assert_eq!(config.export.timeout_ms, Some(5000));
        assert_eq!(config.rewrite_rules().len(), 1);
        assert_eq!(config.rewrite_rules()[0].to, "https://example.org");
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[site\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
