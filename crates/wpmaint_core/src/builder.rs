use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::MaintConfig;
use crate::runtime::normalize_for_display;
use crate::store::SiteStore;

pub const EDIT_MODE_META: &str = "_elementor_edit_mode";
pub const VERSION_META: &str = "_elementor_version";
pub const LAYOUT_DATA_META: &str = "_elementor_data";
pub const VERSION_OPTION: &str = "elementor_version";
pub const BUILDER_MODE: &str = "builder";

/// Which cache artifacts count as regenerable and where the generated CSS lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub meta_keys: Vec<String>,
    pub option_keys: Vec<String>,
    pub css_dir: PathBuf,
}

impl CacheSettings {
    pub fn from_config(config: &MaintConfig, uploads_dir: &Path) -> Self {
        Self {
            meta_keys: config.cache_meta_keys(),
            option_keys: config.cache_option_keys(),
            css_dir: uploads_dir.join(config.css_subdir()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Post(i64),
}

impl CacheScope {
    pub fn label(self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Post(id) => format!("post {id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuilderItem {
    pub id: i64,
    pub title: String,
    pub post_type: String,
    pub status: String,
    pub mode: String,
    pub version: Option<String>,
    pub has_layout_data: bool,
    pub has_css_cache: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CacheClearReport {
    pub scope: String,
    pub meta_rows_deleted: usize,
    pub options_deleted: Vec<String>,
    pub css_files_removed: Vec<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkReport {
    pub post_id: i64,
    pub title: String,
    pub previous_mode: Option<String>,
    pub version: String,
    pub cache: CacheClearReport,
}

pub fn builder_status(store: &SiteStore, settings: &CacheSettings) -> Result<Vec<BuilderItem>> {
    let mut items = Vec::new();
    for id in store.posts_with_meta(EDIT_MODE_META)? {
        let Some(content) = store.get_content(id)? else {
            debug!(post_id = id, "skipping orphaned builder meta");
            continue;
        };
        items.push(BuilderItem {
            id,
            title: content.title,
            post_type: content.post_type,
            status: content.status,
            mode: store.get_meta(id, EDIT_MODE_META)?.unwrap_or_default(),
            version: store.get_meta(id, VERSION_META)?,
            has_layout_data: store
                .get_meta(id, LAYOUT_DATA_META)?
                .is_some_and(|data| !data.trim().is_empty()),
            has_css_cache: store.count_meta_rows(&settings.meta_keys, Some(id))? > 0,
        });
    }
    Ok(items)
}

/// Delete cached builder artifacts for `scope` and confirm none of the cache
/// meta keys survive. Other meta keys are never touched.
pub fn clear_cache(
    store: &SiteStore,
    settings: &CacheSettings,
    scope: CacheScope,
) -> Result<CacheClearReport> {
    let mut report = CacheClearReport {
        scope: scope.label(),
        ..CacheClearReport::default()
    };

    match scope {
        CacheScope::All => {
            report.meta_rows_deleted = store.delete_meta_everywhere(&settings.meta_keys)?;
            for key in &settings.option_keys {
                if store.delete_option(key)? {
                    report.options_deleted.push(key.clone());
                }
            }
            remove_css_files(&settings.css_dir, &mut report);
        }
        CacheScope::Post(post_id) => {
            if store.get_content(post_id)?.is_none() {
                bail!("content item {post_id} not found");
            }
            report.meta_rows_deleted = store.delete_meta(post_id, &settings.meta_keys)?;
            let css_file = settings.css_dir.join(format!("post-{post_id}.css"));
            if css_file.is_file() {
                remove_css_file(&css_file, &mut report);
            }
        }
    }

    let post_id = match scope {
        CacheScope::All => None,
        CacheScope::Post(id) => Some(id),
    };
    let remaining = store.count_meta_rows(&settings.meta_keys, post_id)?;
    if remaining > 0 {
        bail!("verification failed: {remaining} cache meta rows remain");
    }
    if scope == CacheScope::All {
        for key in &settings.option_keys {
            if store.get_option(key)?.is_some() {
                bail!("verification failed: option {key} still present");
            }
        }
    }
    info!(
        scope = %report.scope,
        meta_rows = report.meta_rows_deleted,
        css_files = report.css_files_removed.len(),
        "builder cache cleared"
    );
    Ok(report)
}

/// Flag an item as builder-managed, stamp the builder version, and drop its cache.
pub fn mark_builder(
    store: &SiteStore,
    settings: &CacheSettings,
    post_id: i64,
    version: Option<&str>,
) -> Result<MarkReport> {
    let Some(item) = store.get_content(post_id)? else {
        bail!("content item {post_id} not found");
    };
    let version = match version.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None => match store.get_option(VERSION_OPTION)? {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => bail!("no builder version given and option {VERSION_OPTION} is not set"),
        },
    };

    let previous_mode = store.get_meta(post_id, EDIT_MODE_META)?;
    store.set_meta(post_id, EDIT_MODE_META, BUILDER_MODE)?;
    store.set_meta(post_id, VERSION_META, &version)?;
    if store.get_meta(post_id, EDIT_MODE_META)?.as_deref() != Some(BUILDER_MODE)
        || store.get_meta(post_id, VERSION_META)?.as_deref() != Some(version.as_str())
    {
        bail!("verification failed: builder meta for item {post_id} did not persist");
    }

    let cache = clear_cache(store, settings, CacheScope::Post(post_id))?;
    Ok(MarkReport {
        post_id,
        title: item.title,
        previous_mode,
        version,
        cache,
    })
}

fn remove_css_files(css_dir: &Path, report: &mut CacheClearReport) {
    if !css_dir.exists() {
        debug!(dir = %css_dir.display(), "no generated css directory");
        return;
    }
    for entry in WalkDir::new(css_dir) {
        match entry {
            Ok(entry)
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "css") =>
            {
                remove_css_file(entry.path(), report);
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "failed to walk css directory");
                report.failures.push(error.to_string());
            }
        }
    }
}

fn remove_css_file(path: &Path, report: &mut CacheClearReport) {
    match fs::remove_file(path) {
        Ok(()) => report.css_files_removed.push(normalize_for_display(path)),
        Err(error) => {
            warn!(file = %path.display(), %error, "failed to remove css file");
            report
                .failures
                .push(format!("{}: {error}", normalize_for_display(path)));
        }
    }
}
