use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::MaintConfig;

pub const STATE_DIR_NAME: &str = ".wpmaint";
pub const DEFAULT_DB_RELATIVE_PATH: &str = "wp-content/database/.ht.sqlite";
pub const DEFAULT_UPLOADS_RELATIVE_PATH: &str = "wp-content/uploads";
pub const DEFAULT_PLUGINS_RELATIVE_PATH: &str = "wp-content/plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: env::current_dir().context("cannot determine working directory")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub uploads_dir: PathBuf,
    pub plugins_dir: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
    pub db_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub wp_config_exists: bool,
    pub state_dir_exists: bool,
    pub config_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub uploads_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})\ndb_path={} ({})\nuploads_dir={}\nplugins_dir={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.db_path),
            self.db_source.as_str(),
            normalize_for_display(&self.uploads_dir),
            normalize_for_display(&self.plugins_dir),
        )
    }

    /// Adopt `[site]` paths from the config file where no flag or env value won.
    pub fn apply_config(&mut self, config: &MaintConfig) {
        if self.db_source == ValueSource::Default
            && let Some(db_path) = config.site.db_path.as_deref()
            && !db_path.trim().is_empty()
        {
            self.db_path = absolutize(Path::new(db_path.trim()), &self.project_root);
            self.db_source = ValueSource::Config;
        }
        if let Some(uploads) = config.site.uploads_dir.as_deref()
            && !uploads.trim().is_empty()
        {
            self.uploads_dir = absolutize(Path::new(uploads.trim()), &self.project_root);
        }
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let wp_config_exists = paths.project_root.join("wp-config.php").exists();
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();
    let uploads_exists = paths.uploads_dir.exists();
    let db_exists = paths.db_path.is_file();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !wp_config_exists {
        warnings.push(
            "wp-config.php not found; project root may not be a WordPress install".to_string(),
        );
    }
    if !db_exists {
        warnings.push(format!(
            "database not found at {}; store commands will fail",
            normalize_for_display(&paths.db_path)
        ));
    }
    if !state_dir_exists {
        warnings.push(".wpmaint/ is missing; run `wpmaint init` to create it".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists,
        wp_config_exists,
        state_dir_exists,
        config_exists,
        db_exists,
        db_size_bytes,
        uploads_exists,
        warnings,
    })
}

pub fn ensure_store_available(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.db_exists {
        bail!(
            "database not found: {}\nSet --db, WPMAINT_DB_PATH or [site].db_path in {}",
            normalize_for_display(&paths.db_path),
            normalize_for_display(&paths.config_path)
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub(crate) fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);

    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("WPMAINT_CONFIG")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    let (db_path, db_source) = if let Some(path) = overrides.db_path.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("WPMAINT_DB_PATH")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (
            project_root.join(DEFAULT_DB_RELATIVE_PATH),
            ValueSource::Default,
        )
    };

    Ok(ResolvedPaths {
        backups_dir: state_dir.join("backups"),
        exports_dir: state_dir.join("exports"),
        uploads_dir: project_root.join(DEFAULT_UPLOADS_RELATIVE_PATH),
        plugins_dir: project_root.join(DEFAULT_PLUGINS_RELATIVE_PATH),
        state_dir,
        config_path,
        db_path,
        project_root,
        root_source,
        config_source,
        db_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut report = InitReport {
        created_dirs: Vec::new(),
        wrote_config: false,
    };
    for dir in [&paths.state_dir, &paths.backups_dir, &paths.exports_dir] {
        if dir.is_dir() {
            continue;
        }
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        report.created_dirs.push(dir.clone());
    }

    if options.force || !paths.config_path.exists() {
        if let Some(parent) = paths.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        fs::write(&paths.config_path, render_materialized_config(paths))
            .with_context(|| format!("cannot write {}", paths.config_path.display()))?;
        report.wrote_config = true;
    }
    Ok(report)
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let db_path = normalize_for_display(&paths.db_path);
    format!(
        "# wpmaint configuration (materialized by `wpmaint init`)\n\n[site]\n# url = \"https://example.org\"\ntable_prefix = \"wp_\"\ndb_path = \"{db_path}\"\n# uploads_dir = \"wp-content/uploads\"\n\n[builder]\n# meta_keys = [\"_elementor_css\", \"_elementor_element_cache\", \"_elementor_page_assets\"]\n# option_keys = [\"_elementor_global_css\", \"elementor-custom-breakpoints-files\"]\n# css_subdir = \"elementor/css\"\n\n[importer]\n# wp_cli = \"wp\"\nfetch_attachments = false\ncreate_users = false\n\n[export]\npost_types = [\"page\"]\n# output_dir = \".wpmaint/exports/static\"\n# timeout_ms = 30000\n\n# [[rewrite.rules]]\n# from = \"http://localhost:8080\"\n# to = \"https://example.org\"\n"
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = non_empty(lookup_env("WPMAINT_PROJECT_ROOT")) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    // Nearest ancestor that looks like a WordPress install, else the cwd itself.
    let root = context
        .cwd
        .ancestors()
        .find(|dir| dir.join("wp-config.php").is_file() || dir.join("wp-content").is_dir())
        .unwrap_or(context.cwd.as_path())
        .to_path_buf();
    (root, ValueSource::Heuristic)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
pub(crate) fn test_paths(project_root: &Path) -> ResolvedPaths {
    let state_dir = project_root.join(STATE_DIR_NAME);
    ResolvedPaths {
        backups_dir: state_dir.join("backups"),
        exports_dir: state_dir.join("exports"),
        config_path: state_dir.join("config.toml"),
        db_path: project_root.join(DEFAULT_DB_RELATIVE_PATH),
        uploads_dir: project_root.join(DEFAULT_UPLOADS_RELATIVE_PATH),
        plugins_dir: project_root.join(DEFAULT_PLUGINS_RELATIVE_PATH),
        state_dir,
        project_root: project_root.to_path_buf(),
        root_source: ValueSource::Flag,
        config_source: ValueSource::Default,
        db_source: ValueSource::Default,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, ensure_store_available,
        init_layout, inspect_runtime, resolve_paths_with_lookup,
    };
    use crate::config::MaintConfig;

    #[test]
    fn project_root_flag_wins_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd: cwd.clone() };
        let env = HashMap::from([(
            "WPMAINT_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
    }

    #[test]
    fn heuristic_finds_wordpress_root_above_cwd() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("site");
        let nested = root.join("wp-content").join("themes").join("child");
        fs::create_dir_all(&nested).expect("create nested");
        fs::write(root.join("wp-config.php"), "<?php\n").expect("write wp-config");

        let context = ResolutionContext { cwd: nested };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
        assert!(resolved.db_path.ends_with("wp-content/database/.ht.sqlite"));
    }

    #[test]
    fn db_path_env_beats_default_and_config_fills_default() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("site");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };

        let env = HashMap::from([("WPMAINT_DB_PATH".to_string(), "db/site.sqlite".to_string())]);
        let from_env = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve");
        assert_eq!(from_env.db_path, root.join("db/site.sqlite"));
        assert_eq!(from_env.db_source, ValueSource::Env);

        let mut config = MaintConfig::default();
        config.site.db_path = Some("data/other.sqlite".to_string());

        let mut env_wins = from_env.clone();
        env_wins.apply_config(&config);
        assert_eq!(env_wins.db_path, root.join("db/site.sqlite"));

        let mut defaulted =
            resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        defaulted.apply_config(&config);
        assert_eq!(defaulted.db_path, root.join("data/other.sqlite"));
        assert_eq!(defaulted.db_source, ValueSource::Config);
    }

    #[test]
    fn init_layout_creates_state_dirs_and_config_once() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("site");
        fs::create_dir_all(&root).expect("create root");
        let paths = super::test_paths(&root);

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert_eq!(report.created_dirs.len(), 3);
        assert!(report.wrote_config);
        assert!(paths.backups_dir.exists());
        assert!(paths.exports_dir.exists());

        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
    }

    #[test]
    fn missing_database_is_reported_and_blocks_store_commands() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("site");
        fs::create_dir_all(&root).expect("create root");
        let paths = super::test_paths(&root);

        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.db_exists);
        assert!(
            status
                .warnings
                .iter()
                .any(|warning| warning.contains("database not found"))
        );
        let err = ensure_store_available(&paths, &status).expect_err("must fail");
        assert!(err.to_string().contains("database not found"));
    }
}
