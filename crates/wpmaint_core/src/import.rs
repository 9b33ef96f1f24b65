use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, warn};

use crate::plugins::list_active_plugins;
use crate::runtime::normalize_for_display;
use crate::store::SiteStore;

pub const IMPORTER_PLUGIN: &str = "wordpress-importer/wordpress-importer.php";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub fetch_attachments: bool,
    pub create_users: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportOutcome {
    pub success: bool,
    pub message: String,
}

/// A content importer that consumes a WXR export file.
pub trait Importer {
    fn name(&self) -> String;
    fn import(&mut self, file: &Path, options: &ImportOptions) -> Result<ImportOutcome>;
}

/// Runs `wp import` from WP-CLI against the site root.
pub struct WpCliImporter {
    binary: PathBuf,
    site_root: PathBuf,
}

impl WpCliImporter {
    pub fn new(binary: PathBuf, site_root: PathBuf) -> Self {
        Self { binary, site_root }
    }

    /// Resolve `wp_cli` as an explicit path, or search PATH for a bare command name.
    pub fn locate(wp_cli: &str, site_root: &Path) -> Result<Self> {
        let binary = find_executable(wp_cli).ok_or_else(|| {
            anyhow::anyhow!(
                "WP-CLI executable `{wp_cli}` not found (set [importer].wp_cli or WPMAINT_WP_CLI)"
            )
        })?;
        Ok(Self::new(binary, site_root.to_path_buf()))
    }

    pub fn command_args(&self, file: &Path, options: &ImportOptions) -> Vec<String> {
        let mut args = vec![
            "import".to_string(),
            file.to_string_lossy().to_string(),
            format!(
                "--authors={}",
                if options.create_users { "create" } else { "skip" }
            ),
        ];
        if !options.fetch_attachments {
            args.push("--skip=attachment".to_string());
        }
        args.push(format!("--path={}", self.site_root.to_string_lossy()));
        args
    }
}

impl Importer for WpCliImporter {
    fn name(&self) -> String {
        format!("wp-cli ({})", normalize_for_display(&self.binary))
    }

    fn import(&mut self, file: &Path, options: &ImportOptions) -> Result<ImportOutcome> {
        let args = self.command_args(file, options);
        debug!(binary = %self.binary.display(), ?args, "running importer");
        let output = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.site_root)
            .output()
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let success = output.status.success();
        let message = last_meaningful_line(if success { &stdout } else { &stderr })
            .or_else(|| last_meaningful_line(&stdout))
            .unwrap_or_else(|| format!("exit status {}", output.status.code().unwrap_or(1)));
        Ok(ImportOutcome { success, message })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub file: String,
    pub importer: String,
    pub fetch_attachments: bool,
    pub create_users: bool,
    pub message: String,
    pub counts_before: BTreeMap<String, usize>,
    pub counts_after: BTreeMap<String, usize>,
    pub delta: BTreeMap<String, i64>,
}

/// Check prerequisites, hand `file` to `importer`, and report per-type content
/// counts before and after.
pub fn run_import(
    store: Option<&SiteStore>,
    plugins_dir: &Path,
    importer: &mut dyn Importer,
    file: &Path,
    options: &ImportOptions,
) -> Result<ImportReport> {
    if !file.is_file() {
        bail!("import file not found: {}", file.display());
    }
    if !plugins_dir.join(IMPORTER_PLUGIN).is_file() {
        bail!(
            "importer plugin not installed: {}",
            normalize_for_display(&plugins_dir.join(IMPORTER_PLUGIN))
        );
    }
    if let Some(store) = store
        && !list_active_plugins(store)?.iter().any(|plugin| plugin == IMPORTER_PLUGIN)
    {
        warn!("{IMPORTER_PLUGIN} is installed but not active; the importer may refuse to run");
    }

    let counts_before = match store {
        Some(store) => store.count_content_by_type()?,
        None => BTreeMap::new(),
    };
    let outcome = importer.import(file, options)?;
    if !outcome.success {
        bail!("importer failed: {}", outcome.message);
    }
    let counts_after = match store {
        Some(store) => store.count_content_by_type()?,
        None => BTreeMap::new(),
    };

    Ok(ImportReport {
        file: normalize_for_display(file),
        importer: importer.name(),
        fetch_attachments: options.fetch_attachments,
        create_users: options.create_users,
        message: outcome.message,
        delta: count_delta(&counts_before, &counts_after),
        counts_before,
        counts_after,
    })
}

fn count_delta(
    before: &BTreeMap<String, usize>,
    after: &BTreeMap<String, usize>,
) -> BTreeMap<String, i64> {
    let keys = before.keys().chain(after.keys()).collect::<BTreeSet<_>>();
    keys.into_iter()
        .filter_map(|key| {
            let old = before.get(key).copied().unwrap_or(0) as i64;
            let new = after.get(key).copied().unwrap_or(0) as i64;
            (old != new).then(|| (key.clone(), new - old))
        })
        .collect()
}

fn last_meaningful_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(ToString::to_string)
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(name.trim());
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then_some(candidate);
    }
    let path_var = env::var_os("PATH")?;
    let names = if cfg!(windows) {
        vec![format!("{name}.bat"), format!("{name}.exe"), name.to_string()]
    } else {
        vec![name.to_string()]
    };
    env::split_paths(&path_var)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::plugins::ACTIVE_PLUGINS_OPTION;
    use crate::store::fixtures::Fixture;

    /// Inserts pages into the fixture database to stand in for a real import.
    struct MockImporter<'a> {
        fixture: &'a Fixture,
        pages: usize,
        fail_with: Option<String>,
        calls: Vec<ImportOptions>,
    }

    impl Importer for MockImporter<'_> {
        fn name(&self) -> String {
            "mock".to_string()
        }

        fn import(&mut self, _file: &Path, options: &ImportOptions) -> Result<ImportOutcome> {
            self.calls.push(*options);
            if let Some(message) = &self.fail_with {
                return Ok(ImportOutcome {
                    success: false,
                    message: message.clone(),
                });
            }
            for index in 0..self.pages {
                self.fixture
                    .post(&format!("Imported {index}"), &format!("imported-{index}"), "page", "publish");
            }
            Ok(ImportOutcome {
                success: true,
                message: "Success: Finished importing from 'export.xml' file.".to_string(),
            })
        }
    }

    fn prepared_fixture() -> (Fixture, PathBuf) {
        let fixture = Fixture::new();
        let plugin = fixture.paths.plugins_dir.join(IMPORTER_PLUGIN);
        fs::create_dir_all(plugin.parent().expect("parent")).expect("plugin dir");
        fs::write(&plugin, "<?php\n").expect("plugin file");
        fixture.option(
            ACTIVE_PLUGINS_OPTION,
            "a:1:{i:0;s:41:\"wordpress-importer/wordpress-importer.php\";}",
        );
        let export = fixture.paths.project_root.join("export.xml");
        fs::write(&export, "<rss></rss>").expect("export file");
        (fixture, export)
    }

    #[test]
    fn import_reports_content_delta_and_passes_flags() {
        let (fixture, export) = prepared_fixture();
        fixture.post("Existing", "existing", "page", "publish");
        let mut importer = MockImporter {
            fixture: &fixture,
            pages: 2,
            fail_with: None,
            calls: Vec::new(),
        };
        let options = ImportOptions {
            fetch_attachments: true,
            create_users: false,
        };
        let report = run_import(
            Some(&fixture.store),
            &fixture.paths.plugins_dir,
            &mut importer,
            &export,
            &options,
        )
        .expect("import");

        assert_eq!(report.counts_before.get("page"), Some(&1));
        assert_eq!(report.counts_after.get("page"), Some(&3));
        assert_eq!(report.delta.get("page"), Some(&2));
        assert!(report.message.starts_with("Success"));
        assert_eq!(importer.calls, vec![options]);
    }

    #[test]
    fn importer_failure_surfaces_message() {
        let (fixture, export) = prepared_fixture();
        let mut importer = MockImporter {
            fixture: &fixture,
            pages: 0,
            fail_with: Some("Error: invalid WXR file".to_string()),
            calls: Vec::new(),
        };
        let err = run_import(
            Some(&fixture.store),
            &fixture.paths.plugins_dir,
            &mut importer,
            &export,
            &ImportOptions::default(),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("invalid WXR file"));
    }

    #[test]
    fn missing_file_or_plugin_stops_before_importing() {
        let (fixture, export) = prepared_fixture();
        let mut importer = MockImporter {
            fixture: &fixture,
            pages: 1,
            fail_with: None,
            calls: Vec::new(),
        };
        let err = run_import(
            None,
            &fixture.paths.plugins_dir,
            &mut importer,
            &fixture.paths.project_root.join("absent.xml"),
            &ImportOptions::default(),
        )
        .expect_err("missing file");
        assert!(err.to_string().contains("import file not found"));

        let err = run_import(
            None,
            &fixture.paths.project_root.join("no-plugins"),
            &mut importer,
            &export,
            &ImportOptions::default(),
        )
        .expect_err("missing plugin");
        assert!(err.to_string().contains("importer plugin not installed"));
        assert!(importer.calls.is_empty());
    }

    #[test]
    fn wp_cli_arguments_follow_options() {
        let importer = WpCliImporter::new(PathBuf::from("/usr/bin/wp"), PathBuf::from("/srv/site"));
        let args = importer.command_args(Path::new("/tmp/export.xml"), &ImportOptions::default());
        assert_eq!(
            args,
            vec![
                "import",
                "/tmp/export.xml",
                "--authors=skip",
                "--skip=attachment",
                "--path=/srv/site"
            ]
        );
        let args = importer.command_args(
            Path::new("/tmp/export.xml"),
            &ImportOptions {
                fetch_attachments: true,
                create_users: true,
            },
        );
        assert!(args.contains(&"--authors=create".to_string()));
        assert!(!args.iter().any(|arg| arg.starts_with("--skip")));
    }

    #[test]
    fn locate_rejects_missing_explicit_path() {
        let err = WpCliImporter::locate("/definitely/not/here/wp", Path::new("/srv/site"))
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("not found"));
    }
}
