use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use wpmaint_core::builder::{
    CacheClearReport, CacheScope, CacheSettings, builder_status, clear_cache, mark_builder,
};
use wpmaint_core::config::{MaintConfig, load_config};
use wpmaint_core::export::{StaticExportOptions, export_static_pages};
use wpmaint_core::import::{ImportOptions, WpCliImporter, run_import};
use wpmaint_core::menus::list_menus;
use wpmaint_core::phpser;
use wpmaint_core::plugins::{
    PluginChangeReport, activate_plugins, deactivate_plugins, list_active_plugins,
};
use wpmaint_core::rewrite::{RewriteMap, RewriteOptions, rewrite_export_file};
use wpmaint_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_store_available,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wpmaint_core::store::{ContentFilter, SiteStore};

#[derive(Debug, Parser)]
#[command(
    name = "wpmaint",
    version,
    about = "Maintenance commands for a single WordPress installation"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "SQLite database file")]
    db: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Debug logging on stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            db: cli.db.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Plugins(PluginsArgs),
    Option(OptionArgs),
    Content(ContentArgs),
    Menus(MenusArgs),
    Rewrite(RewriteArgs),
    Import(ImportArgs),
    Builder(BuilderArgs),
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing .wpmaint/config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct PluginsArgs {
    #[command(subcommand)]
    command: PluginsSubcommand,
}

#[derive(Debug, Subcommand)]
enum PluginsSubcommand {
    List,
    Activate {
        #[arg(required = true, value_name = "FOLDER/FILE.php")]
        plugins: Vec<String>,
    },
    Deactivate {
        #[arg(required = true, value_name = "FOLDER/FILE.php")]
        plugins: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct OptionArgs {
    #[command(subcommand)]
    command: OptionSubcommand,
}

#[derive(Debug, Subcommand)]
enum OptionSubcommand {
    Get { name: String },
    Set { name: String, value: String },
}

#[derive(Debug, Args)]
struct ContentArgs {
    #[command(subcommand)]
    command: ContentSubcommand,
}

#[derive(Debug, Subcommand)]
enum ContentSubcommand {
    List {
        #[arg(long = "type", value_name = "POST_TYPE", help = "Filter by post type")]
        post_types: Vec<String>,
        #[arg(long = "status", value_name = "STATUS", help = "Filter by status")]
        statuses: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct MenusArgs {
    #[command(subcommand)]
    command: MenusSubcommand,
}

#[derive(Debug, Subcommand)]
enum MenusSubcommand {
    List,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    file: PathBuf,
    #[arg(
        long = "map",
        value_name = "FROM=TO",
        help = "Rewrite rule (repeatable); added to [[rewrite.rules]]"
    )]
    pairs: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Write to PATH instead of in place")]
    output: Option<PathBuf>,
    #[arg(long, help = "Show a diff without writing")]
    dry_run: bool,
    #[arg(long, help = "Skip the backup copy under .wpmaint/backups/")]
    no_backup: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    file: PathBuf,
    #[arg(long, help = "Download and import attachments")]
    fetch_attachments: bool,
    #[arg(long, help = "Create missing authors as users")]
    create_users: bool,
}

#[derive(Debug, Args)]
struct BuilderArgs {
    #[command(subcommand)]
    command: BuilderSubcommand,
}

#[derive(Debug, Subcommand)]
enum BuilderSubcommand {
    Status,
    #[command(name = "clear-cache")]
    ClearCache {
        #[arg(long, value_name = "ID", help = "Only clear one item's cache")]
        post: Option<i64>,
    },
    Mark {
        post_id: i64,
        #[arg(long, help = "Builder version (defaults to the elementor_version option)")]
        version: Option<String>,
    },
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(subcommand)]
    command: ExportSubcommand,
}

#[derive(Debug, Subcommand)]
enum ExportSubcommand {
    Static(StaticArgs),
}

#[derive(Debug, Args)]
struct StaticArgs {
    #[arg(long, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long = "type", value_name = "POST_TYPE")]
    post_types: Vec<String>,
    #[arg(long, help = "Also write a .zip of the output directory")]
    archive: bool,
}

/// Resolved paths plus the loaded config file.
struct Runtime {
    paths: ResolvedPaths,
    config: MaintConfig,
    diagnostics: bool,
}

impl Runtime {
    fn open_store(&self) -> Result<SiteStore> {
        let status = inspect_runtime(&self.paths)?;
        ensure_store_available(&self.paths, &status)?;
        SiteStore::open(&self.paths.db_path, &self.config.table_prefix())
    }

    fn cache_settings(&self) -> CacheSettings {
        CacheSettings::from_config(&self.config, &self.paths.uploads_dir)
    }

    fn finish(&self) {
        if self.diagnostics {
            println!("\n[diagnostics]\n{}", self.paths.diagnostics());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let options = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&options, args),
        Some(Commands::Status) => run_status(&options),
        Some(Commands::Plugins(PluginsArgs { command })) => match command {
            PluginsSubcommand::List => run_plugins_list(&options),
            PluginsSubcommand::Activate { plugins } => run_plugins_change(&options, &plugins, true),
            PluginsSubcommand::Deactivate { plugins } => {
                run_plugins_change(&options, &plugins, false)
            }
        },
        Some(Commands::Option(OptionArgs { command })) => match command {
            OptionSubcommand::Get { name } => run_option_get(&options, &name),
            OptionSubcommand::Set { name, value } => run_option_set(&options, &name, &value),
        },
        Some(Commands::Content(ContentArgs { command })) => match command {
            ContentSubcommand::List {
                post_types,
                statuses,
            } => run_content_list(&options, post_types, statuses),
        },
        Some(Commands::Menus(MenusArgs { command })) => match command {
            MenusSubcommand::List => run_menus_list(&options),
        },
        Some(Commands::Rewrite(args)) => run_rewrite(&options, args),
        Some(Commands::Import(args)) => run_import_command(&options, args),
        Some(Commands::Builder(BuilderArgs { command })) => match command {
            BuilderSubcommand::Status => run_builder_status(&options),
            BuilderSubcommand::ClearCache { post } => run_builder_clear(&options, post),
            BuilderSubcommand::Mark { post_id, version } => {
                run_builder_mark(&options, post_id, version.as_deref())
            }
        },
        Some(Commands::Export(ExportArgs { command })) => match command {
            ExportSubcommand::Static(args) => run_export_static(&options, args),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "wpmaint=debug,wpmaint_core=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn run_init(options: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let runtime = load_runtime(options)?;
    let paths = &runtime.paths;
    let report = init_layout(paths, &InitOptions { force: args.force })?;

    println!("Initialized wpmaint runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("backups_dir: {}", normalize_for_display(&paths.backups_dir));
    println!("exports_dir: {}", normalize_for_display(&paths.exports_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    runtime.finish();
    Ok(())
}

fn run_status(options: &RuntimeOptions) -> Result<()> {
    let runtime = load_runtime(options)?;
    let paths = &runtime.paths;
    let status = inspect_runtime(paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("project_root_exists: {}", format_flag(status.project_root_exists));
    println!("wp_config_exists: {}", format_flag(status.wp_config_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("uploads_exists: {}", format_flag(status.uploads_exists));
    println!("table_prefix: {}", runtime.config.table_prefix());
    println!(
        "site_url: {}",
        runtime.config.site_url().as_deref().unwrap_or("<home option>")
    );
    if status.db_exists {
        let store = runtime.open_store()?;
        for (post_type, count) in store.count_content_by_type()? {
            println!("content.{post_type}: {count}");
        }
        println!("active_plugins: {}", list_active_plugins(&store)?.len());
    }
    print_warnings(&status.warnings);
    runtime.finish();
    Ok(())
}

fn run_plugins_list(options: &RuntimeOptions) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let active = list_active_plugins(&store)?;

    println!("plugins list");
    println!("active.count: {}", active.len());
    for plugin in &active {
        let installed = runtime.paths.plugins_dir.join(plugin).is_file();
        println!("active.plugin: {plugin} (file: {})", format_flag(installed));
    }
    runtime.finish();
    Ok(())
}

fn run_plugins_change(options: &RuntimeOptions, plugins: &[String], activate: bool) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let report = if activate {
        activate_plugins(&store, &runtime.paths.plugins_dir, plugins)?
    } else {
        deactivate_plugins(&store, plugins)?
    };

    println!("plugins {}", if activate { "activate" } else { "deactivate" });
    print_plugin_report(&report);
    runtime.finish();
    Ok(())
}

fn print_plugin_report(report: &PluginChangeReport) {
    for plugin in &report.added {
        println!("added: {plugin}");
    }
    for plugin in &report.removed {
        println!("removed: {plugin}");
    }
    for plugin in &report.unchanged {
        println!("unchanged: {plugin}");
    }
    for plugin in &report.missing_files {
        println!("warning.missing_file: {plugin}");
    }
    println!("wrote_option: {}", report.wrote_option);
    println!("active.count: {}", report.active.len());
    for plugin in &report.active {
        println!("active.plugin: {plugin}");
    }
}

fn run_option_get(options: &RuntimeOptions, name: &str) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let Some(raw) = store.get_option(name)? else {
        bail!("option {name} not found");
    };

    println!("option get");
    println!("name: {name}");
    println!("value: {raw}");
    if phpser::looks_serialized(&raw) {
        match phpser::parse(&raw) {
            Ok(value) => {
                println!("serialized: yes");
                println!("json:\n{}", serde_json::to_string_pretty(&value.to_json())?);
            }
            Err(error) => println!("serialized: malformed ({error})"),
        }
    } else {
        println!("serialized: no");
    }
    runtime.finish();
    Ok(())
}

fn run_option_set(options: &RuntimeOptions, name: &str, value: &str) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    if name.trim().is_empty() {
        bail!("option name cannot be empty");
    }
    if phpser::looks_serialized(value) {
        phpser::parse(value).map_err(|error| {
            anyhow::anyhow!("refusing to write malformed serialized value: {error}")
        })?;
    }
    let previous = store.get_option(name)?;
    store.set_option(name, value)?;
    let stored = store.get_option(name)?;
    if stored.as_deref() != Some(value) {
        bail!("verification failed: option {name} did not persist");
    }

    println!("option set");
    println!("name: {name}");
    println!("previous: {}", previous.as_deref().unwrap_or("<absent>"));
    println!("value: {value}");
    println!("verified: yes");
    runtime.finish();
    Ok(())
}

fn run_content_list(
    options: &RuntimeOptions,
    post_types: Vec<String>,
    statuses: Vec<String>,
) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let items = store.list_content(&ContentFilter {
        post_types,
        statuses,
    })?;

    println!("content list");
    println!("items.count: {}", items.len());
    for item in &items {
        println!(
            "item: {} [{}/{}] /{} {}",
            item.id,
            item.post_type,
            item.status,
            store.permalink_path(item)?,
            item.title
        );
    }
    runtime.finish();
    Ok(())
}

fn run_menus_list(options: &RuntimeOptions) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let menus = list_menus(&store)?;

    println!("menus list");
    println!("menus.count: {}", menus.len());
    for menu in &menus {
        let locations = if menu.locations.is_empty() {
            "<none>".to_string()
        } else {
            menu.locations.join(", ")
        };
        println!(
            "menu: {} {} ({}) items={} locations={locations}",
            menu.term_id, menu.name, menu.slug, menu.item_count
        );
    }
    runtime.finish();
    Ok(())
}

fn run_rewrite(options: &RuntimeOptions, args: RewriteArgs) -> Result<()> {
    let runtime = load_runtime(options)?;
    let mut rules = runtime.config.rewrite_rules().to_vec();
    rules.extend(RewriteMap::parse_pairs(&args.pairs)?);
    let map = RewriteMap::new(&rules)?;
    let report = rewrite_export_file(
        &runtime.paths,
        &args.file,
        &map,
        &RewriteOptions {
            output: args.output,
            dry_run: args.dry_run,
            no_backup: args.no_backup,
        },
    )?;

    println!("rewrite");
    println!("source: {}", report.source);
    println!("output: {}", report.output);
    for rule in map.rules() {
        println!("rule: {} -> {}", rule.from, rule.to);
    }
    println!("dry_run: {}", report.dry_run);
    println!("replacements: {}", report.replacements);
    println!("serialized_blocks: {}", report.serialized_blocks);
    println!("sha256_before: {}", report.sha256_before);
    println!("sha256_after: {}", report.sha256_after);
    println!(
        "backup_path: {}",
        report.backup_path.as_deref().unwrap_or("<none>")
    );
    println!("wrote: {}", report.wrote);
    if let Some(diff) = &report.diff_preview {
        println!("diff:\n{diff}");
    }
    runtime.finish();
    Ok(())
}

fn run_import_command(options: &RuntimeOptions, args: ImportArgs) -> Result<()> {
    let runtime = load_runtime(options)?;
    let status = inspect_runtime(&runtime.paths)?;
    let store = if status.db_exists {
        Some(runtime.open_store()?)
    } else {
        debug!("no database available; import will run without content counts");
        None
    };
    let mut importer = WpCliImporter::locate(&runtime.config.wp_cli(), &runtime.paths.project_root)?;
    let import_options = ImportOptions {
        fetch_attachments: args.fetch_attachments || runtime.config.importer.fetch_attachments,
        create_users: args.create_users || runtime.config.importer.create_users,
    };
    let report = run_import(
        store.as_ref(),
        &runtime.paths.plugins_dir,
        &mut importer,
        &args.file,
        &import_options,
    )?;

    println!("import");
    println!("file: {}", report.file);
    println!("importer: {}", report.importer);
    println!("fetch_attachments: {}", report.fetch_attachments);
    println!("create_users: {}", report.create_users);
    println!("message: {}", report.message);
    if report.delta.is_empty() {
        println!("delta: <none>");
    }
    for (post_type, change) in &report.delta {
        println!("delta.{post_type}: {change:+}");
    }
    runtime.finish();
    Ok(())
}

fn run_builder_status(options: &RuntimeOptions) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let items = builder_status(&store, &runtime.cache_settings())?;

    println!("builder status");
    println!("items.count: {}", items.len());
    for item in &items {
        println!(
            "item: {} [{}/{}] mode={} version={} layout={} css_cache={} {}",
            item.id,
            item.post_type,
            item.status,
            if item.mode.is_empty() { "<empty>" } else { item.mode.as_str() },
            item.version.as_deref().unwrap_or("<none>"),
            format_flag(item.has_layout_data),
            format_flag(item.has_css_cache),
            item.title
        );
    }
    runtime.finish();
    Ok(())
}

fn run_builder_clear(options: &RuntimeOptions, post: Option<i64>) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let scope = post.map_or(CacheScope::All, CacheScope::Post);
    let report = clear_cache(&store, &runtime.cache_settings(), scope)?;

    println!("builder clear-cache");
    print_cache_report(&report);
    runtime.finish();
    Ok(())
}

fn run_builder_mark(options: &RuntimeOptions, post_id: i64, version: Option<&str>) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let report = mark_builder(&store, &runtime.cache_settings(), post_id, version)?;

    println!("builder mark");
    println!("post_id: {}", report.post_id);
    println!("title: {}", report.title);
    println!(
        "previous_mode: {}",
        report.previous_mode.as_deref().unwrap_or("<none>")
    );
    println!("version: {}", report.version);
    print_cache_report(&report.cache);
    runtime.finish();
    Ok(())
}

fn print_cache_report(report: &CacheClearReport) {
    println!("scope: {}", report.scope);
    println!("meta_rows_deleted: {}", report.meta_rows_deleted);
    println!("options_deleted: {}", report.options_deleted.len());
    for option in &report.options_deleted {
        println!("options_deleted.name: {option}");
    }
    println!("css_files_removed: {}", report.css_files_removed.len());
    print_warnings(&report.failures);
}

fn run_export_static(options: &RuntimeOptions, args: StaticArgs) -> Result<()> {
    let runtime = load_runtime(options)?;
    let store = runtime.open_store()?;
    let output_dir = match args.output_dir {
        Some(dir) => dir,
        None => match runtime.config.export.output_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => runtime.paths.project_root.join(dir.trim()),
            _ => runtime.paths.exports_dir.join("static"),
        },
    };
    let post_types = if args.post_types.is_empty() {
        runtime.config.export_post_types()
    } else {
        args.post_types
    };
    let report = export_static_pages(
        &store,
        &runtime.config,
        &StaticExportOptions {
            output_dir,
            post_types,
            archive: args.archive,
        },
    )?;

    println!("export static");
    println!("site_url: {}", report.site_url);
    println!("output_dir: {}", report.output_dir);
    println!("pages.written: {}", report.pages.len());
    for page in &report.pages {
        println!("page: {} -> {} ({} bytes)", page.url, page.file, page.bytes);
    }
    println!("pages.failed: {}", report.failures.len());
    for failure in &report.failures {
        println!("failed: {} {} ({})", failure.id, failure.url, failure.error);
    }
    println!("manifest: {}", report.manifest_path);
    if let Some(archive) = &report.archive_path {
        println!("archive: {archive}");
    }
    runtime.finish();
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn load_runtime(options: &RuntimeOptions) -> Result<Runtime> {
    let mut paths = resolve_runtime_paths(options)?;
    let config = load_config(&paths.config_path)?;
    paths.apply_config(&config);
    debug!(
        root = %paths.project_root.display(),
        config = %paths.config_path.display(),
        db = %paths.db_path.display(),
        "resolved runtime"
    );
    Ok(Runtime {
        paths,
        config,
        diagnostics: options.diagnostics,
    })
}

fn resolve_runtime_paths(options: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: options.project_root.clone(),
        config: options.config.clone(),
        db_path: options.db.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
