use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::phpser::{self, PhpValue};
use crate::store::SiteStore;

pub const ACTIVE_PLUGINS_OPTION: &str = "active_plugins";

#[derive(Debug, Clone, Serialize, Default)]
pub struct PluginChangeReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub missing_files: Vec<String>,
    pub active: Vec<String>,
    pub wrote_option: bool,
}

pub fn list_active_plugins(store: &SiteStore) -> Result<Vec<String>> {
    match store.get_serialized_option(ACTIVE_PLUGINS_OPTION)? {
        None => Ok(Vec::new()),
        Some(PhpValue::String(raw)) if raw.trim().is_empty() => Ok(Vec::new()),
        Some(value) => value.as_string_list().ok_or_else(|| {
            anyhow::anyhow!("option {ACTIVE_PLUGINS_OPTION} is not a list of plugin paths")
        }),
    }
}

/// Append each identifier to `active_plugins` unless already present, then
/// re-read the option and check every identifier occurs exactly once.
pub fn activate_plugins(
    store: &SiteStore,
    plugins_dir: &Path,
    identifiers: &[String],
) -> Result<PluginChangeReport> {
    let requested = validate_identifiers(identifiers)?;
    let current = list_active_plugins(store)?;
    let mut next = dedupe_preserving_order(&current);

    let mut report = PluginChangeReport::default();
    for plugin in &requested {
        if !plugins_dir.join(plugin).is_file() {
            warn!(plugin = %plugin, dir = %plugins_dir.display(), "plugin file not found");
            report.missing_files.push(plugin.clone());
        }
        if next.contains(plugin) {
            report.unchanged.push(plugin.clone());
        } else {
            next.push(plugin.clone());
            report.added.push(plugin.clone());
        }
    }
    // WordPress keeps the list sorted after activation.
    next.sort();

    report.wrote_option = write_if_changed(store, &current, &next)?;
    report.active = list_active_plugins(store)?;
    for plugin in &requested {
        let occurrences = report.active.iter().filter(|item| *item == plugin).count();
        if occurrences != 1 {
            bail!(
                "verification failed: {plugin} appears {occurrences} times in {ACTIVE_PLUGINS_OPTION}"
            );
        }
    }
    info!(added = report.added.len(), "plugin activation applied");
    Ok(report)
}

pub fn deactivate_plugins(store: &SiteStore, identifiers: &[String]) -> Result<PluginChangeReport> {
    let requested = validate_identifiers(identifiers)?;
    let current = list_active_plugins(store)?;

    let mut report = PluginChangeReport::default();
    for plugin in &requested {
        if current.contains(plugin) {
            report.removed.push(plugin.clone());
        } else {
            report.unchanged.push(plugin.clone());
        }
    }
    let next = dedupe_preserving_order(&current)
        .into_iter()
        .filter(|item| !requested.contains(item))
        .collect::<Vec<_>>();

    report.wrote_option = write_if_changed(store, &current, &next)?;
    report.active = list_active_plugins(store)?;
    if let Some(still_active) = requested.iter().find(|plugin| report.active.contains(plugin)) {
        bail!("verification failed: {still_active} is still listed in {ACTIVE_PLUGINS_OPTION}");
    }
    Ok(report)
}

/// `folder/file.php` or a single-file `file.php` relative to the plugins directory.
pub fn validate_plugin_identifier(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("plugin identifier cannot be empty");
    }
    let segments = trimmed.split('/').collect::<Vec<_>>();
    let well_formed = trimmed.ends_with(".php")
        && !trimmed.contains('\\')
        && segments.len() <= 2
        && segments
            .iter()
            .all(|segment| !segment.is_empty() && *segment != "." && *segment != "..");
    if !well_formed {
        bail!("invalid plugin identifier `{trimmed}` (expected `folder/file.php`)");
    }
    Ok(trimmed.to_string())
}

fn validate_identifiers(identifiers: &[String]) -> Result<Vec<String>> {
    if identifiers.is_empty() {
        bail!("at least one plugin identifier is required");
    }
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for identifier in identifiers {
        let plugin = validate_plugin_identifier(identifier)?;
        if seen.insert(plugin.clone()) {
            out.push(plugin);
        }
    }
    Ok(out)
}

fn dedupe_preserving_order(values: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .filter(|value| seen.insert((*value).clone()))
        .cloned()
        .collect()
}

fn write_if_changed(store: &SiteStore, current: &[String], next: &[String]) -> Result<bool> {
    if current == next {
        return Ok(false);
    }
    let encoded = phpser::serialize(&PhpValue::string_list(next.iter().cloned()));
    store.set_option(ACTIVE_PLUGINS_OPTION, &encoded)?;
    Ok(true)
}
