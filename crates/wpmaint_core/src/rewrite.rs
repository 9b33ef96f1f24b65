use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tracing::{debug, info};

use crate::config::RewriteRule;
use crate::phpser;
use crate::runtime::{ResolvedPaths, normalize_for_display};

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";
const DIFF_PREVIEW_MAX_LINES: usize = 200;
const MAX_NESTED_SERIALIZATION: usize = 4;

/// Substring replacement rules that are guaranteed to be idempotent: no
/// replacement text can form or extend a match for any source string.
#[derive(Debug, Clone)]
pub struct RewriteMap {
    rules: Vec<RewriteRule>,
}

impl RewriteMap {
    pub fn new(rules: &[RewriteRule]) -> Result<Self> {
        if rules.is_empty() {
            bail!("no rewrite rules given (use --map FROM=TO or [[rewrite.rules]] in config)");
        }
        let mut sorted = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.from.is_empty() {
                bail!("rewrite rule source cannot be empty");
            }
            // Deleting text joins its neighbours, which can spell any source anew.
            if rule.to.is_empty() {
                bail!(
                    "rewrite rule `{}` has an empty target; deletions are not supported",
                    rule.from
                );
            }
            if sorted
                .iter()
                .any(|existing: &RewriteRule| existing.from == rule.from)
            {
                bail!("duplicate rewrite source `{}`", rule.from);
            }
            sorted.push(rule.clone());
        }
        for target in &sorted {
            for source in &sorted {
                if overlaps(&target.to, &source.from) {
                    bail!(
                        "rewrite target `{}` overlaps source `{}`; a second pass would rewrite it again",
                        target.to,
                        source.from
                    );
                }
            }
        }
        sorted.sort_by(|left, right| right.from.len().cmp(&left.from.len()));
        Ok(Self { rules: sorted })
    }

    /// Parse `FROM=TO` command-line pairs.
    pub fn parse_pairs(pairs: &[String]) -> Result<Vec<RewriteRule>> {
        pairs
            .iter()
            .map(|pair| {
                let (from, to) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("invalid rewrite pair `{pair}` (expected FROM=TO)"))?;
                Ok(RewriteRule {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            })
            .collect()
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// Single left-to-right pass; at each position the longest matching source wins.
    pub fn apply(&self, text: &str) -> (String, usize) {
        let mut out = String::with_capacity(text.len());
        let mut replacements = 0;
        let mut rest = text;
        while !rest.is_empty() {
            if let Some(rule) = self
                .rules
                .iter()
                .find(|rule| rest.starts_with(rule.from.as_str()))
            {
                out.push_str(&rule.to);
                rest = &rest[rule.from.len()..];
                replacements += 1;
                continue;
            }
            let step = rest.chars().next().map_or(1, char::len_utf8);
            out.push_str(&rest[..step]);
            rest = &rest[step..];
        }
        (out, replacements)
    }
}

/// True when `target` and `source` can share characters once placed side by
/// side: one contains the other, or a proper suffix/prefix of one is a
/// prefix/suffix of the other.
fn overlaps(target: &str, source: &str) -> bool {
    if target.contains(source) || source.contains(target) {
        return true;
    }
    let boundaries = target
        .char_indices()
        .map(|(index, _)| index)
        .filter(|index| *index > 0);
    for split in boundaries {
        let (head, tail) = target.split_at(split);
        if source.starts_with(tail) || source.ends_with(head) {
            return true;
        }
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub text: String,
    pub replacements: usize,
    pub serialized_blocks: usize,
}

/// Rewrite an export document. CDATA blocks holding PHP-serialized data are
/// decoded, rewritten leaf by leaf (string keys included) and re-encoded so
/// string lengths stay valid. Object class names are never rewritten.
pub fn rewrite_export_text(text: &str, map: &RewriteMap) -> RewriteOutcome {
    let mut out = String::with_capacity(text.len());
    let mut replacements = 0;
    let mut serialized_blocks = 0;
    let mut rest = text;

    while let Some(open) = rest.find(CDATA_OPEN) {
        let (plain, after_plain) = rest.split_at(open);
        let (rewritten, count) = map.apply(plain);
        out.push_str(&rewritten);
        replacements += count;

        let body_start = CDATA_OPEN.len();
        let Some(close) = after_plain[body_start..].find(CDATA_CLOSE) else {
            // Unterminated block: treat the remainder as plain text.
            rest = after_plain;
            break;
        };
        let body = &after_plain[body_start..body_start + close];
        out.push_str(CDATA_OPEN);
        match rewrite_serialized(body, map, 0) {
            Some((encoded, count)) => {
                if count > 0 {
                    serialized_blocks += 1;
                }
                replacements += count;
                out.push_str(&encoded);
            }
            None => {
                let (rewritten, count) = map.apply(body);
                replacements += count;
                out.push_str(&rewritten);
            }
        }
        out.push_str(CDATA_CLOSE);
        rest = &after_plain[body_start + close + CDATA_CLOSE.len()..];
    }
    let (rewritten, count) = map.apply(rest);
    out.push_str(&rewritten);
    replacements += count;

    RewriteOutcome {
        text: out,
        replacements,
        serialized_blocks,
    }
}

/// `None` when `body` is not serialized data.
fn rewrite_serialized(body: &str, map: &RewriteMap, depth: usize) -> Option<(String, usize)> {
    if depth >= MAX_NESTED_SERIALIZATION || !phpser::looks_serialized(body) {
        return None;
    }
    let value = phpser::parse(body).ok()?;
    let mut count = 0;
    let mapped = value.map_strings(&mut |leaf: &str| {
        if let Some((encoded, nested)) = rewrite_serialized(leaf, map, depth + 1) {
            count += nested;
            return encoded;
        }
        let (rewritten, replaced) = map.apply(leaf);
        count += replaced;
        rewritten
    });
    if count == 0 {
        return Some((body.to_string(), 0));
    }
    Some((phpser::serialize(&mapped), count))
}

#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    pub output: Option<PathBuf>,
    pub dry_run: bool,
    pub no_backup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteReport {
    pub source: String,
    pub output: String,
    pub dry_run: bool,
    pub replacements: usize,
    pub serialized_blocks: usize,
    pub sha256_before: String,
    pub sha256_after: String,
    pub backup_path: Option<String>,
    pub wrote: bool,
    pub diff_preview: Option<String>,
}

pub fn rewrite_export_file(
    paths: &ResolvedPaths,
    file: &Path,
    map: &RewriteMap,
    options: &RewriteOptions,
) -> Result<RewriteReport> {
    if !file.is_file() {
        bail!("export file not found: {}", file.display());
    }
    let original = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let outcome = rewrite_export_text(&original, map);
    let target = options.output.clone().unwrap_or_else(|| file.to_path_buf());
    debug!(
        file = %file.display(),
        replacements = outcome.replacements,
        "computed rewrite"
    );

    let mut report = RewriteReport {
        source: normalize_for_display(file),
        output: normalize_for_display(&target),
        dry_run: options.dry_run,
        replacements: outcome.replacements,
        serialized_blocks: outcome.serialized_blocks,
        sha256_before: content_hash(&original),
        sha256_after: content_hash(&outcome.text),
        backup_path: None,
        wrote: false,
        diff_preview: None,
    };

    if options.dry_run {
        report.diff_preview = Some(diff_preview(&original, &outcome.text, &report.source));
        return Ok(report);
    }
    let in_place = target == file;
    if in_place && outcome.replacements == 0 {
        return Ok(report);
    }
    let second_pass = rewrite_export_text(&outcome.text, map);
    if second_pass.replacements != 0 {
        bail!(
            "refusing to write {}: a second pass would rewrite {} more occurrences",
            target.display(),
            second_pass.replacements
        );
    }

    if in_place && !options.no_backup {
        let backup = plan_backup_path(paths, file)?;
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create backup dir {}", parent.display()))?;
        }
        fs::copy(file, &backup)
            .with_context(|| format!("failed to write backup {}", backup.display()))?;
        report.backup_path = Some(normalize_for_display(&backup));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&target, &outcome.text)
        .with_context(|| format!("failed to write {}", target.display()))?;
    report.wrote = true;

    let written = fs::read_to_string(&target)
        .with_context(|| format!("failed to re-read {}", target.display()))?;
    if content_hash(&written) != report.sha256_after {
        bail!("verification failed: {} changed after write", target.display());
    }
    info!(target = %target.display(), replacements = report.replacements, "rewrote export file");
    Ok(report)
}

fn diff_preview(before: &str, after: &str, label: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    let rendered = diff
        .unified_diff()
        .context_radius(1)
        .header(label, &format!("{label} (rewritten)"))
        .to_string();
    let lines = rendered.lines().collect::<Vec<_>>();
    if lines.len() <= DIFF_PREVIEW_MAX_LINES {
        return rendered;
    }
    let mut preview = lines[..DIFF_PREVIEW_MAX_LINES].join("\n");
    preview.push_str(&format!(
        "\n... {} more diff lines",
        lines.len() - DIFF_PREVIEW_MAX_LINES
    ));
    preview
}

fn plan_backup_path(paths: &ResolvedPaths, file: &Path) -> Result<PathBuf> {
    let stem = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "export".to_string());
    let extension = file
        .extension()
        .map(|extension| extension.to_string_lossy().to_string())
        .unwrap_or_else(|| "xml".to_string());
    let timestamp = unix_timestamp()?;
    Ok(paths
        .backups_dir
        .join("rewrite")
        .join(format!("{stem}_{timestamp}.{extension}")))
}

pub(crate) fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub(crate) fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
