//! Sorts loaded kernel modules into hot-path categories and renders a
//! config overlay the descriptor merges before compilation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_line;

mod tables;

/// Variants are declared in lookup order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCategory {
    CryptoHotPath,
    StorageHotPath,
    CompressionMedium,
    CoreBlockDevice,
    VirtualizationConditional,
    Uncategorized,
}

impl ModuleCategory {
    pub const LOOKUP_ORDER: [ModuleCategory; 6] = [
        ModuleCategory::CryptoHotPath,
        ModuleCategory::StorageHotPath,
        ModuleCategory::CompressionMedium,
        ModuleCategory::CoreBlockDevice,
        ModuleCategory::VirtualizationConditional,
        ModuleCategory::Uncategorized,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ModuleCategory::CryptoHotPath => "crypto",
            ModuleCategory::StorageHotPath => "storage",
            ModuleCategory::CompressionMedium => "compression",
            ModuleCategory::CoreBlockDevice => "core-block",
            ModuleCategory::VirtualizationConditional => "virtualization",
            ModuleCategory::Uncategorized => "uncategorized",
        }
    }

    fn header(self) -> &'static str {
        match self {
            ModuleCategory::CryptoHotPath => "Crypto hot path: built in",
            ModuleCategory::StorageHotPath => "Storage hot path: built in",
            ModuleCategory::CompressionMedium => "Compression: kept as modules",
            ModuleCategory::CoreBlockDevice => "Core block devices: built in",
            ModuleCategory::VirtualizationConditional => {
                "Virtualization: disabled, uncomment on guests/hypervisors"
            }
            ModuleCategory::Uncategorized => "Uncategorized",
        }
    }

    /// Directives are written commented out and need operator action.
    pub fn commented_by_default(self) -> bool {
        matches!(self, ModuleCategory::VirtualizationConditional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriState {
    Builtin,
    Module,
    Disabled,
}

impl TriState {
    fn value(self) -> char {
        match self {
            TriState::Builtin => 'y',
            TriState::Module => 'm',
            TriState::Disabled => 'n',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigDirective {
    pub key: &'static str,
    pub state: TriState,
}

pub fn category_of(name: &str) -> ModuleCategory {
    ModuleCategory::LOOKUP_ORDER
        .into_iter()
        .find(|c| tables::lookup(*c, name).is_some())
        .unwrap_or(ModuleCategory::Uncategorized)
}

pub fn directives_for(category: ModuleCategory, name: &str) -> &'static [ConfigDirective] {
    tables::lookup(category, name).unwrap_or(&[])
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub buckets: BTreeMap<ModuleCategory, Vec<String>>,
}

impl ClassificationResult {
    pub fn bucket(&self, category: ModuleCategory) -> &[String] {
        self.buckets
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// Each distinct identifier lands in exactly one bucket, kept in first-seen order.
pub fn classify<I, S>(modules: I) -> ClassificationResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = ClassificationResult::default();
    for m in modules {
        let m = m.as_ref();
        if !seen.insert(m.to_string()) {
            continue;
        }
        out.buckets
            .entry(category_of(m))
            .or_default()
            .push(m.to_string());
    }
    out
}

/// Renders the overlay. Output depends only on `result`.
pub fn render(result: &ClassificationResult) -> String {
    let mut out = String::new();
    let categorized = result.total() - result.bucket(ModuleCategory::Uncategorized).len();
    let _ = writeln!(out, "# pgoforge module overlay");
    let _ = writeln!(
        out,
        "# {} module(s), {categorized} categorized",
        result.total()
    );

    // One line per key; every module that maps to it is named in the annotation.
    let mut lines: Vec<(ModuleCategory, ConfigDirective, Vec<&str>)> = Vec::new();
    let mut by_key: HashMap<&'static str, usize> = HashMap::new();
    for category in ModuleCategory::LOOKUP_ORDER {
        for m in result.bucket(category) {
            for d in directives_for(category, m) {
                match by_key.get(d.key) {
                    Some(&i) => lines[i].2.push(m.as_str()),
                    None => {
                        by_key.insert(d.key, lines.len());
                        lines.push((category, *d, vec![m.as_str()]));
                    }
                }
            }
        }
    }

    for category in ModuleCategory::LOOKUP_ORDER {
        let mut in_category = lines.iter().filter(|(c, _, _)| *c == category).peekable();
        if in_category.peek().is_none() {
            continue;
        }
        let _ = writeln!(out, "\n# === {} ===", category.header());
        let prefix = if category.commented_by_default() { "# " } else { "" };
        for (_, d, modules) in in_category {
            let _ = writeln!(
                out,
                "{prefix}{}={} # {}: {}",
                d.key,
                d.state.value(),
                category.label(),
                modules.join(", ")
            );
        }
    }

    let rest = result.bucket(ModuleCategory::Uncategorized);
    let _ = writeln!(out, "\n# === {} ===", ModuleCategory::Uncategorized.header());
    let _ = writeln!(out, "# {} module(s) left to the base config", rest.len());
    for m in rest {
        let _ = writeln!(out, "#   {m}");
    }
    out
}

/// One identifier per line, taken from the first column so `/proc/modules`
/// reads directly. Blank lines are skipped.
pub fn read_module_list<R: BufRead>(reader: R) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| Error::msg(format!("failed to read module list: {e}")))?;
        if let Some(name) = sanitize_line(&line).split_whitespace().next() {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

/// `<base>/<variant_dir>/<file_name>` when that directory exists, else `<base>/<file_name>`.
pub fn resolve_overlay_path(base: &Path, variant_dir: Option<&str>, file_name: &str) -> PathBuf {
    if let Some(v) = variant_dir.map(str::trim).filter(|v| !v.is_empty()) {
        let dir = base.join(v);
        if dir.is_dir() {
            return dir.join(file_name);
        }
    }
    base.join(file_name)
}

pub fn write_overlay(path: &Path, doc: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        crate::modules::util::ensure_dir(parent)?;
    }
    fs::write(path, doc)
        .map_err(|e| Error::msg(format!("failed to write overlay {}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "wrote module overlay");
    Ok(())
}
