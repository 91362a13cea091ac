use std::fs;
use std::io::{self, BufReader};
use std::path::PathBuf;

use serde::Deserialize;

use pgoforge_macros::{Module, Task};

use crate::classify::{self, ClassificationResult, ModuleCategory};
use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_file_name() -> String {
    "modules.config".into()
}

const PROC_MODULES: &str = "/proc/modules";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `-` reads stdin; unset reads the running kernel's module list.
    pub modules_file: Option<String>,
    /// Defaults to the kernel descriptor's directory, else the workspace root.
    pub base_dir: Option<String>,
    pub variant_dir: Option<String>,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            modules_file: None,
            base_dir: None,
            variant_dir: None,
            file_name: default_file_name(),
        }
    }
}

/// `Some(enabled)` when the definition has an `[overlay]` table.
pub fn overlay_flag(doc: &ConfigDoc) -> Result<Option<bool>> {
    if !doc.has_table_path("overlay") {
        return Ok(None);
    }
    let cfg: OverlayConfig = doc.deserialize_path("overlay")?.unwrap_or_default();
    Ok(Some(cfg.enabled))
}

/// Reads the module list `cfg` points at.
pub fn load_module_list(cfg: &OverlayConfig, base: &std::path::Path) -> Result<Vec<String>> {
    match cfg.modules_file.as_deref().map(str::trim) {
        Some("-") => classify::read_module_list(io::stdin().lock()),
        Some(p) if !p.is_empty() => {
            let path = base.join(p);
            let f = fs::File::open(&path).map_err(|e| {
                Error::msg(format!("failed to open module list {}: {e}", path.display()))
            })?;
            classify::read_module_list(BufReader::new(f))
        }
        _ => {
            let f = fs::File::open(PROC_MODULES)
                .map_err(|e| Error::msg(format!("failed to open {PROC_MODULES}: {e}")))?;
            classify::read_module_list(BufReader::new(f))
        }
    }
}

/// Directory the overlay is written under, before the variant subdirectory.
pub fn overlay_base_dir(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &OverlayConfig) -> Result<PathBuf> {
    let ws = match ctx.workspace_paths() {
        Some(ws) => ws,
        None => {
            let ws_cfg: crate::workspace::WorkspaceConfig =
                doc.deserialize_path("workspace")?.unwrap_or_default();
            crate::workspace::load_paths(&ws_cfg, &doc.base_dir())?
        }
    };
    if let Some(b) = cfg.base_dir.as_deref().filter(|b| !b.trim().is_empty()) {
        return ws.resolve_config_path(b);
    }
    if doc.has_table_path("kernel") {
        let inputs = crate::modules::kernel::KernelInputs::load(doc, ws.clone())?;
        if let Some(dir) = inputs.descriptor.parent() {
            return Ok(dir.to_path_buf());
        }
    }
    Ok(ws.root)
}

fn log_counts(ctx: &ExecCtx, result: &ClassificationResult) {
    for c in ModuleCategory::LOOKUP_ORDER {
        let n = result.bucket(c).len();
        if n > 0 {
            ctx.log(&format!("{:<16} {n}", c.label()));
        }
    }
}

#[Task(
    id = "overlay.classify",
    module = "overlay",
    phase = "classify",
    after = ["core.init"],
    provides = ["overlay:written"],
    default_label = "Classify loaded modules"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifyTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ClassifyTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ClassifyTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: OverlayConfig = doc.deserialize_path("overlay")?.unwrap_or_default();
        let base = overlay_base_dir(doc, ctx, &cfg)?;
        let modules = load_module_list(&cfg, &doc.base_dir())?;
        let result = classify::classify(&modules);
        log_counts(ctx, &result);

        let rendered = classify::render(&result);
        let path =
            classify::resolve_overlay_path(&base, cfg.variant_dir.as_deref(), &cfg.file_name);
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: would write {}", path.display()));
            for line in rendered.lines() {
                ctx.log(line);
            }
            return Ok(());
        }
        classify::write_overlay(&path, &rendered)?;
        ctx.log(&format!(
            "wrote {} ({} module(s))",
            path.display(),
            result.total()
        ));
        Ok(())
    }
}

#[Module(id = "overlay", config = OverlayConfig, tasks = [ClassifyTask])]
pub struct OverlayModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_flag_follows_table_presence() {
        let none = ConfigDoc::from_toml("/d/b.toml", "[kernel]\n").expect("doc");
        assert_eq!(overlay_flag(&none).expect("flag"), None);

        let off = ConfigDoc::from_toml("/d/b.toml", "[overlay]\nenabled = false\n").expect("doc");
        assert_eq!(overlay_flag(&off).expect("flag"), Some(false));

        let on = ConfigDoc::from_toml("/d/b.toml", "[overlay]\n").expect("doc");
        assert_eq!(overlay_flag(&on).expect("flag"), Some(true));
    }

    #[test]
    fn module_list_file_is_relative_to_definition() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("mods.txt"), "nvme\nzstd\n").expect("write");
        let cfg = OverlayConfig {
            modules_file: Some("mods.txt".into()),
            ..OverlayConfig::default()
        };
        assert_eq!(
            load_module_list(&cfg, tmp.path()).expect("list"),
            ["nvme", "zstd"]
        );
    }
}
