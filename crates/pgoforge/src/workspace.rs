use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Out => "out",
            CleanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Relative to the build definition's directory.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default)]
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    /// Absolute paths as-is, relative ones under the workspace root.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() { pb } else { self.root.join(pb) })
    }

    pub fn error_logs_dir(&self) -> PathBuf {
        self.build_dir.join("error-logs")
    }
}

/// Resolves the configured directories against `base` without touching the disk.
pub fn load_paths(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let base = if base.is_absolute() {
        base.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::msg(format!("cwd error: {e}")))?
            .join(base)
    };
    let root = resolve_user_path(&base, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig, base: &Path) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg, base)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Build => safe_remove_dir_all(&paths.root, &paths.build_dir)?,
        CleanMode::Out => safe_remove_dir_all(&paths.root, &paths.out_dir)?,
        CleanMode::All => {
            safe_remove_dir_all(&paths.root, &paths.build_dir)?;
            safe_remove_dir_all(&paths.root, &paths.out_dir)?;
        }
    }

    for (what, dir) in [("build_dir", &paths.build_dir), ("out_dir", &paths.out_dir)] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {what} {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace dir"));
    }
    if Path::new(p)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid workspace dir '{p}' (contains '..')"
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirs_resolve_against_definition_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            root_dir: "ws".into(),
            ..WorkspaceConfig::default()
        };
        let paths = load_paths(&cfg, tmp.path()).expect("paths");
        assert_eq!(paths.root, tmp.path().join("ws"));
        assert_eq!(paths.build_dir, tmp.path().join("ws/build"));
        assert!(!paths.build_dir.exists());
        assert_eq!(
            paths.resolve_config_path("profiles/kernel.afdo").expect("rel"),
            tmp.path().join("ws/profiles/kernel.afdo")
        );
        assert_eq!(
            paths.resolve_config_path("/abs/p.afdo").expect("abs"),
            PathBuf::from("/abs/p.afdo")
        );
    }

    #[test]
    fn clean_build_only_removes_build_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = WorkspaceConfig::default();
        let paths = init_dirs(&cfg, tmp.path()).expect("init");
        fs::write(paths.build_dir.join("stale"), "x").expect("write");
        fs::write(paths.out_dir.join("keep"), "x").expect("write");

        cfg.clean = CleanMode::Build;
        let paths = init_dirs(&cfg, tmp.path()).expect("re-init");
        assert!(!paths.build_dir.join("stale").exists());
        assert!(paths.out_dir.join("keep").exists());
    }

    #[test]
    fn parent_dir_components_are_rejected() {
        let cfg = WorkspaceConfig {
            out_dir: "../escape".into(),
            ..WorkspaceConfig::default()
        };
        assert!(load_paths(&cfg, Path::new("/tmp")).is_err());
    }
}
