//! The external package build: one blocking invocation, opaque to us apart
//! from its exit status and the package files it leaves behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub work_dir: PathBuf,
    pub argv: Vec<String>,
    /// Descriptor variables plus anything else the builder must see.
    pub env: BTreeMap<String, String>,
    pub artifact_suffixes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub artifacts: Vec<PathBuf>,
}

pub trait ExternalBuilder: Send + Sync {
    fn build(&self, req: &BuildRequest, ctx: &ExecCtx) -> Result<BuildOutput>;
}

/// Runs `argv` in `work_dir` and picks up package files written there.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuilder;

impl ExternalBuilder for CommandBuilder {
    fn build(&self, req: &BuildRequest, ctx: &ExecCtx) -> Result<BuildOutput> {
        let (program, args) = req
            .argv
            .split_first()
            .ok_or_else(|| Error::msg("kernel.builder is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&req.work_dir).envs(&req.env);
        if !req.env.contains_key("MAKEFLAGS") && std::env::var_os("MAKEFLAGS").is_none() {
            cmd.env("MAKEFLAGS", format!("-j{}", num_cpus::get().max(1)));
        }

        ctx.log(&format!(
            "running {} in {}",
            req.argv.join(" "),
            req.work_dir.display()
        ));
        let started = SystemTime::now();
        ctx.run_cmd(cmd)
            .map_err(|e| Error::new(ErrorKind::ExternalBuildFailure, format!("{program}: {e}")))?;

        Ok(BuildOutput {
            artifacts: find_artifacts(&req.work_dir, &req.artifact_suffixes, Some(started)),
        })
    }
}

/// Files directly under `dir` ending in one of `suffixes`, optionally only those
/// modified at or after `since`. Sorted by path.
pub fn find_artifacts(dir: &Path, suffixes: &[String], since: Option<SystemTime>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            suffixes.iter().any(|s| name.ends_with(s.as_str()))
        })
        .filter(|e| match since {
            Some(t) => e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .is_some_and(|m| m >= t),
            None => true,
        })
        .map(|e| e.into_path())
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_packages_by_suffix_only_at_top_level() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("linux-pgo-6.12.3-1-x86_64.pkg.tar.zst"), "a").expect("write");
        fs::write(tmp.path().join("linux-pgo-headers-6.12.3-1-x86_64.pkg.tar.zst"), "b")
            .expect("write");
        fs::write(tmp.path().join("PKGBUILD"), "").expect("write");
        fs::create_dir_all(tmp.path().join("pkg")).expect("mkdir");
        fs::write(tmp.path().join("pkg/nested.pkg.tar.zst"), "c").expect("write");

        let found = find_artifacts(tmp.path(), &[".pkg.tar.zst".into()], None);
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(
            names,
            [
                "linux-pgo-6.12.3-1-x86_64.pkg.tar.zst",
                "linux-pgo-headers-6.12.3-1-x86_64.pkg.tar.zst"
            ]
        );
    }
}
