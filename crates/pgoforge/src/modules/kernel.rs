//! The kernel pipeline: preflight, resolve, confirm, verify, validate, build
//! and collect, in that order.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use pgoforge_macros::{Module, Task};

use crate::builder::BuildRequest;
use crate::config::ConfigDoc;
use crate::descriptor::{
    Descriptor, DescriptorEvaluator, DescriptorSnapshot, Probe, ShellEvaluator, StaticEvaluator,
    vars,
};
use crate::error::ErrorKind;
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::profile::{BuildPlan, BuildProfileSet, KernelOptions, ResolvePolicy, resolve_with};
use crate::verify::{OutcomeStatus, OverrideDescriptor, VerificationReport, verify};
use crate::workspace::{WorkspaceConfig, WorkspacePaths};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_descriptor() -> String {
    "PKGBUILD".into()
}

fn default_builder() -> Vec<String> {
    ["makepkg", "-sf", "--noconfirm"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_min_free_gib() -> u64 {
    40
}

fn default_artifact_suffixes() -> Vec<String> {
    vec![".pkg.tar.zst".into(), ".pkg.tar.xz".into()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluatorKind {
    #[default]
    Shell,
    Static,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    pub autofdo: Option<String>,
    pub propeller_cc: Option<String>,
    pub propeller_ld: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_descriptor")]
    pub descriptor: String,
    /// Defaults to the descriptor's directory.
    pub work_dir: Option<String>,
    #[serde(default = "default_builder")]
    pub builder: Vec<String>,
    pub evaluator: EvaluatorKind,
    pub checksum_array: Option<String>,
    pub patch: Option<String>,
    #[serde(default = "default_min_free_gib")]
    pub min_free_gib: u64,
    pub allow_root: bool,
    pub fail_on_mismatch: bool,
    #[serde(default = "default_artifact_suffixes")]
    pub artifact_glob_suffixes: Vec<String>,
    pub profiles: ProfilesConfig,
    pub options: KernelOptions,
    pub policy: ResolvePolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            descriptor: default_descriptor(),
            work_dir: None,
            builder: default_builder(),
            evaluator: EvaluatorKind::default(),
            checksum_array: None,
            patch: None,
            min_free_gib: default_min_free_gib(),
            allow_root: false,
            fail_on_mismatch: false,
            artifact_glob_suffixes: default_artifact_suffixes(),
            profiles: ProfilesConfig::default(),
            options: KernelOptions::default(),
            policy: ResolvePolicy::default(),
        }
    }
}

/// Everything the kernel tasks derive from the build definition, with paths resolved.
#[derive(Debug, Clone)]
pub struct KernelInputs {
    pub cfg: KernelConfig,
    pub ws: WorkspacePaths,
    pub descriptor: PathBuf,
    pub work_dir: PathBuf,
    pub profiles: BuildProfileSet,
    pub patch: Option<PathBuf>,
    pub module_overlay: Option<bool>,
}

/// Result of checking the descriptor against the intended assignments.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub report: VerificationReport,
    pub snapshot: DescriptorSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureSummary {
    pub checksum_array: String,
    pub sources: usize,
    pub checksums: usize,
}

fn non_empty(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl KernelInputs {
    /// Resolves against `ws`; relative paths are rooted at the workspace root.
    pub fn load(doc: &ConfigDoc, ws: WorkspacePaths) -> Result<Self> {
        let cfg: KernelConfig = doc.deserialize_path("kernel")?.unwrap_or_default();
        let resolve = |raw: &Option<String>| -> Result<Option<PathBuf>> {
            non_empty(raw).map(|p| ws.resolve_config_path(p)).transpose()
        };

        let descriptor = ws.resolve_config_path(&cfg.descriptor)?;
        let work_dir = match non_empty(&cfg.work_dir) {
            Some(p) => ws.resolve_config_path(p)?,
            None => descriptor
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| ws.root.clone()),
        };
        let profiles = BuildProfileSet {
            autofdo: resolve(&cfg.profiles.autofdo)?,
            propeller_cc: resolve(&cfg.profiles.propeller_cc)?,
            propeller_ld: resolve(&cfg.profiles.propeller_ld)?,
        };
        let patch = resolve(&cfg.patch)?;
        let module_overlay = crate::modules::overlay::overlay_flag(doc)?;

        Ok(Self {
            cfg,
            ws,
            descriptor,
            work_dir,
            profiles,
            patch,
            module_overlay,
        })
    }

    /// Same as `load`, computing workspace paths without creating anything.
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let ws = crate::workspace::load_paths(&ws_cfg, &doc.base_dir())?;
        Self::load(doc, ws)
    }

    fn for_task(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Self> {
        match ctx.workspace_paths() {
            Some(ws) => Self::load(doc, ws),
            None => Self::from_doc(doc),
        }
    }

    pub fn required_files(&self) -> Vec<(String, PathBuf)> {
        let mut out = vec![("build descriptor".to_string(), self.descriptor.clone())];
        for (slot, path) in self.profiles.present() {
            out.push((format!("{} profile", slot.env_var()), path.clone()));
        }
        if let Some(p) = &self.patch {
            out.push(("custom patch".into(), p.clone()));
        }
        out
    }

    pub fn resolve(&self) -> Result<BuildPlan> {
        Ok(resolve_with(&self.profiles, self.cfg.policy)?)
    }

    pub fn intended(&self, plan: &BuildPlan) -> BTreeMap<String, String> {
        let mut out = plan.intended_assignments(&self.cfg.options, self.module_overlay);
        if let Some(p) = &self.patch {
            out.insert(vars::CUSTOM_PATCH.into(), p.display().to_string());
        }
        out
    }

    pub fn evaluator(&self) -> Box<dyn DescriptorEvaluator> {
        match self.cfg.evaluator {
            EvaluatorKind::Shell => Box::new(ShellEvaluator::default()),
            EvaluatorKind::Static => Box::new(StaticEvaluator),
        }
    }

    /// Evaluates the descriptor with `intended` injected and compares the results.
    pub fn inspect(&self, intended: &BTreeMap<String, String>) -> Result<Inspection> {
        // The shell sources the real file; only the emulation needs a full parse.
        let desc = match self.cfg.evaluator {
            EvaluatorKind::Shell => Descriptor::load_lenient(&self.descriptor)?,
            EvaluatorKind::Static => Descriptor::load(&self.descriptor)?,
        };
        let evaluator = self.evaluator();
        let probe = Probe::for_descriptor(&desc, intended);
        let snapshot = evaluator.evaluate(&desc, intended, &probe)?;

        let overrides = OverrideDescriptor::new(intended, &desc.declared_defaults());
        let outcomes = verify(&overrides, &snapshot.vars);
        let pinned = desc.plain_assignments();
        let mut descriptor_warnings = snapshot.warnings.clone();
        descriptor_warnings.extend(
            outcomes
                .iter()
                .filter(|o| o.is_mismatch() && pinned.contains(&o.variable))
                .map(|o| {
                    format!(
                        "{} is assigned unconditionally; declare it as : \"${{{}:=...}}\" to accept overrides",
                        o.variable, o.variable
                    )
                }),
        );
        let report = VerificationReport {
            evaluator: evaluator.name().to_string(),
            outcomes,
            descriptor_warnings,
        };
        Ok(Inspection { report, snapshot })
    }

    pub fn check_structure(&self, snapshot: &DescriptorSnapshot) -> Result<StructureSummary> {
        let name = snapshot
            .checksum_array_name(non_empty(&self.cfg.checksum_array))
            .ok_or_else(|| {
                Error::from(crate::error::ConfigError::StructuralMismatch {
                    sources: snapshot.sources().len(),
                    checksums: 0,
                })
                .context("descriptor declares no checksum array")
            })?;
        let checksums = snapshot.array(&name);
        crate::validate::validate(snapshot.sources(), checksums)?;
        Ok(StructureSummary {
            sources: snapshot.sources().len(),
            checksums: checksums.len(),
            checksum_array: name,
        })
    }
}

fn log_report(ctx: &ExecCtx, report: &VerificationReport) {
    for w in &report.descriptor_warnings {
        tracing::warn!(warning = %w, "descriptor evaluation");
        ctx.log(&format!("WARNING: {w}"));
    }
    for o in &report.outcomes {
        match o.status {
            OutcomeStatus::Mismatch { .. } => {
                tracing::warn!(variable = %o.variable, "override not honored by descriptor");
                ctx.log(&format!("WARNING: {}", o.describe()));
            }
            OutcomeStatus::Unresolved => ctx.log(&format!("warning: {}", o.describe())),
            _ => ctx.log(&o.describe()),
        }
    }
    ctx.log(&format!(
        "verification ({}): {} active, {} default, {} mismatch, {} unresolved",
        report.evaluator,
        report.count(|s| matches!(s, OutcomeStatus::OverrideActive)),
        report.count(|s| matches!(s, OutcomeStatus::DefaultUsed)),
        report.count(|s| matches!(s, OutcomeStatus::Mismatch { .. })),
        report.count(|s| matches!(s, OutcomeStatus::Unresolved)),
    ));
}

/// The plan stored by `kernel.resolve`, or a fresh resolution when that task did not run.
fn plan_or_resolve(
    inputs: &KernelInputs,
    ctx: &ExecCtx,
) -> Result<(BuildPlan, BTreeMap<String, String>)> {
    if let (Some(plan), Some(intended)) = (ctx.build_plan(), ctx.intended()) {
        return Ok((plan, intended));
    }
    let plan = inputs.resolve()?;
    let intended = inputs.intended(&plan);
    Ok((plan, intended))
}

#[Task(
    id = "kernel.preflight",
    module = "kernel",
    phase = "preflight",
    provides = ["kernel:preflight-ok"],
    default_label = "Host preflight checks",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreflightTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for PreflightTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl PreflightTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        crate::preflight::check_privileges(inputs.cfg.allow_root)?;
        crate::preflight::check_free_space(&inputs.ws.build_dir, inputs.cfg.min_free_gib)?;
        let files = inputs.required_files();
        crate::preflight::check_files(&files)?;
        ctx.log(&format!(
            "preflight ok: {} input file(s), >= {} GiB free under {}",
            files.len(),
            inputs.cfg.min_free_gib,
            inputs.ws.build_dir.display()
        ));
        Ok(())
    }
}

#[Task(
    id = "kernel.resolve",
    module = "kernel",
    phase = "resolve",
    after = ["core.init"],
    provides = ["kernel:plan"],
    default_label = "Resolve build mode",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolveTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ResolveTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ResolveTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        let plan = inputs.resolve()?;
        let intended = inputs.intended(&plan);
        tracing::info!(mode = %plan.mode, "resolved build mode");
        for line in plan.summary_lines() {
            ctx.log(&line);
        }
        ctx.set_build_plan(plan);
        ctx.set_intended(intended);
        Ok(())
    }
}

#[Task(
    id = "kernel.confirm",
    module = "kernel",
    phase = "confirm",
    after = ["kernel.resolve"],
    default_label = "Operator confirmation",
    core = true,
    effectful = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfirmTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ConfirmTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ConfirmTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        let (plan, _) = plan_or_resolve(&inputs, ctx)?;
        let mut summary = plan.summary_lines();
        summary.push(format!("descriptor: {}", inputs.descriptor.display()));
        summary.push(format!("builder: {}", inputs.cfg.builder.join(" ")));

        if !ctx.gate.confirm(&summary)? {
            return Err(Error::cancelled());
        }
        ctx.log("confirmed");
        Ok(())
    }
}

#[Task(
    id = "kernel.verify",
    module = "kernel",
    phase = "verify",
    after = ["kernel.confirm"],
    provides = ["kernel:verified"],
    default_label = "Verify descriptor overrides",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for VerifyTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl VerifyTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        let (_, intended) = plan_or_resolve(&inputs, ctx)?;
        let inspection = inputs.inspect(&intended)?;
        log_report(ctx, &inspection.report);

        let mismatches = inspection.report.mismatches().count();
        ctx.set_verification(inspection.report);
        if mismatches > 0 && inputs.cfg.fail_on_mismatch {
            return Err(Error::new(
                ErrorKind::OverrideMismatch,
                format!(
                    "{mismatches} override(s) not honored by {} (kernel.fail_on_mismatch = true)",
                    inputs.descriptor.display()
                ),
            ));
        }
        Ok(())
    }
}

#[Task(
    id = "kernel.validate",
    module = "kernel",
    phase = "validate",
    after = ["kernel.verify"],
    provides = ["kernel:validated"],
    default_label = "Validate sources/checksums",
    core = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidateTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ValidateTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ValidateTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        let (_, intended) = plan_or_resolve(&inputs, ctx)?;
        // Re-evaluated so the array lengths reflect every optional input of this run.
        let inspection = inputs.inspect(&intended)?;
        let summary = inputs.check_structure(&inspection.snapshot)?;
        ctx.log(&format!(
            "{} source(s), {} checksum(s) in {}",
            summary.sources, summary.checksums, summary.checksum_array
        ));
        Ok(())
    }
}

#[Task(
    id = "kernel.build",
    module = "kernel",
    phase = "build",
    after = ["kernel.validate", "overlay:written?"],
    provides = ["kernel:built"],
    default_label = "Run external build",
    core = true,
    effectful = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for BuildTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl BuildTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        let (_, intended) = plan_or_resolve(&inputs, ctx)?;
        let req = BuildRequest {
            work_dir: inputs.work_dir.clone(),
            argv: inputs.cfg.builder.clone(),
            env: intended,
            artifact_suffixes: inputs.cfg.artifact_glob_suffixes.clone(),
        };
        let builder = ctx.builder.clone();
        let out = builder.build(&req, ctx)?;
        for a in &out.artifacts {
            ctx.log(&format!("artifact: {}", a.display()));
        }
        ctx.set_artifacts(out.artifacts);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build: String,
    pub generated_at: String,
    pub plan: BuildPlan,
    pub intended: BTreeMap<String, String>,
    pub verification: Option<VerificationReport>,
    pub artifacts: Vec<ArtifactRecord>,
}

#[Task(
    id = "kernel.collect",
    module = "kernel",
    phase = "collect",
    after = ["kernel.build"],
    default_label = "Collect packages",
    effectful = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CollectTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CollectTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let inputs = KernelInputs::for_task(doc, ctx)?;
        let artifacts = ctx.artifacts();
        if artifacts.is_empty() {
            return Err(Error::new(
                ErrorKind::ExternalBuildFailure,
                format!(
                    "builder succeeded but left no [{}] files in {}",
                    inputs.cfg.artifact_glob_suffixes.join(", "),
                    inputs.work_dir.display()
                ),
            ));
        }

        let out_dir = util::build_out_dir(doc, ctx)?;
        let pkg_dir = out_dir.join("packages");
        let mut records = Vec::with_capacity(artifacts.len());
        for src in &artifacts {
            let dst = util::copy_into(src, &pkg_dir)?;
            let size = fs::metadata(&dst)
                .map_err(|e| Error::msg(format!("failed to stat {}: {e}", dst.display())))?
                .len();
            records.push(ArtifactRecord {
                name: dst
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                sha256: util::sha256_file_hex(&dst)?,
                path: dst,
                size,
            });
        }

        let (plan, intended) = plan_or_resolve(&inputs, ctx)?;
        let report = BuildReport {
            build: doc.build_name(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            plan,
            intended,
            verification: ctx.verification(),
            artifacts: records,
        };
        let report_path = out_dir.join("build-report.json");
        util::write_json_pretty(&report_path, &report)?;
        ctx.log(&format!(
            "collected {} package(s) into {}; report {}",
            report.artifacts.len(),
            pkg_dir.display(),
            report_path.display()
        ));
        ctx.log(&format!("next: {}", report.plan.mode.next_step_hint()));
        Ok(())
    }
}

#[Module(
    id = "kernel",
    config = KernelConfig,
    tasks = [
        PreflightTask,
        ResolveTask,
        ConfirmTask,
        VerifyTask,
        ValidateTask,
        BuildTask,
        CollectTask
    ]
)]
pub struct KernelModule;
