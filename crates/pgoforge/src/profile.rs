//! Build-mode resolution: which optimization pass a run performs, derived
//! from the profile artifacts that are present.
//!
//! The pipeline is three passes over the same source tree:
//!
//! 1. `Collection`: no profiles yet; the kernel is built with debug info and
//!    AutoFDO instrumentation so it can be sampled under load.
//! 2. `AutoFdoOptimized`: the sampled AutoFDO profile is applied; debug info
//!    stays on so a Propeller profile can be gathered from this kernel.
//! 3. `PropellerOptimized`: AutoFDO plus both Propeller profiles; the
//!    production kernel, built without debug info.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::env::yes_no;
use crate::descriptor::vars;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSlot {
    AutoFdo,
    PropellerCc,
    PropellerLd,
}

impl ProfileSlot {
    pub fn env_var(self) -> &'static str {
        match self {
            ProfileSlot::AutoFdo => "PGOFORGE_AUTOFDO_PROFILE",
            ProfileSlot::PropellerCc => "PGOFORGE_PROPELLER_CC_PROFILE",
            ProfileSlot::PropellerLd => "PGOFORGE_PROPELLER_LD_PROFILE",
        }
    }

    pub fn config_key(self) -> &'static str {
        match self {
            ProfileSlot::AutoFdo => "kernel.profiles.autofdo",
            ProfileSlot::PropellerCc => "kernel.profiles.propeller_cc",
            ProfileSlot::PropellerLd => "kernel.profiles.propeller_ld",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildProfileSet {
    pub autofdo: Option<PathBuf>,
    pub propeller_cc: Option<PathBuf>,
    pub propeller_ld: Option<PathBuf>,
}

impl BuildProfileSet {
    pub fn get(&self, slot: ProfileSlot) -> Option<&PathBuf> {
        match slot {
            ProfileSlot::AutoFdo => self.autofdo.as_ref(),
            ProfileSlot::PropellerCc => self.propeller_cc.as_ref(),
            ProfileSlot::PropellerLd => self.propeller_ld.as_ref(),
        }
    }

    /// Present profiles in slot order.
    pub fn present(&self) -> Vec<(ProfileSlot, &PathBuf)> {
        [
            ProfileSlot::AutoFdo,
            ProfileSlot::PropellerCc,
            ProfileSlot::PropellerLd,
        ]
        .into_iter()
        .filter_map(|s| self.get(s).map(|p| (s, p)))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    Collection,
    #[serde(rename = "autofdo-optimized")]
    AutoFdoOptimized,
    PropellerOptimized,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildMode::Collection => "collection",
            BuildMode::AutoFdoOptimized => "autofdo-optimized",
            BuildMode::PropellerOptimized => "propeller-optimized",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlagBundle {
    pub debug_symbols: bool,
    pub autofdo_instrumentation: bool,
    pub autofdo_applied: bool,
    pub propeller_instrumentation: bool,
    pub propeller_applied: bool,
}

/// Throughput-oriented scheduler/tick/preemption defaults fixed per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleDefaults {
    pub cpusched: &'static str,
    pub hz_ticks: u32,
    pub tickrate: &'static str,
    pub preempt: &'static str,
    pub hugepage: &'static str,
}

// Every pass profiles or ships the same scheduling configuration; a profile
// sampled under one preemption model does not describe another.
const THROUGHPUT_SCHEDULE: ScheduleDefaults = ScheduleDefaults {
    cpusched: "bore",
    hz_ticks: 1000,
    tickrate: "full",
    preempt: "full",
    hugepage: "always",
};

/// Toolchain workarounds that may change as compilers catch up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolvePolicy {
    /// Build the AutoFDO-optimized kernel with Propeller instrumentation.
    /// Off by default: the combination currently trips a toolchain defect.
    pub propeller_instrumentation_in_autofdo: bool,
}

impl BuildMode {
    pub fn flags(self, policy: ResolvePolicy) -> FlagBundle {
        match self {
            BuildMode::Collection => FlagBundle {
                debug_symbols: true,
                autofdo_instrumentation: true,
                ..FlagBundle::default()
            },
            BuildMode::AutoFdoOptimized => FlagBundle {
                debug_symbols: true,
                autofdo_applied: true,
                propeller_instrumentation: policy.propeller_instrumentation_in_autofdo,
                ..FlagBundle::default()
            },
            BuildMode::PropellerOptimized => FlagBundle {
                debug_symbols: false,
                autofdo_applied: true,
                propeller_applied: true,
                ..FlagBundle::default()
            },
        }
    }

    pub fn schedule(self) -> ScheduleDefaults {
        match self {
            BuildMode::Collection | BuildMode::AutoFdoOptimized | BuildMode::PropellerOptimized => {
                THROUGHPUT_SCHEDULE
            }
        }
    }

    pub fn next_step_hint(self) -> &'static str {
        match self {
            BuildMode::Collection => {
                "install this kernel, record an AutoFDO profile under load, then rerun with PGOFORGE_AUTOFDO_PROFILE"
            }
            BuildMode::AutoFdoOptimized => {
                "install this kernel, record Propeller profiles, then rerun with PGOFORGE_PROPELLER_CC_PROFILE and PGOFORGE_PROPELLER_LD_PROFILE"
            }
            BuildMode::PropellerOptimized => "final production kernel; no further profiling pass",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub mode: BuildMode,
    pub flags: FlagBundle,
    pub schedule: ScheduleDefaults,
    pub profiles: BuildProfileSet,
}

pub fn resolve(profiles: &BuildProfileSet) -> Result<BuildPlan, ConfigError> {
    resolve_with(profiles, ResolvePolicy::default())
}

pub fn resolve_with(
    profiles: &BuildProfileSet,
    policy: ResolvePolicy,
) -> Result<BuildPlan, ConfigError> {
    let cc = profiles.propeller_cc.is_some();
    let ld = profiles.propeller_ld.is_some();

    if cc != ld {
        let (present, missing) = if cc {
            (ProfileSlot::PropellerCc, ProfileSlot::PropellerLd)
        } else {
            (ProfileSlot::PropellerLd, ProfileSlot::PropellerCc)
        };
        return Err(ConfigError::IncompleteProfilePair {
            present: present.env_var(),
            missing: missing.env_var(),
        });
    }

    if cc && profiles.autofdo.is_none() {
        return Err(ConfigError::MissingPrerequisiteProfile {
            present: vec![
                ProfileSlot::PropellerCc.env_var(),
                ProfileSlot::PropellerLd.env_var(),
            ],
        });
    }

    let mode = match (profiles.autofdo.is_some(), cc) {
        (false, _) => BuildMode::Collection,
        (true, false) => BuildMode::AutoFdoOptimized,
        (true, true) => BuildMode::PropellerOptimized,
    };

    Ok(BuildPlan {
        mode,
        flags: mode.flags(policy),
        schedule: mode.schedule(),
        profiles: profiles.clone(),
    })
}

/// Operator choices from `[kernel.options]`; each one replaces the matching
/// mode default or is left to the descriptor when unset.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct KernelOptions {
    pub cpusched: Option<String>,
    pub hz_ticks: Option<u32>,
    pub tickrate: Option<String>,
    pub preempt: Option<String>,
    pub hugepage: Option<String>,
    pub cpu_target: Option<String>,
    pub lto: Option<String>,
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl BuildPlan {
    /// Descriptor variables this plan injects, keyed by variable name.
    pub fn intended_assignments(
        &self,
        opts: &KernelOptions,
        module_overlay: Option<bool>,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut set = |k: &str, v: String| {
            out.insert(k.to_string(), v);
        };
        let f = &self.flags;

        set(vars::BUILD_DEBUG, yes_no(f.debug_symbols).into());
        set(
            vars::AUTOFDO,
            yes_no(f.autofdo_instrumentation || f.autofdo_applied).into(),
        );
        set(
            vars::PROPELLER,
            yes_no(f.propeller_instrumentation || f.propeller_applied).into(),
        );
        if f.autofdo_applied
            && let Some(p) = &self.profiles.autofdo
        {
            set(vars::AUTOFDO_PROFILE, p.display().to_string());
        }
        if f.propeller_applied {
            if let Some(p) = &self.profiles.propeller_cc {
                set(vars::PROPELLER_CC_PROFILE, p.display().to_string());
            }
            if let Some(p) = &self.profiles.propeller_ld {
                set(vars::PROPELLER_LD_PROFILE, p.display().to_string());
            }
        }

        let s = &self.schedule;
        set(
            vars::CPUSCHED,
            non_empty(&opts.cpusched).unwrap_or(s.cpusched).to_string(),
        );
        set(
            vars::HZ_TICKS,
            opts.hz_ticks.unwrap_or(s.hz_ticks).to_string(),
        );
        set(
            vars::TICKRATE,
            non_empty(&opts.tickrate).unwrap_or(s.tickrate).to_string(),
        );
        set(
            vars::PREEMPT,
            non_empty(&opts.preempt).unwrap_or(s.preempt).to_string(),
        );
        set(
            vars::HUGEPAGE,
            non_empty(&opts.hugepage).unwrap_or(s.hugepage).to_string(),
        );
        if let Some(t) = non_empty(&opts.cpu_target) {
            set(vars::PROCESSOR_OPT, t.to_string());
        }
        if let Some(l) = non_empty(&opts.lto) {
            set(vars::LLVM_LTO, l.to_string());
        }
        if let Some(enabled) = module_overlay {
            set(vars::MODULE_OVERLAY, yes_no(enabled).into());
        }
        out
    }

    /// Human-readable lines shown at the confirmation gate.
    pub fn summary_lines(&self) -> Vec<String> {
        let f = &self.flags;
        let s = &self.schedule;
        let mut lines = vec![
            format!("mode: {}", self.mode),
            format!("  debug symbols:             {}", yes_no(f.debug_symbols)),
            format!("  autofdo instrumentation:   {}", yes_no(f.autofdo_instrumentation)),
            format!("  autofdo profile applied:   {}", yes_no(f.autofdo_applied)),
            format!("  propeller instrumentation: {}", yes_no(f.propeller_instrumentation)),
            format!("  propeller profile applied: {}", yes_no(f.propeller_applied)),
            format!(
                "schedule: cpusched={} hz={} tickrate={} preempt={} hugepage={}",
                s.cpusched, s.hz_ticks, s.tickrate, s.preempt, s.hugepage
            ),
        ];
        for (slot, path) in self.profiles.present() {
            lines.push(format!("profile {}: {}", slot.env_var(), path.display()));
        }
        lines.push(format!("next: {}", self.mode.next_step_hint()));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(autofdo: bool, cc: bool, ld: bool) -> BuildProfileSet {
        BuildProfileSet {
            autofdo: autofdo.then(|| PathBuf::from("/p/kernel.afdo")),
            propeller_cc: cc.then(|| PathBuf::from("/p/propeller_cc_profile.txt")),
            propeller_ld: ld.then(|| PathBuf::from("/p/propeller_ld_profile.txt")),
        }
    }

    #[test]
    fn no_profiles_is_collection() {
        let plan = resolve(&set(false, false, false)).expect("resolve");
        assert_eq!(plan.mode, BuildMode::Collection);
        assert!(plan.flags.debug_symbols);
        assert!(plan.flags.autofdo_instrumentation);
        assert!(!plan.flags.propeller_instrumentation);
        assert!(!plan.flags.autofdo_applied);
    }

    #[test]
    fn autofdo_only_keeps_debug_symbols() {
        let plan = resolve(&set(true, false, false)).expect("resolve");
        assert_eq!(plan.mode, BuildMode::AutoFdoOptimized);
        assert!(plan.flags.debug_symbols);
        assert!(plan.flags.autofdo_applied);
        assert!(!plan.flags.propeller_instrumentation);
    }

    #[test]
    fn full_set_is_propeller_without_debug_symbols() {
        let plan = resolve(&set(true, true, true)).expect("resolve");
        assert_eq!(plan.mode, BuildMode::PropellerOptimized);
        assert!(!plan.flags.debug_symbols);
        assert!(plan.flags.autofdo_applied);
        assert!(plan.flags.propeller_applied);
    }

    #[test]
    fn lone_propeller_profile_is_rejected_as_incomplete_pair() {
        let err = resolve(&set(false, true, false)).expect_err("must fail");
        assert_eq!(
            err,
            ConfigError::IncompleteProfilePair {
                present: "PGOFORGE_PROPELLER_CC_PROFILE",
                missing: "PGOFORGE_PROPELLER_LD_PROFILE",
            }
        );
        assert_eq!(
            err.kind(),
            crate::error::ErrorKind::InvalidProfileCombination
        );

        let err = resolve(&set(true, false, true)).expect_err("must fail");
        assert!(matches!(err, ConfigError::IncompleteProfilePair { .. }));
    }

    #[test]
    fn propeller_pair_without_autofdo_is_rejected() {
        let err = resolve(&set(false, true, true)).expect_err("must fail");
        assert!(matches!(err, ConfigError::MissingPrerequisiteProfile { .. }));
        assert!(err.to_string().contains("PGOFORGE_PROPELLER_CC_PROFILE"));
    }

    #[test]
    fn serialized_mode_names_match_display() {
        for mode in [
            BuildMode::Collection,
            BuildMode::AutoFdoOptimized,
            BuildMode::PropellerOptimized,
        ] {
            let json = serde_json::to_value(mode).expect("serialize");
            assert_eq!(json, serde_json::Value::String(mode.to_string()));
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let profiles = set(true, true, true);
        assert_eq!(resolve(&profiles), resolve(&profiles));
    }

    #[test]
    fn policy_enables_propeller_instrumentation_mid_pipeline() {
        let policy = ResolvePolicy {
            propeller_instrumentation_in_autofdo: true,
        };
        let plan = resolve_with(&set(true, false, false), policy).expect("resolve");
        assert!(plan.flags.propeller_instrumentation);
        let plan = resolve_with(&set(false, false, false), policy).expect("resolve");
        assert!(!plan.flags.propeller_instrumentation);
    }

    #[test]
    fn intended_assignments_follow_mode_and_options() {
        let plan = resolve(&set(true, true, true)).expect("resolve");
        let opts = KernelOptions {
            cpusched: Some("eevdf".into()),
            cpu_target: Some("zen4".into()),
            ..KernelOptions::default()
        };
        let vars = plan.intended_assignments(&opts, Some(true));
        assert_eq!(vars.get("_build_debug").map(String::as_str), Some("no"));
        assert_eq!(vars.get("_autofdo").map(String::as_str), Some("yes"));
        assert_eq!(vars.get("_propeller").map(String::as_str), Some("yes"));
        assert_eq!(
            vars.get("_autofdo_profile_name").map(String::as_str),
            Some("/p/kernel.afdo")
        );
        assert_eq!(vars.get("_cpusched").map(String::as_str), Some("eevdf"));
        assert_eq!(vars.get("_HZ_ticks").map(String::as_str), Some("1000"));
        assert_eq!(vars.get("_processor_opt").map(String::as_str), Some("zen4"));
        assert_eq!(vars.get("_module_overlay").map(String::as_str), Some("yes"));
        assert!(!vars.contains_key("_use_llvm_lto"));
    }

    #[test]
    fn collection_injects_no_profile_paths() {
        let plan = resolve(&set(false, false, false)).expect("resolve");
        let vars = plan.intended_assignments(&KernelOptions::default(), None);
        assert_eq!(vars.get("_autofdo").map(String::as_str), Some("yes"));
        assert_eq!(vars.get("_propeller").map(String::as_str), Some("no"));
        assert!(!vars.contains_key("_autofdo_profile_name"));
        assert!(!vars.contains_key("_module_overlay"));
    }
}
