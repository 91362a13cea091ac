//! Environment-variable and `--set` overrides layered over a build definition.

use std::collections::BTreeMap;

use toml::Value;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnobKind {
    /// Free-form string (paths, CPU targets).
    Text,
    /// Literal `yes` / `no`.
    YesNo,
    /// One of a fixed set of strings.
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct EnvKnob {
    pub env: &'static str,
    pub path: &'static str,
    pub kind: KnobKind,
}

pub const CPUSCHED_CHOICES: &[&str] = &[
    "cachyos",
    "bore",
    "eevdf",
    "bmq",
    "rt",
    "rt-bore",
    "hardened",
    "sched-ext",
];
pub const LTO_CHOICES: &[&str] = &["none", "thin", "full"];

pub const ENV_KNOBS: &[EnvKnob] = &[
    EnvKnob {
        env: "PGOFORGE_AUTOFDO_PROFILE",
        path: "kernel.profiles.autofdo",
        kind: KnobKind::Text,
    },
    EnvKnob {
        env: "PGOFORGE_PROPELLER_CC_PROFILE",
        path: "kernel.profiles.propeller_cc",
        kind: KnobKind::Text,
    },
    EnvKnob {
        env: "PGOFORGE_PROPELLER_LD_PROFILE",
        path: "kernel.profiles.propeller_ld",
        kind: KnobKind::Text,
    },
    EnvKnob {
        env: "PGOFORGE_CPUSCHED",
        path: "kernel.options.cpusched",
        kind: KnobKind::Choice(CPUSCHED_CHOICES),
    },
    EnvKnob {
        env: "PGOFORGE_CPU_TARGET",
        path: "kernel.options.cpu_target",
        kind: KnobKind::Text,
    },
    EnvKnob {
        env: "PGOFORGE_LTO",
        path: "kernel.options.lto",
        kind: KnobKind::Choice(LTO_CHOICES),
    },
    EnvKnob {
        env: "PGOFORGE_PATCH",
        path: "kernel.patch",
        kind: KnobKind::Text,
    },
    EnvKnob {
        env: "PGOFORGE_MODULE_OVERLAY",
        path: "overlay.enabled",
        kind: KnobKind::YesNo,
    },
    EnvKnob {
        env: "PGOFORGE_PROPELLER_IN_AUTOFDO",
        path: "kernel.policy.propeller_instrumentation_in_autofdo",
        kind: KnobKind::YesNo,
    },
];

pub fn parse_yes_no(raw: &str) -> Option<bool> {
    match raw.trim() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

pub fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

fn knob_value(origin: &str, kind: KnobKind, raw: &str) -> Result<Value> {
    let raw = raw.trim();
    match kind {
        KnobKind::Text => Ok(Value::String(raw.to_string())),
        KnobKind::YesNo => parse_yes_no(raw).map(Value::Boolean).ok_or_else(|| {
            Error::msg(format!("{origin} must be 'yes' or 'no', got '{raw}'"))
        }),
        KnobKind::Choice(choices) => {
            if choices.contains(&raw) {
                Ok(Value::String(raw.to_string()))
            } else {
                Err(Error::msg(format!(
                    "{origin} value '{raw}' is not one of [{}]",
                    choices.join(", ")
                )))
            }
        }
    }
}

/// Applies every known `PGOFORGE_*` variable that `lookup` reports as set and non-empty.
///
/// Returns the variable names that were applied.
pub fn apply_env_overrides<F>(doc: &mut ConfigDoc, lookup: F) -> Result<Vec<&'static str>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = Vec::new();
    for knob in ENV_KNOBS {
        let Some(raw) = lookup(knob.env) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }
        let value = knob_value(knob.env, knob.kind, &raw)?;
        doc.set_path(knob.path, value)?;
        applied.push(knob.env);
    }
    Ok(applied)
}

pub fn apply_process_env(doc: &mut ConfigDoc) -> Result<Vec<&'static str>> {
    apply_env_overrides(doc, |name| std::env::var(name).ok())
}

fn parse_set_args(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for item in raw {
        let Some((k, v)) = item.trim().split_once('=') else {
            return Err(Error::msg(format!(
                "invalid --set value '{item}'; expected PATH=VALUE"
            )));
        };
        let key = k.trim();
        if key.is_empty() {
            return Err(Error::msg(format!("invalid --set value '{item}'; path is empty")));
        }
        out.insert(key.to_string(), v.trim().to_string());
    }
    Ok(out)
}

fn infer_value(raw: &str) -> Value {
    if let Some(b) = parse_yes_no(raw) {
        return Value::Boolean(b);
    }
    match raw {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => raw
            .parse::<i64>()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

/// Applies `--set path=value` overrides. Paths backed by a known knob are
/// validated like their environment variable; other paths infer bool/int/string.
pub fn apply_cli_overrides(doc: &mut ConfigDoc, raw: &[String]) -> Result<()> {
    for (path, v) in parse_set_args(raw)? {
        let value = match ENV_KNOBS.iter().find(|k| k.path == path) {
            Some(knob) => knob_value(&format!("--set {path}"), knob.kind, &v)?,
            None => infer_value(&v),
        };
        doc.set_path(&path, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn env_overrides_land_at_config_paths() {
        let mut doc = ConfigDoc::from_toml("<mem>", "[kernel.options]\ncpusched = \"eevdf\"\n")
            .expect("doc");
        let applied = apply_env_overrides(
            &mut doc,
            lookup(&[
                ("PGOFORGE_AUTOFDO_PROFILE", "/profiles/kernel.afdo"),
                ("PGOFORGE_CPUSCHED", "bore"),
                ("PGOFORGE_MODULE_OVERLAY", "no"),
                ("PGOFORGE_PATCH", "   "),
            ]),
        )
        .expect("apply");

        assert_eq!(
            applied,
            vec![
                "PGOFORGE_AUTOFDO_PROFILE",
                "PGOFORGE_CPUSCHED",
                "PGOFORGE_MODULE_OVERLAY"
            ]
        );
        assert_eq!(
            doc.value_path("kernel.options.cpusched").and_then(Value::as_str),
            Some("bore")
        );
        assert_eq!(
            doc.value_path("overlay.enabled").and_then(Value::as_bool),
            Some(false)
        );
        assert!(doc.value_path("kernel.patch").is_none());
    }

    #[test]
    fn boolean_env_accepts_only_yes_no() {
        let mut doc = ConfigDoc::from_toml("<mem>", "").expect("doc");
        let err = apply_env_overrides(&mut doc, lookup(&[("PGOFORGE_MODULE_OVERLAY", "true")]))
            .expect_err("must fail");
        assert!(err.to_string().contains("PGOFORGE_MODULE_OVERLAY"));
    }

    #[test]
    fn choice_env_rejects_unknown_scheduler() {
        let mut doc = ConfigDoc::from_toml("<mem>", "").expect("doc");
        let err = apply_env_overrides(&mut doc, lookup(&[("PGOFORGE_CPUSCHED", "cfs")]))
            .expect_err("must fail");
        assert!(err.to_string().contains("not one of"), "unexpected err: {err}");
    }

    #[test]
    fn choice_env_accepts_default_and_sched_ext_schedulers() {
        for sched in ["cachyos", "sched-ext"] {
            let mut doc = ConfigDoc::from_toml("<mem>", "").expect("doc");
            apply_env_overrides(&mut doc, lookup(&[("PGOFORGE_CPUSCHED", sched)])).expect(sched);
            assert_eq!(
                doc.value_path("kernel.options.cpusched").and_then(Value::as_str),
                Some(sched)
            );
        }
    }

    #[test]
    fn cli_overrides_validate_known_paths_and_infer_others() {
        let mut doc = ConfigDoc::from_toml("<mem>", "").expect("doc");
        apply_cli_overrides(
            &mut doc,
            &[
                "kernel.options.lto=full".into(),
                "kernel.min_free_gib=12".into(),
                "kernel.allow_root=yes".into(),
            ],
        )
        .expect("apply");
        assert_eq!(
            doc.value_path("kernel.options.lto").and_then(Value::as_str),
            Some("full")
        );
        assert_eq!(
            doc.value_path("kernel.min_free_gib").and_then(Value::as_integer),
            Some(12)
        );
        assert_eq!(
            doc.value_path("kernel.allow_root").and_then(Value::as_bool),
            Some(true)
        );

        let err = apply_cli_overrides(&mut doc, &["oops".into()]).expect_err("bad syntax");
        assert!(err.to_string().contains("expected PATH=VALUE"));
    }
}
