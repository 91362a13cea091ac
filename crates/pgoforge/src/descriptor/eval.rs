use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::Serialize;

use super::{CHECKSUM_ARRAYS, Descriptor, SOURCE_ARRAY, Stmt};
use crate::error::{Error, Result};

/// What a caller wants read back out of an evaluated descriptor.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub vars: Vec<String>,
    pub arrays: Vec<String>,
}

impl Probe {
    /// Every intended variable, every declared default, `source` and all known checksum arrays.
    pub fn for_descriptor(desc: &Descriptor, intended: &BTreeMap<String, String>) -> Self {
        let mut vars: Vec<String> = intended.keys().cloned().collect();
        for name in desc.declared_defaults().into_keys() {
            if !vars.contains(&name) {
                vars.push(name);
            }
        }
        vars.sort();
        let arrays = std::iter::once(SOURCE_ARRAY)
            .chain(CHECKSUM_ARRAYS.iter().copied())
            .map(str::to_string)
            .collect();
        Self { vars, arrays }
    }
}

/// Variable values and array contents as the descriptor sees them after evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DescriptorSnapshot {
    pub vars: BTreeMap<String, String>,
    pub arrays: BTreeMap<String, Vec<String>>,
    /// Non-zero status or stderr output from sourcing the descriptor.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DescriptorSnapshot {
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn array(&self, name: &str) -> &[String] {
        self.arrays.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn sources(&self) -> &[String] {
        self.array(SOURCE_ARRAY)
    }

    /// `preferred` if given, else the first known checksum array with entries.
    pub fn checksum_array_name(&self, preferred: Option<&str>) -> Option<String> {
        if let Some(p) = preferred {
            return Some(p.to_string());
        }
        CHECKSUM_ARRAYS
            .iter()
            .find(|c| !self.array(c).is_empty())
            .map(|c| c.to_string())
    }
}

pub trait DescriptorEvaluator {
    fn name(&self) -> &'static str;

    /// Evaluates `desc` with `intended` pre-set, the way the external builder would.
    fn evaluate(
        &self,
        desc: &Descriptor,
        intended: &BTreeMap<String, String>,
        probe: &Probe,
    ) -> Result<DescriptorSnapshot>;
}

/// In-process emulation over the statically parsed descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEvaluator;

impl StaticEvaluator {
    fn run(
        stmts: &[Stmt],
        env: &mut BTreeMap<String, String>,
        arrays: &mut BTreeMap<String, Vec<String>>,
    ) {
        for stmt in stmts {
            match stmt {
                Stmt::Default { name, value } => {
                    if env.get(name).is_none_or(|v| v.is_empty()) {
                        let v = value.expand(env);
                        env.insert(name.clone(), v);
                    }
                }
                Stmt::Assign { name, value } => {
                    let v = value.expand(env);
                    env.insert(name.clone(), v);
                }
                Stmt::Array {
                    name,
                    append,
                    items,
                } => {
                    let expanded: Vec<String> = items.iter().map(|w| w.expand(env)).collect();
                    let slot = arrays.entry(name.clone()).or_default();
                    if !append {
                        slot.clear();
                    }
                    slot.extend(expanded);
                }
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = if cond.eval(env) { then } else { otherwise };
                    Self::run(branch, env, arrays);
                }
            }
        }
    }
}

impl DescriptorEvaluator for StaticEvaluator {
    fn name(&self) -> &'static str {
        "static"
    }

    fn evaluate(
        &self,
        desc: &Descriptor,
        intended: &BTreeMap<String, String>,
        probe: &Probe,
    ) -> Result<DescriptorSnapshot> {
        let mut env = intended.clone();
        let mut arrays = BTreeMap::new();
        Self::run(&desc.stmts, &mut env, &mut arrays);

        let vars = probe
            .vars
            .iter()
            .filter_map(|n| env.get(n).map(|v| (n.clone(), v.clone())))
            .collect();
        let arrays = probe
            .arrays
            .iter()
            .map(|n| (n.clone(), arrays.remove(n).unwrap_or_default()))
            .collect();
        Ok(DescriptorSnapshot {
            vars,
            arrays,
            warnings: Vec::new(),
        })
    }
}

const PROBE_SCRIPT: &str = r#"__pgf_file="$1"; shift
__pgf_items=("$@")
__pgf_errf="$(mktemp 2>/dev/null)" || __pgf_errf=""
shopt -s expand_aliases
alias exit=return
source "./$__pgf_file" >/dev/null 2>"${__pgf_errf:-/dev/null}"
__pgf_rc=$?
unalias exit
__pgf_err=""
if [ -n "$__pgf_errf" ]; then
  __pgf_err="$(<"$__pgf_errf")"
  rm -f "$__pgf_errf"
fi
printf 'S\0%s\0%s\0' "$__pgf_rc" "$__pgf_err"
for __pgf_item in "${__pgf_items[@]}"; do
  __pgf_name="${__pgf_item#?:}"
  case "$__pgf_item" in
    V:*)
      if [ -n "${!__pgf_name+x}" ]; then
        printf 'V\0%s\0%s\0' "$__pgf_name" "${!__pgf_name}"
      fi
      ;;
    A:*)
      declare -n __pgf_ref="$__pgf_name"
      printf 'A\0%s\0%s\0' "$__pgf_name" "${#__pgf_ref[@]}"
      for __pgf_el in "${__pgf_ref[@]}"; do printf '%s\0' "$__pgf_el"; done
      unset -n __pgf_ref
      ;;
  esac
done
"#;

/// Sources the descriptor in a child `bash` with a cleared environment.
#[derive(Debug, Clone)]
pub struct ShellEvaluator {
    pub shell: PathBuf,
}

impl Default for ShellEvaluator {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("bash"),
        }
    }
}

impl DescriptorEvaluator for ShellEvaluator {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn evaluate(
        &self,
        desc: &Descriptor,
        intended: &BTreeMap<String, String>,
        probe: &Probe,
    ) -> Result<DescriptorSnapshot> {
        let file = desc
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::msg(format!(
                    "descriptor path has no file name: {}",
                    desc.path.display()
                ))
            })?;

        let mut cmd = Command::new(&self.shell);
        cmd.args(["--noprofile", "--norc", "-c", PROBE_SCRIPT, "pgoforge-probe", file])
            .args(probe.vars.iter().map(|v| format!("V:{v}")))
            .args(probe.arrays.iter().map(|a| format!("A:{a}")))
            .current_dir(desc.dir())
            .env_clear()
            .env(
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| "/usr/bin:/bin".into()),
            )
            .env("LANG", "C")
            .stdin(Stdio::null());
        if let Some(home) = std::env::var_os("HOME") {
            cmd.env("HOME", home);
        }
        for (k, v) in intended {
            cmd.env(k, v);
        }

        tracing::debug!(descriptor = %desc.path.display(), vars = probe.vars.len(), "evaluating descriptor in child shell");
        let out = cmd.output().map_err(|e| {
            Error::msg(format!(
                "failed to spawn {} to evaluate descriptor: {e}",
                self.shell.display()
            ))
        })?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "descriptor evaluation exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        parse_probe_output(&out.stdout)
    }
}

fn parse_probe_output(raw: &[u8]) -> Result<DescriptorSnapshot> {
    let mut fields = raw
        .split(|b| *b == 0)
        .map(|f| String::from_utf8_lossy(f).into_owned());
    let mut snap = DescriptorSnapshot::default();
    let truncated = || Error::msg("descriptor evaluation output is truncated");

    while let Some(tag) = fields.next() {
        match tag.as_str() {
            "" => continue,
            "S" => {
                let status = fields.next().ok_or_else(truncated)?;
                let stderr = fields.next().ok_or_else(truncated)?;
                if status != "0" {
                    snap.warnings
                        .push(format!("sourcing the descriptor returned status {status}"));
                }
                snap.warnings.extend(
                    stderr
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(|l| format!("descriptor stderr: {l}")),
                );
            }
            "V" => {
                let name = fields.next().ok_or_else(truncated)?;
                let value = fields.next().ok_or_else(truncated)?;
                snap.vars.insert(name, value);
            }
            "A" => {
                let name = fields.next().ok_or_else(truncated)?;
                let count: usize = fields
                    .next()
                    .ok_or_else(truncated)?
                    .parse()
                    .map_err(|_| Error::msg(format!("bad element count for array '{name}'")))?;
                let items = (0..count)
                    .map(|_| fields.next().ok_or_else(truncated))
                    .collect::<Result<Vec<_>>>()?;
                snap.arrays.insert(name, items);
            }
            other => {
                return Err(Error::msg(format!(
                    "unexpected record '{other}' in descriptor evaluation output"
                )));
            }
        }
    }
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const DESC: &str = r#"
: "${_cpusched:=eevdf}"
: "${_autofdo:=no}"
: "${_autofdo_profile_name:=}"
_tickrate=periodic

source=("linux.tar.xz" "config")
sha256sums=('aaa' 'bbb')
if [[ -n "$_autofdo_profile_name" ]]; then
    source+=("$_autofdo_profile_name")
    sha256sums+=('SKIP')
fi
"#;

    fn intended(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn static_honors_assign_if_unset_and_guards() {
        let desc = Descriptor::parse(Path::new("PKGBUILD"), DESC).expect("parse");
        let want = intended(&[
            ("_cpusched", "bore"),
            ("_autofdo_profile_name", "/p/kernel.afdo"),
            ("_tickrate", "full"),
        ]);
        let probe = Probe::for_descriptor(&desc, &want);
        let snap = StaticEvaluator.evaluate(&desc, &want, &probe).expect("eval");

        assert_eq!(snap.var("_cpusched"), Some("bore"));
        assert_eq!(snap.var("_autofdo"), Some("no"));
        // Plain assignment clobbers the injected value.
        assert_eq!(snap.var("_tickrate"), Some("periodic"));
        assert_eq!(snap.sources(), ["linux.tar.xz", "config", "/p/kernel.afdo"]);
        assert_eq!(snap.checksum_array_name(None).as_deref(), Some("sha256sums"));
        assert_eq!(snap.array("sha256sums").len(), 3);
    }

    #[test]
    fn empty_injected_value_falls_back_to_default() {
        let desc = Descriptor::parse(Path::new("PKGBUILD"), DESC).expect("parse");
        let want = intended(&[("_cpusched", "")]);
        let probe = Probe::for_descriptor(&desc, &want);
        let snap = StaticEvaluator.evaluate(&desc, &want, &probe).expect("eval");
        assert_eq!(snap.var("_cpusched"), Some("eevdf"));
        assert_eq!(snap.sources().len(), 2);
    }

    #[test]
    fn parses_evaluation_records() {
        let raw = b"V\0_cpusched\0bore\0A\0source\x002\0a\0b\0A\0b2sums\x000\0";
        let snap = parse_probe_output(raw).expect("parse");
        assert_eq!(snap.var("_cpusched"), Some("bore"));
        assert_eq!(snap.sources(), ["a", "b"]);
        assert!(snap.array("b2sums").is_empty());
        assert!(snap.warnings.is_empty());

        assert!(parse_probe_output(b"A\0source\x003\0a\0").is_err());

        let snap = parse_probe_output(b"S\x001\0line one\n\nline two\0").expect("parse");
        assert_eq!(
            snap.warnings,
            [
                "sourcing the descriptor returned status 1",
                "descriptor stderr: line one",
                "descriptor stderr: line two",
            ]
        );
    }

    #[test]
    fn shell_and_static_agree() {
        if Command::new("bash").arg("--version").output().is_err() {
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("PKGBUILD");
        std::fs::write(&path, DESC).expect("write descriptor");
        let desc = Descriptor::load(&path).expect("load");
        let want = intended(&[
            ("_cpusched", "bore"),
            ("_autofdo_profile_name", "/p/kernel.afdo"),
            ("_tickrate", "full"),
        ]);
        let probe = Probe::for_descriptor(&desc, &want);

        let shell = ShellEvaluator::default()
            .evaluate(&desc, &want, &probe)
            .expect("shell eval");
        let emulated = StaticEvaluator.evaluate(&desc, &want, &probe).expect("static eval");
        assert_eq!(shell, emulated);
    }

    #[test]
    fn shell_reports_failed_sourcing() {
        if Command::new("bash").arg("--version").output().is_err() {
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("PKGBUILD");
        let src = ": \"${_cpusched:=eevdf}\"\necho 'missing toolchain' >&2\nexit 1\n_cpusched=never\n";
        std::fs::write(&path, src).expect("write descriptor");
        let desc = Descriptor::load_lenient(&path).expect("load");
        let want = intended(&[("_cpusched", "bore")]);
        let probe = Probe::for_descriptor(&desc, &want);

        let snap = ShellEvaluator::default()
            .evaluate(&desc, &want, &probe)
            .expect("shell eval");
        // Evaluation stops at `exit` without killing the reader.
        assert_eq!(snap.var("_cpusched"), Some("bore"));
        assert!(
            snap.warnings
                .iter()
                .any(|w| w == "sourcing the descriptor returned status 1"),
            "{:?}",
            snap.warnings
        );
        assert!(
            snap.warnings
                .iter()
                .any(|w| w == "descriptor stderr: missing toolchain"),
            "{:?}",
            snap.warnings
        );
    }
}
