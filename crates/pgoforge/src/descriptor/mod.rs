//! Static inspection of the external build descriptor (a shell-syntax
//! package recipe). Only the top-level subset that decides build inputs and
//! variable defaults is understood:
//!
//! - assign-if-unset defaults: `: "${_name:=value}"`
//! - plain assignments: `name=value`
//! - arrays and appends: `source=(...)`, `b2sums+=(...)`
//! - `if`/`elif`/`else` around those, guarded by single `[ ]`/`[[ ]]` tests
//!
//! Function bodies and `case`/loop blocks are skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

pub mod eval;

pub use eval::{DescriptorEvaluator, DescriptorSnapshot, Probe, ShellEvaluator, StaticEvaluator};

/// Variable names the orchestrator injects.
pub mod vars {
    pub const BUILD_DEBUG: &str = "_build_debug";
    pub const AUTOFDO: &str = "_autofdo";
    pub const AUTOFDO_PROFILE: &str = "_autofdo_profile_name";
    pub const PROPELLER: &str = "_propeller";
    pub const PROPELLER_CC_PROFILE: &str = "_propeller_cc_profile";
    pub const PROPELLER_LD_PROFILE: &str = "_propeller_ld_profile";
    pub const CPUSCHED: &str = "_cpusched";
    pub const HZ_TICKS: &str = "_HZ_ticks";
    pub const TICKRATE: &str = "_tickrate";
    pub const PREEMPT: &str = "_preempt";
    pub const HUGEPAGE: &str = "_hugepage";
    pub const PROCESSOR_OPT: &str = "_processor_opt";
    pub const LLVM_LTO: &str = "_use_llvm_lto";
    pub const MODULE_OVERLAY: &str = "_module_overlay";
    pub const CUSTOM_PATCH: &str = "_custom_patch";
}

pub const SOURCE_ARRAY: &str = "source";
pub const CHECKSUM_ARRAYS: &[&str] = &["sha256sums", "sha512sums", "b2sums", "md5sums", "cksums"];

/// A shell word. `literal` words were fully single-quoted and never expand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub raw: String,
    pub literal: bool,
}

impl Word {
    fn new(raw: impl Into<String>, literal: bool) -> Self {
        Self {
            raw: raw.into(),
            literal,
        }
    }

    pub fn expand(&self, env: &BTreeMap<String, String>) -> String {
        if self.literal {
            self.raw.clone()
        } else {
            expand_vars(&self.raw, env)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    NonEmpty(Word),
    Empty(Word),
    Eq(Word, Word),
    Ne(Word, Word),
}

impl Cond {
    pub fn eval(&self, env: &BTreeMap<String, String>) -> bool {
        match self {
            Cond::NonEmpty(w) => !w.expand(env).is_empty(),
            Cond::Empty(w) => w.expand(env).is_empty(),
            Cond::Eq(a, b) => a.expand(env) == b.expand(env),
            Cond::Ne(a, b) => a.expand(env) != b.expand(env),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// `: "${name:=value}"`
    Default { name: String, value: Word },
    /// `name=value`
    Assign { name: String, value: Word },
    /// `name=(...)` or `name+=(...)`
    Array {
        name: String,
        append: bool,
        items: Vec<Word>,
    },
    If {
        cond: Cond,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
}

#[derive(Debug, Clone)]
pub struct Descriptor {
    pub path: PathBuf,
    pub stmts: Vec<Stmt>,
}

impl Descriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let src = fs::read_to_string(path).map_err(|e| {
            Error::msg(format!(
                "failed to read build descriptor {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(path, &src)
    }

    pub fn parse(path: &Path, src: &str) -> Result<Self> {
        let lines = join_continuations(src);
        let mut it = lines.iter().map(String::as_str).enumerate().peekable();
        let (stmts, end) = parse_block(&mut it, &[])?;
        if let Some(term) = end {
            return Err(Error::msg(format!(
                "{}: unexpected '{term}' at top level",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            stmts,
        })
    }

    /// Reads `path` leniently; see [`Descriptor::scan`].
    pub fn load_lenient(path: &Path) -> Result<Self> {
        let src = fs::read_to_string(path).map_err(|e| {
            Error::msg(format!(
                "failed to read build descriptor {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self::scan(path, &src))
    }

    /// Collects `:=` defaults and plain scalar assignments line by line, ignoring
    /// control flow. Never fails; only the shell evaluator should rely on it.
    pub fn scan(path: &Path, src: &str) -> Self {
        let lines = join_continuations(src);
        let mut it = lines.iter().map(String::as_str).enumerate().peekable();
        let mut stmts = Vec::new();
        while let Some((_, raw)) = it.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if function_re().is_match(line) {
                skip_function(line, &mut it);
                continue;
            }
            if let Some(caps) = default_re().captures(line) {
                let value = first_word(caps[2].trim());
                stmts.push(Stmt::Default {
                    name: caps[1].to_string(),
                    value,
                });
                continue;
            }
            if let Some(caps) = assign_re().captures(line) {
                let rest = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
                if &caps[2] == "+" || rest.starts_with('(') {
                    continue;
                }
                stmts.push(Stmt::Assign {
                    name: caps[1].to_string(),
                    value: first_word(rest),
                });
            }
        }
        Self {
            path: path.to_path_buf(),
            stmts,
        }
    }

    /// Assign-if-unset defaults, first declaration wins.
    pub fn declared_defaults(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        walk(&self.stmts, &mut |s| {
            if let Stmt::Default { name, value } = s {
                out.entry(name.clone()).or_insert_with(|| value.raw.clone());
            }
        });
        out
    }

    /// Names assigned unconditionally somewhere, i.e. not via `:=`.
    pub fn plain_assignments(&self) -> Vec<String> {
        let mut out = Vec::new();
        walk(&self.stmts, &mut |s| {
            if let Stmt::Assign { name, .. } = s
                && !out.contains(name)
            {
                out.push(name.clone());
            }
        });
        out
    }

    pub fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn walk<'a>(stmts: &'a [Stmt], f: &mut dyn FnMut(&'a Stmt)) {
    for s in stmts {
        f(s);
        if let Stmt::If {
            then, otherwise, ..
        } = s
        {
            walk(then, f);
            walk(otherwise, f);
        }
    }
}

fn first_word(src: &str) -> Word {
    split_words(src)
        .ok()
        .and_then(|w| w.into_iter().next())
        .unwrap_or_else(|| Word::new("", false))
}

fn re(cell: &'static OnceLock<Regex>, pat: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pat).expect("static regex"))
}

fn default_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r#"^:\s+"?\$\{([A-Za-z_][A-Za-z0-9_]*):=(.*)\}"?\s*(#.*)?$"#)
}

fn assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)(\+?)=(.*)$")
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"^(?:function\s+)?[A-Za-z_][A-Za-z0-9_.-]*\s*\(\)\s*(\{.*)?$",
    )
}

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)",
    )
}

pub fn expand_vars(raw: &str, env: &BTreeMap<String, String>) -> String {
    var_re()
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

fn join_continuations(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();
    for line in src.lines() {
        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        out.push(std::mem::take(&mut pending));
    }
    if !pending.is_empty() {
        out.push(pending);
    }
    out
}

type Lines<'a, I> = std::iter::Peekable<I>;

/// Parses statements until one of `terminators` starts a line (returned) or input ends.
fn parse_block<'a, I>(
    it: &mut Lines<'a, I>,
    terminators: &[&str],
) -> Result<(Vec<Stmt>, Option<String>)>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut out = Vec::new();
    while let Some((idx, raw)) = it.next() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let keyword = line
            .split(|c: char| c.is_whitespace() || c == ';')
            .next()
            .unwrap_or_default();
        if terminators.contains(&keyword) {
            return Ok((out, Some(line.to_string())));
        }

        match keyword {
            "if" => out.push(parse_if(idx, line, it)?),
            "case" => skip_until(it, "esac"),
            "for" | "while" | "until" => {
                if !line.ends_with("done") {
                    skip_until(it, "done");
                }
            }
            _ if function_re().is_match(line) => skip_function(line, it),
            _ => {
                if let Some(stmt) = parse_simple(idx, line, it)? {
                    out.push(stmt);
                }
            }
        }
    }
    Ok((out, None))
}

fn skip_until<'a, I>(it: &mut Lines<'a, I>, closer: &str)
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut depth = 1usize;
    let opener = match closer {
        "esac" => "case",
        _ => "",
    };
    for (_, raw) in it.by_ref() {
        let first = raw.split_whitespace().next().unwrap_or_default();
        if !opener.is_empty() && first == opener {
            depth += 1;
        }
        if matches!(first, "for" | "while" | "until") && closer == "done" && !raw.trim().ends_with("done") {
            depth += 1;
        }
        if first == closer || first.trim_end_matches(';') == closer {
            depth -= 1;
            if depth == 0 {
                return;
            }
        }
    }
}

fn skip_function<'a, I>(first: &str, it: &mut Lines<'a, I>)
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let count = |s: &str| -> i64 {
        s.chars().fold(0, |acc, c| match c {
            '{' => acc + 1,
            '}' => acc - 1,
            _ => acc,
        })
    };
    let mut depth = count(first);
    let mut opened = first.contains('{');
    if opened && depth <= 0 {
        return;
    }
    for (_, raw) in it.by_ref() {
        depth += count(raw);
        if !opened && depth > 0 {
            opened = true;
        }
        if opened && depth <= 0 {
            return;
        }
    }
}

fn parse_if<'a, I>(idx: usize, line: &str, it: &mut Lines<'a, I>) -> Result<Stmt>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let head = line
        .strip_prefix("if")
        .or_else(|| line.strip_prefix("elif"))
        .unwrap_or(line)
        .trim();
    let cond_src = match head.strip_suffix("then") {
        Some(rest) => rest.trim().trim_end_matches(';').trim(),
        None => {
            // `then` on its own line.
            match it.next() {
                Some((_, next)) if next.trim() == "then" => head.trim_end_matches(';').trim(),
                _ => {
                    return Err(Error::msg(format!(
                        "descriptor line {}: expected 'then' after '{line}'",
                        idx + 1
                    )));
                }
            }
        }
    };
    let cond = parse_cond(idx, cond_src)?;

    let (then, end) = parse_block(it, &["elif", "else", "fi"])?;
    let otherwise = match end.as_deref() {
        Some(t) if t.starts_with("elif") => vec![parse_if(idx, t, it)?],
        Some(t) if t.starts_with("else") => {
            let (stmts, end) = parse_block(it, &["fi"])?;
            if end.is_none() {
                return Err(unterminated_if(idx));
            }
            stmts
        }
        Some(_) => Vec::new(),
        None => return Err(unterminated_if(idx)),
    };
    Ok(Stmt::If {
        cond,
        then,
        otherwise,
    })
}

fn unterminated_if(idx: usize) -> Error {
    Error::msg(format!(
        "descriptor line {}: 'if' without matching 'fi'",
        idx + 1
    ))
}

fn parse_cond(idx: usize, src: &str) -> Result<Cond> {
    let inner = src
        .strip_prefix("[[")
        .and_then(|s| s.strip_suffix("]]"))
        .or_else(|| src.strip_prefix('[').and_then(|s| s.strip_suffix(']')))
        .ok_or_else(|| unsupported_cond(idx, src))?;
    let words = split_words(inner).map_err(|_| unsupported_cond(idx, src))?;
    let mut words = words.into_iter();
    let cond = match (words.next(), words.next(), words.next(), words.next()) {
        (Some(op), Some(w), None, None) if op.raw == "-n" => Cond::NonEmpty(w),
        (Some(op), Some(w), None, None) if op.raw == "-z" => Cond::Empty(w),
        (Some(a), Some(op), Some(b), None) if op.raw == "=" || op.raw == "==" => Cond::Eq(a, b),
        (Some(a), Some(op), Some(b), None) if op.raw == "!=" => Cond::Ne(a, b),
        _ => return Err(unsupported_cond(idx, src)),
    };
    Ok(cond)
}

fn unsupported_cond(idx: usize, src: &str) -> Error {
    Error::msg(format!(
        "descriptor line {}: unsupported top-level condition '{src}' (use the shell evaluator)",
        idx + 1
    ))
}

fn parse_simple<'a, I>(idx: usize, line: &str, it: &mut Lines<'a, I>) -> Result<Option<Stmt>>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    if let Some(caps) = default_re().captures(line) {
        let value = first_word(caps[2].trim());
        return Ok(Some(Stmt::Default {
            name: caps[1].to_string(),
            value,
        }));
    }

    let Some(caps) = assign_re().captures(line) else {
        return Ok(None);
    };
    let name = caps[1].to_string();
    let append = &caps[2] == "+";
    let rest = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

    if let Some(body) = rest.strip_prefix('(') {
        let items = parse_array_body(idx, body, it)?;
        return Ok(Some(Stmt::Array {
            name,
            append,
            items,
        }));
    }
    if append {
        // String append; not needed for input or default tracking.
        return Ok(None);
    }
    let value = split_words(rest)
        .map_err(|e| Error::msg(format!("descriptor line {}: {e}", idx + 1)))?
        .into_iter()
        .next()
        .unwrap_or_else(|| Word::new("", false));
    Ok(Some(Stmt::Assign { name, value }))
}

/// Reads array items up to the unquoted `)`, possibly across lines.
fn parse_array_body<'a, I>(idx: usize, first: &str, it: &mut Lines<'a, I>) -> Result<Vec<Word>>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut lexer = WordLexer::default();
    if lexer.feed(first)? {
        return Ok(lexer.finish());
    }
    for (_, raw) in it.by_ref() {
        if lexer.feed(raw)? {
            return Ok(lexer.finish());
        }
    }
    Err(Error::msg(format!(
        "descriptor line {}: array is missing its closing ')'",
        idx + 1
    )))
}

pub fn split_words(src: &str) -> Result<Vec<Word>> {
    let mut lexer = WordLexer::default();
    lexer.feed(src)?;
    if lexer.quote.is_some() {
        return Err(Error::msg(format!("unterminated quote in '{src}'")));
    }
    Ok(lexer.finish())
}

#[derive(Default)]
struct WordLexer {
    words: Vec<Word>,
    cur: String,
    in_word: bool,
    only_single: bool,
    quote: Option<char>,
}

impl WordLexer {
    fn push_word(&mut self) {
        if self.in_word {
            let literal = self.only_single;
            self.words.push(Word::new(std::mem::take(&mut self.cur), literal));
        }
        self.in_word = false;
        self.only_single = false;
    }

    fn start_word(&mut self, single: bool) {
        if !self.in_word {
            self.in_word = true;
            self.only_single = single;
        } else if !single {
            self.only_single = false;
        }
    }

    /// Returns true once an unquoted `)` closes the array.
    fn feed(&mut self, line: &str) -> Result<bool> {
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match (self.quote, c) {
                (Some('\''), '\'') => self.quote = None,
                (Some('"'), '"') => self.quote = None,
                (Some('"'), '\\') => {
                    if let Some(next) = chars.next() {
                        self.cur.push(next);
                    }
                }
                (Some(_), c) => self.cur.push(c),
                (None, '\'') => {
                    self.start_word(true);
                    self.quote = Some('\'');
                }
                (None, '"') => {
                    self.start_word(false);
                    self.quote = Some('"');
                }
                (None, '\\') => {
                    self.start_word(false);
                    if let Some(next) = chars.next() {
                        self.cur.push(next);
                    }
                }
                (None, '#') if !self.in_word => break,
                (None, ')') => {
                    self.push_word();
                    return Ok(true);
                }
                (None, c) if c.is_whitespace() => self.push_word(),
                (None, c) => {
                    self.start_word(false);
                    self.cur.push(c);
                }
            }
        }
        if self.quote.is_some() {
            self.cur.push('\n');
        } else {
            self.push_word();
        }
        Ok(false)
    }

    fn finish(mut self) -> Vec<Word> {
        self.push_word();
        self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Maintainer: someone
: "${_cpusched:=cachyos}"
: "${_HZ_ticks:=1000}"
: "${_autofdo:=no}"
: "${_autofdo_profile_name:=}"
: "${_build_debug:=no}"

_major=6.12
pkgver=${_major}.3
source=(
    "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-${_major}.tar.xz"
    "config"   # base config
    'auto-cpu-optimization.sh'
)

if [[ -n "$_autofdo_profile_name" ]]; then
    source+=("$_autofdo_profile_name")
fi

if [ "$_cpusched" = "bore" ]; then
    source+=("0001-bore.patch")
elif [ "$_cpusched" = "bmq" ]; then
    source+=("0001-bmq.patch")
else
    source+=("0001-sched-ext.patch")
fi

prepare() {
    cd "$srcdir"
    if [ -n "$x" ]; then
        source=()
    fi
}

b2sums=('aaa'
        'bbb'
        'SKIP')
"#;

    fn sample() -> Descriptor {
        Descriptor::parse(Path::new("PKGBUILD"), SAMPLE).expect("parse")
    }

    #[test]
    fn collects_assign_if_unset_defaults() {
        let d = sample();
        let defaults = d.declared_defaults();
        assert_eq!(defaults.get("_cpusched").map(String::as_str), Some("cachyos"));
        assert_eq!(defaults.get("_HZ_ticks").map(String::as_str), Some("1000"));
        assert_eq!(
            defaults.get("_autofdo_profile_name").map(String::as_str),
            Some("")
        );
        assert_eq!(d.plain_assignments(), vec!["_major", "pkgver"]);
    }

    #[test]
    fn parses_multiline_arrays_and_skips_functions() {
        let d = sample();
        assert!(
            d.stmts
                .iter()
                .any(|s| matches!(s, Stmt::Array { name, .. } if name == "b2sums"))
        );
        let Some(Stmt::Array { items, append, .. }) = d
            .stmts
            .iter()
            .find(|s| matches!(s, Stmt::Array { name, .. } if name == "source"))
        else {
            panic!("source array missing");
        };
        assert!(!append);
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].raw, "config");
        assert!(items[2].literal);
        // prepare() body must not leak a top-level `source=()`.
        let top_level_sources = d
            .stmts
            .iter()
            .filter(|s| matches!(s, Stmt::Array { name, append: false, .. } if name == "source"))
            .count();
        assert_eq!(top_level_sources, 1);
    }

    #[test]
    fn parses_guarded_appends_with_elif_chain() {
        let d = sample();
        let ifs: Vec<_> = d
            .stmts
            .iter()
            .filter(|s| matches!(s, Stmt::If { .. }))
            .collect();
        assert_eq!(ifs.len(), 2);
        let Stmt::If { cond, otherwise, .. } = ifs[1] else {
            unreachable!()
        };
        assert!(matches!(cond, Cond::Eq(_, b) if b.raw == "bore"));
        assert!(matches!(otherwise.first(), Some(Stmt::If { .. })));
    }

    #[test]
    fn rejects_compound_conditions() {
        let src = "if [[ -n \"$a\" && -n \"$b\" ]]; then\n  source+=(x)\nfi\n";
        let err = Descriptor::parse(Path::new("PKGBUILD"), src).expect_err("must fail");
        assert!(err.to_string().contains("unsupported"), "unexpected err: {err}");
    }

    #[test]
    fn lenient_scan_reads_defaults_past_shell_only_conditions() {
        let src = r#"
: "${_cpusched:=cachyos}"
if _is_lto_kernel; then
    : "${_use_llvm_lto:=thin}"
fi
if [[ "$_cpusched" = "bore" || "$_cpusched" = "eevdf" ]]; then
    _HZ_ticks=1000
fi
_is_lto_kernel() {
    : "${_inner:=x}"
    [[ "$_use_llvm_lto" != none ]]
}
_noop() { :; }
: "${_hugepage:=always}"
source=("a" "b")
"#;
        assert!(Descriptor::parse(Path::new("PKGBUILD"), src).is_err());

        let d = Descriptor::scan(Path::new("PKGBUILD"), src);
        let defaults = d.declared_defaults();
        assert_eq!(defaults.get("_cpusched").map(String::as_str), Some("cachyos"));
        assert_eq!(defaults.get("_use_llvm_lto").map(String::as_str), Some("thin"));
        assert_eq!(defaults.get("_hugepage").map(String::as_str), Some("always"));
        assert!(!defaults.contains_key("_inner"));
        assert_eq!(d.plain_assignments(), vec!["_HZ_ticks"]);
    }

    #[test]
    fn expands_braced_and_bare_variables() {
        let mut env = BTreeMap::new();
        env.insert("_major".to_string(), "6.12".to_string());
        assert_eq!(expand_vars("linux-${_major}.tar.xz", &env), "linux-6.12.tar.xz");
        assert_eq!(expand_vars("$_major-$_missing", &env), "6.12-");
    }
}
