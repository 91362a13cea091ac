use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub mod env;

/// A loaded build definition: the resolved TOML tree plus the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn from_toml(path: impl Into<PathBuf>, src: &str) -> Result<Self> {
        let value: Value = toml::from_str(src)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        v.clone()
            .try_into()
            .map(Some)
            .map_err(|e| Error::msg(format!("invalid config at '{path}': {e}")))
    }

    /// Writes `value` at a dotted path, creating intermediate tables.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segs: Vec<&str> = path.split('.').map(str::trim).collect();
        if segs.iter().any(|s| s.is_empty()) {
            return Err(Error::msg(format!("invalid config path '{path}'")));
        }
        let (last, parents) = segs
            .split_last()
            .ok_or_else(|| Error::msg("empty config path"))?;

        let mut cur = &mut self.value;
        for seg in parents {
            let tbl = cur
                .as_table_mut()
                .ok_or_else(|| Error::msg(format!("'{path}' crosses a non-table value")))?;
            cur = tbl
                .entry(seg.to_string())
                .or_insert_with(|| Value::Table(Default::default()));
        }
        let tbl = cur
            .as_table_mut()
            .ok_or_else(|| Error::msg(format!("'{path}' crosses a non-table value")))?;
        tbl.insert(last.to_string(), value);
        Ok(())
    }

    /// Directory relative paths in this definition are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn build_name(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.starts_with('<'))
            .unwrap_or("kernel")
            .to_string()
    }
}

/// Deep-merges `overlay` into `base`; tables merge key by key, anything else is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn load_with_parents(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(key.clone()) {
        return Err(Error::msg(format!(
            "build definition extends cycle at {}",
            key.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let parent = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"))
        .map(|v| match v {
            Value::String(s) => Ok(s),
            other => Err(Error::msg(format!(
                "'extends' in {} must be a string, got {}",
                path.display(),
                other.type_str()
            ))),
        })
        .transpose()?;

    let mut out = match parent {
        Some(rel) => {
            let rel = PathBuf::from(rel);
            let parent_path = if rel.is_absolute() {
                rel
            } else {
                path.parent().unwrap_or_else(|| Path::new(".")).join(rel)
            };
            load_with_parents(&parent_path, seen)?
        }
        None => Value::Table(Default::default()),
    };
    merge(&mut out, value);
    seen.remove(&key);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let value = load_with_parents(path, &mut HashSet::new())?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
