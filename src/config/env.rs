//! Environment loading and `<NAME>` placeholder substitution.
//!
//! Agent documents may reference secrets and machine-specific values as
//! `"<NAME>"`. The value is looked up in the `.env` file next to the
//! document, then the process environment, then caller-supplied extras
//! (later sources win).

use std::collections::BTreeMap;
use std::path::Path;

use crate::{mlog_debug, Error, Result};

pub type EnvMap = BTreeMap<String, String>;

/// Collect variables from `<dir>/.env`, the process environment, and `extra`.
pub fn load_env(dir: Option<&Path>, extra: &EnvMap) -> Result<EnvMap> {
    let mut env = EnvMap::new();

    if let Some(dir) = dir {
        let dotenv_path = dir.join(".env");
        if dotenv_path.is_file() {
            let iter = dotenvy::from_path_iter(&dotenv_path)
                .map_err(|e| Error::Config(format!("{}: {}", dotenv_path.display(), e)))?;
            for item in iter {
                let (key, value) = item
                    .map_err(|e| Error::Config(format!("{}: {}", dotenv_path.display(), e)))?;
                env.insert(key, value);
            }
            mlog_debug!("Loaded {} entries from {}", env.len(), dotenv_path.display());
        }
    }

    env.extend(std::env::vars());
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(env)
}

/// Name inside a `<NAME>` placeholder, if `s` is exactly one.
fn placeholder_name(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('<')?.strip_suffix('>')?;
    if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(inner)
    } else {
        None
    }
}

/// Replace every `"<NAME>"` string in `value` that has an entry in `env`.
///
/// Unknown placeholders are left as they are. Returns the number of
/// substitutions made.
pub fn substitute(value: &mut toml::Value, env: &EnvMap) -> usize {
    match value {
        toml::Value::String(s) => match placeholder_name(s).and_then(|name| env.get(name)) {
            Some(replacement) => {
                *s = replacement.clone();
                1
            }
            None => 0,
        },
        toml::Value::Array(items) => items.iter_mut().map(|v| substitute(v, env)).sum(),
        toml::Value::Table(table) => table.iter_mut().map(|(_, v)| substitute(v, env)).sum(),
        _ => 0,
    }
}
