//! Process environment defaults and `$VAR` expansion.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default the XDG base directories from the user's home.
///
/// Must run before any worker threads are started.
pub fn ensure_common_env() -> Result<()> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Environment("cannot determine home directory".into()))?;
    let defaults: [(&str, Option<PathBuf>); 5] = [
        ("XDG_CONFIG_HOME", dirs::config_dir()),
        ("XDG_CACHE_HOME", dirs::cache_dir()),
        ("XDG_DATA_HOME", dirs::data_dir()),
        ("XDG_STATE_HOME", Some(home.join(".local").join("state"))),
        ("XDG_RUNTIME_DIR", Some(home.join(".local").join("run"))),
    ];

    for (key, value) in defaults {
        if std::env::var_os(key).is_some() {
            continue;
        }
        let value = value
            .ok_or_else(|| Error::Environment(format!("cannot determine default for {key}")))?;
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Expand `$VAR` and `${VAR}` from the environment, plus `NOW` (unix seconds).
pub fn expand(input: &str) -> String {
    expand_with(input, |name| match name {
        "NOW" => Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
                .to_string(),
        ),
        _ => std::env::var(name).ok(),
    })
}

/// Expand variables from a fixed table; unknown names expand to nothing.
pub fn expand_from(input: &str, vars: &HashMap<&str, &str>) -> String {
    expand_with(input, |name| vars.get(name).map(|v| v.to_string()))
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let name: String = if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            name
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
                continue;
            }
            name
        };
        out.push_str(&lookup(&name).unwrap_or_default());
    }
    out
}
