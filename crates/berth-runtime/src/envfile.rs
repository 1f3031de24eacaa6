//! Environment files and worker environment merging.
//!
//! Env files use dotenv syntax: `KEY=VALUE` lines with an optional `export `
//! prefix, `#` comments, single or double quotes, `\n` escapes inside double
//! quotes, inline comments after unquoted values and `${VAR}` references to
//! keys defined earlier in the same file.

use std::collections::BTreeMap;
use std::path::Path;

use berth_common::error::{BerthError, Result};

/// Parses dotenv text into ordered key/value pairs.
///
/// Later duplicates are kept; merging resolves them in favour of the last.
///
/// # Errors
///
/// Returns `BerthError::Config` naming the line of the first malformed entry.
pub fn parse_env(text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);
        let malformed = |reason: &str| BerthError::Config {
            message: format!("env file line {}: {reason}", idx + 1),
        };
        let (key, value) = line.split_once('=').ok_or_else(|| malformed("expected KEY=VALUE"))?;
        let key = key.trim();
        if !is_env_key(key) {
            return Err(malformed("invalid variable name"));
        }
        let value = parse_value(value.trim_start(), &pairs).map_err(|reason| malformed(reason))?;
        pairs.push((key.to_string(), value));
    }
    Ok(pairs)
}

/// Loads an env file; a missing file yields no variables.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "env file absent, skipping");
            return Ok(Vec::new());
        }
        Err(e) => return Err(BerthError::io(path, e)),
    };
    let pairs = parse_env(&text)?;
    tracing::debug!(path = %path.display(), vars = pairs.len(), "loaded env file");
    Ok(pairs)
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_value(value: &str, earlier: &[(String, String)]) -> std::result::Result<String, &'static str> {
    if let Some(rest) = value.strip_prefix('\'') {
        let end = rest.find('\'').ok_or("unterminated single quote")?;
        return Ok(rest[..end].to_string());
    }
    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars();
        loop {
            match chars.next() {
                None => return Err("unterminated double quote"),
                Some('"') => break,
                Some('\\') => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => return Err("dangling escape"),
                },
                Some(c) => out.push(c),
            }
        }
        return Ok(interpolate(&out, earlier));
    }
    let unquoted = value
        .find(" #")
        .or_else(|| value.find("\t#"))
        .map_or(value, |pos| &value[..pos]);
    Ok(interpolate(unquoted.trim_end(), earlier))
}

/// Expands `${VAR}` from earlier keys; unknown names expand to nothing.
fn interpolate(value: &str, earlier: &[(String, String)]) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find('}') {
            let name = &after[..end];
            if let Some((_, v)) = earlier.iter().rev().find(|(k, _)| k == name) {
                out.push_str(v);
            } else {
                tracing::debug!(var = name, "env reference to undefined variable");
            }
            rest = &after[end + 1..];
        } else {
            out.push_str(&rest[start..]);
            rest = "";
        }
    }
    out.push_str(rest);
    out
}

/// A worker environment assembled from layered sources.
///
/// Each layer overrides the keys of the layers applied before it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a layer of variables on top of the current ones.
    pub fn layer<I, K, V>(&mut self, source: &str, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut count = 0_usize;
        for (k, v) in vars {
            let _ = self.vars.insert(k.into(), v.into());
            count += 1;
        }
        tracing::trace!(source, count, "applied environment layer");
        self
    }

    /// Sets a single variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let _ = self.vars.insert(key.into(), value.into());
        self
    }

    /// Returns a variable's value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterates over the variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns whether no variables are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
