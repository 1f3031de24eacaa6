//! Dependency manifest parsing.
//!
//! A manifest is an ordered list of `name[op version]` lines. Its cache key
//! is the SHA-256 of the exact file bytes: any edit, including comments or
//! whitespace, produces a new dependency layer.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use serde::{Deserialize, Serialize};

/// Comparison operator of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `~=` (compatible release)
    Compatible,
}

impl ConstraintOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Compatible => "~=",
        }
    }
}

/// A dotted version such as `3.0.2` or `2.9.9rc1`.
///
/// Release numbers compare numerically and missing trailing numbers count as
/// zero (`3.0 == 3.0.0`). A suffix orders `dev < a < b < rc < release < post`,
/// so `3.0rc1 < 3.0 < 3.0.post1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    /// Wraps a version string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the version as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> Vec<&str> {
        self.0.split('.').collect()
    }

    /// Splits off the leading dotted release numbers.
    fn release(&self) -> (Vec<u64>, &str) {
        let mut rest = self.0.trim().trim_start_matches(['v', 'V']);
        let mut release = Vec::new();
        loop {
            let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits == 0 {
                break;
            }
            let (number, tail) = rest.split_at(digits);
            release.push(number.parse().unwrap_or(u64::MAX));
            rest = tail;
            match rest.strip_prefix('.') {
                Some(next) if next.starts_with(|c: char| c.is_ascii_digit()) => rest = next,
                _ => break,
            }
        }
        (release, rest)
    }
}

/// Parsed suffix after the release numbers: stage rank, stage number, text.
fn suffix(raw: &str) -> (u8, u64, String) {
    let text = raw.trim_start_matches(['.', '-', '_']).to_ascii_lowercase();
    let tag_len = text.len() - text.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
    let (tag, tail) = text.split_at(tag_len);
    let rank = match tag {
        "dev" => 0,
        "a" | "alpha" => 1,
        "b" | "beta" => 2,
        "c" | "rc" | "pre" | "preview" => 3,
        "post" | "rev" | "r" => 5,
        _ => 4,
    };
    let tail = tail.trim_start_matches(['.', '-', '_']);
    let digits = tail.len() - tail.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let number = tail[..digits].parse().unwrap_or(0);
    (rank, number, text)
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let (left, left_rest) = self.release();
        let (right, right_rest) = other.release();
        for i in 0..left.len().max(right.len()) {
            let a = left.get(i).copied().unwrap_or(0);
            let b = right.get(i).copied().unwrap_or(0);
            if a != b {
                return a.cmp(&b);
            }
        }
        suffix(left_rest).cmp(&suffix(right_rest))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A version constraint; `None` in [`Requirement::constraint`] means any version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    /// Comparison operator.
    pub op: ConstraintOp,
    /// Version operand.
    pub version: Version,
}

impl VersionConstraint {
    /// Returns whether `candidate` satisfies this constraint.
    #[must_use]
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            ConstraintOp::Eq => candidate == &self.version,
            ConstraintOp::Ne => candidate != &self.version,
            ConstraintOp::Ge => candidate >= &self.version,
            ConstraintOp::Le => candidate <= &self.version,
            ConstraintOp::Gt => candidate > &self.version,
            ConstraintOp::Lt => candidate < &self.version,
            ConstraintOp::Compatible => {
                // ~=2.2.1 means >=2.2.1 and ==2.2.*
                let base = self.version.segments();
                let prefix_len = base.len().saturating_sub(1).max(1);
                let cand = candidate.segments();
                candidate >= &self.version
                    && (0..prefix_len).all(|i| {
                        let b = base.get(i).copied().unwrap_or("0");
                        let c = cand.get(i).copied().unwrap_or("0");
                        Version::new(b) == Version::new(c)
                    })
            }
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Package name as written.
    pub name: String,
    /// Optional version constraint.
    pub constraint: Option<VersionConstraint>,
    /// 1-based line number in the manifest.
    pub line: usize,
}

impl Requirement {
    /// Returns the normalized package name used for index lookups.
    #[must_use]
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Returns whether `version` satisfies this requirement.
    #[must_use]
    pub fn accepts(&self, version: &Version) -> bool {
        self.constraint.as_ref().is_none_or(|c| c.matches(version))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{}{c}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Lowercases a package name and folds `-`, `_` and `.` runs into `-`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// A parsed dependency manifest together with its exact bytes.
#[derive(Debug, Clone)]
pub struct DependencyManifest {
    raw: Vec<u8>,
    requirements: Vec<Requirement>,
}

impl DependencyManifest {
    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or an entry is malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "reading dependency manifest");
        let raw = std::fs::read(path).map_err(|e| BerthError::io(path, e))?;
        Self::parse(raw)
    }

    /// Parses manifest bytes.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::DependencyResolution` naming the offending entry
    /// if a line is malformed, not UTF-8, or repeats a package.
    pub fn parse(raw: impl Into<Vec<u8>>) -> Result<Self> {
        let raw = raw.into();
        let text = std::str::from_utf8(&raw).map_err(|e| BerthError::DependencyResolution {
            entry: "<manifest>".into(),
            reason: format!("manifest is not valid UTF-8: {e}"),
        })?;

        let mut requirements = Vec::new();
        let mut seen = HashSet::new();
        for (idx, line) in text.lines().enumerate() {
            let content = line.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let req = parse_requirement(content, idx + 1)?;
            if !seen.insert(req.normalized_name()) {
                return Err(BerthError::DependencyResolution {
                    entry: content.to_string(),
                    reason: format!("package `{}` is listed more than once", req.name),
                });
            }
            requirements.push(req);
        }

        Ok(Self { raw, requirements })
    }

    /// Returns the requirements in manifest order.
    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Returns the exact manifest bytes.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the cache key: SHA-256 of the exact manifest bytes.
    #[must_use]
    pub fn content_key(&self) -> Sha256Hash {
        crate::hash::hash_bytes(&self.raw)
    }
}

fn parse_requirement(content: &str, line: usize) -> Result<Requirement> {
    let invalid = |reason: String| BerthError::DependencyResolution {
        entry: content.to_string(),
        reason,
    };

    let name_end = content
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(content.len());
    let name = &content[..name_end];
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid(format!("line {line}: missing package name")));
    }

    let rest = content[name_end..].trim();
    if rest.is_empty() {
        return Ok(Requirement {
            name: name.to_string(),
            constraint: None,
            line,
        });
    }

    let ops = [
        ("==", ConstraintOp::Eq),
        ("!=", ConstraintOp::Ne),
        (">=", ConstraintOp::Ge),
        ("<=", ConstraintOp::Le),
        ("~=", ConstraintOp::Compatible),
        (">", ConstraintOp::Gt),
        ("<", ConstraintOp::Lt),
    ];
    let (op, version) = ops
        .iter()
        .find_map(|(symbol, op)| rest.strip_prefix(symbol).map(|v| (*op, v.trim())))
        .ok_or_else(|| invalid(format!("line {line}: unsupported constraint `{rest}`")))?;

    if version.is_empty()
        || !version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
    {
        return Err(invalid(format!("line {line}: invalid version `{version}`")));
    }

    Ok(Requirement {
        name: name.to_string(),
        constraint: Some(VersionConstraint {
            op,
            version: Version::new(version),
        }),
        line,
    })
}
