//! Ref classification and version derivation for pkgsync.
//!
//! A pushed ref is either a branch or a tag. Tags are read as literal release
//! versions in Composer's version grammar; branches only map to a version when
//! they follow a development-line convention (`main`, `1.x`, ...). Anything
//! else is [`NotPublishable`], which callers treat as a routine skip rather
//! than an error.
//!
//! # Example
//!
//! ```
//! use pkgsync_version::{RefKind, RefName, derive_version};
//!
//! let r = RefName::parse("refs/tags/v2.1.0-rc.1");
//! assert_eq!(r.kind(), RefKind::Tag);
//!
//! let version = derive_version(r.short_name(), r.kind()).expect("tag is a version");
//! assert_eq!(version.raw, "v2.1.0-rc.1");
//! assert_eq!(version.normalized, "2.1.0.0-RC1");
//!
//! let main = derive_version("main", RefKind::Branch).expect("main is a dev branch");
//! assert_eq!(main.normalized, "dev-main");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of fully-qualified branch refs
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Prefix of fully-qualified tag refs
pub const TAG_REF_PREFIX: &str = "refs/tags/";

/// Prefix Composer uses for named development branches
pub const DEV_PREFIX: &str = "dev-";

/// Component Composer substitutes for a wildcard in a numbered dev line
pub const DEV_LINE_COMPONENT: &str = "9999999";

/// Branches treated as development lines when no convention is configured
pub const DEFAULT_DEV_BRANCHES: &[&str] = &["main", "master", "develop", "trunk"];

/// Kind of a pushed ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch,
    Tag,
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Branch => write!(f, "branch"),
            RefKind::Tag => write!(f, "tag"),
        }
    }
}

/// A symbolic ref split into its kind and short name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefName {
    full: String,
    kind: RefKind,
    short: String,
}

impl RefName {
    /// Classify a ref.
    ///
    /// The ref is a tag iff stripping `refs/tags/` changes it. Everything
    /// else is a branch, with `refs/heads/` stripped when present.
    pub fn parse(full: &str) -> Self {
        let (kind, short) = match full.strip_prefix(TAG_REF_PREFIX) {
            Some(tag) => (RefKind::Tag, tag),
            None => (
                RefKind::Branch,
                full.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(full),
            ),
        };

        Self {
            full: full.to_string(),
            kind,
            short: short.to_string(),
        }
    }

    /// The ref as it was pushed
    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    /// Branch or tag name without its `refs/...` prefix
    pub fn short_name(&self) -> &str {
        &self.short
    }

    pub fn is_tag(&self) -> bool {
        self.kind == RefKind::Tag
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// A derived package version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageVersion {
    /// Human-facing version written to the manifest `version` field
    pub raw: String,
    /// Registry-canonical form written to `version_normalized`
    pub normalized: String,
}

impl PackageVersion {
    fn new(raw: impl Into<String>, normalized: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            normalized: normalized.into(),
        }
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Why a ref does not map to a publishable version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotPublishable {
    #[error("empty ref name")]
    EmptyRef,
    #[error("tag `{0}` is not a valid version")]
    InvalidTag(String),
    #[error("branch `{0}` is not a development branch")]
    UnrecognizedBranch(String),
}

/// Which branch names count as development lines.
///
/// Numbered lines (`1.x`, `2.0`) are always recognized; `dev_branches` lists
/// the named branches that publish as `dev-<branch>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConvention {
    pub dev_branches: Vec<String>,
}

impl Default for BranchConvention {
    fn default() -> Self {
        Self::new(DEFAULT_DEV_BRANCHES.iter().copied())
    }
}

impl BranchConvention {
    pub fn new<I, S>(branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dev_branches: branches.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `branch` is one of the named development branches
    pub fn is_dev_branch(&self, branch: &str) -> bool {
        self.dev_branches.iter().any(|b| b == branch)
    }
}

/// Derive a version using the default branch convention.
pub fn derive_version(ref_name: &str, kind: RefKind) -> Result<PackageVersion, NotPublishable> {
    derive_version_with(ref_name, kind, &BranchConvention::default())
}

/// Derive the version for a ref.
///
/// `ref_name` may be fully qualified or already short; the prefix matching
/// `kind` is stripped first.
pub fn derive_version_with(
    ref_name: &str,
    kind: RefKind,
    convention: &BranchConvention,
) -> Result<PackageVersion, NotPublishable> {
    let name = match kind {
        RefKind::Tag => ref_name.strip_prefix(TAG_REF_PREFIX).unwrap_or(ref_name),
        RefKind::Branch => ref_name.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(ref_name),
    };

    if name.trim().is_empty() {
        return Err(NotPublishable::EmptyRef);
    }

    match kind {
        RefKind::Tag => normalize_release(name)
            .map(|normalized| PackageVersion::new(name, normalized))
            .ok_or_else(|| NotPublishable::InvalidTag(name.to_string())),
        RefKind::Branch => branch_version(name, convention),
    }
}

fn branch_version(
    branch: &str,
    convention: &BranchConvention,
) -> Result<PackageVersion, NotPublishable> {
    if convention.is_dev_branch(branch) {
        let version = format!("{DEV_PREFIX}{branch}");
        return Ok(PackageVersion::new(version.clone(), version));
    }

    numbered_dev_line(branch).ok_or_else(|| NotPublishable::UnrecognizedBranch(branch.to_string()))
}

/// `1.x`, `v2.0`, `3.1.x` style branches.
fn numbered_dev_line(branch: &str) -> Option<PackageVersion> {
    let body = strip_v(branch);
    let mut parts: Vec<Option<&str>> = Vec::with_capacity(4);
    let mut wildcard_seen = false;

    for (idx, part) in body.split('.').enumerate() {
        if idx >= 4 {
            return None;
        }
        if is_digits(part) && !wildcard_seen {
            parts.push(Some(part));
        } else if idx > 0 && matches!(part, "x" | "X" | "*") {
            wildcard_seen = true;
            parts.push(None);
        } else {
            return None;
        }
    }

    let fixed: Vec<&str> = parts.iter().map_while(|p| *p).collect();
    let raw = if fixed.len() == 4 {
        format!("{}-dev", fixed.join("."))
    } else {
        format!("{}.x-dev", fixed.join("."))
    };

    parts.resize(4, None);
    let normalized = parts
        .iter()
        .map(|p| p.unwrap_or(DEV_LINE_COMPONENT))
        .collect::<Vec<_>>()
        .join(".");

    Some(PackageVersion::new(raw, format!("{normalized}-dev")))
}

/// Normalize a release version the way Composer does, or `None` when the
/// input is not a version.
pub fn normalize_release(input: &str) -> Option<String> {
    let mut rest = strip_v(input.trim());

    let mut dev = false;
    for suffix in ["-dev", ".dev", "_dev"] {
        if rest.len() > suffix.len() && rest.to_ascii_lowercase().ends_with(suffix) {
            rest = &rest[..rest.len() - suffix.len()];
            dev = true;
            break;
        }
    }

    let numeric_end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (numeric, mut modifier) = rest.split_at(numeric_end);

    // `1.0.beta1`: the last dot separates the modifier
    let (numeric, dot_separated) = match numeric.strip_suffix('.') {
        Some(n) if !modifier.is_empty() => (n, true),
        _ => (numeric, false),
    };

    let parts: Vec<&str> = numeric.split('.').collect();
    if parts.is_empty() || parts.len() > 4 || !parts.iter().all(|p| is_digits(p)) {
        return None;
    }

    let mut normalized = parts.join(".");
    for _ in parts.len()..4 {
        normalized.push_str(".0");
    }

    if !modifier.is_empty() {
        if !dot_separated {
            modifier = modifier
                .strip_prefix(['-', '_', '.'])
                .unwrap_or(modifier);
        }
        if let Some(suffix) = normalize_stability(modifier)? {
            normalized.push('-');
            normalized.push_str(&suffix);
        }
    }

    if dev {
        normalized.push_str("-dev");
    }

    Some(normalized)
}

/// `beta.2` -> `beta2`, `rc` -> `RC`; `Some(None)` for an explicit `stable`.
fn normalize_stability(modifier: &str) -> Option<Option<String>> {
    let letters_end = modifier
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(modifier.len());
    let (word, number) = modifier.split_at(letters_end);

    let stability = match word.to_ascii_lowercase().as_str() {
        "alpha" | "a" => "alpha",
        "beta" | "b" => "beta",
        "rc" | "c" => "RC",
        "patch" | "pl" | "p" => "patch",
        "stable" => "stable",
        _ => return None,
    };

    let number = match number.strip_prefix(['.', '-']) {
        Some(n) if n.is_empty() => return None,
        Some(n) => n,
        None => number,
    };
    if !number.is_empty() && !is_digits(number) {
        return None;
    }

    if stability == "stable" {
        return if number.is_empty() { Some(None) } else { None };
    }

    Some(Some(format!("{stability}{number}")))
}

fn strip_v(s: &str) -> &str {
    s.strip_prefix(['v', 'V']).unwrap_or(s)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
