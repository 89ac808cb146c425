//! `composer.json` handling for pkgsync.
//!
//! The manifest in a checked-out repository is rewritten in place before
//! packaging: the derived version is embedded and, optionally, a `source`
//! block recording where the artifact came from. Key order of the original
//! file is preserved.
//!
//! # Example
//!
//! ```no_run
//! use pkgsync_manifest::{Source, mutate_file};
//! use std::path::Path;
//!
//! let source = Source::git("git@github.com:acme/pkg.git", "3f2a9c1");
//! let manifest = mutate_file(Path::new("/srv/repos/acme_pkg"), "dev-main", "dev-main", Some(&source))
//!     .expect("mutate");
//! println!("{}", manifest.name().expect("name"));
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Manifest file name
pub const MANIFEST_FILE: &str = "composer.json";

/// Source type recorded for git provenance
pub const GIT_SOURCE_TYPE: &str = "git";

/// Get the manifest path for a directory
pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

/// Provenance block embedded as `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Commit hash the artifact was built from
    pub reference: String,
}

impl Source {
    pub fn git(url: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: GIT_SOURCE_TYPE.to_string(),
            reference: reference.into(),
        }
    }
}

/// Manifest identity problems.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{} is not a JSON object", .0.display())]
    NotAnObject(PathBuf),
    #[error("{} has no `name` field", .0.display())]
    MissingName(PathBuf),
    #[error("`name` in {} must be a non-empty string", .0.display())]
    InvalidName(PathBuf),
}

/// A loaded `composer.json`.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    data: Map<String, Value>,
}

impl Manifest {
    /// Load the manifest from a checked-out directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = manifest_path(dir);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::parse(path, &content)
    }

    /// Parse manifest content that belongs at `path`
    pub fn parse(path: PathBuf, content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;

        match value {
            Value::Object(data) => Ok(Self { path, data }),
            _ => Err(ManifestError::NotAnObject(path).into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `name` field; missing or non-string names are errors.
    pub fn name(&self) -> Result<&str, ManifestError> {
        match self.data.get("name") {
            None | Some(Value::Null) => Err(ManifestError::MissingName(self.path.clone())),
            Some(Value::String(name)) if !name.trim().is_empty() => Ok(name.as_str()),
            Some(_) => Err(ManifestError::InvalidName(self.path.clone())),
        }
    }

    /// The `name` field split into vendor and package
    pub fn package_name(&self) -> Result<PackageName> {
        let name = self.name()?;
        Ok(PackageName::parse(name)?)
    }

    pub fn set_version(&mut self, version: &str, normalized: &str) {
        self.data
            .insert("version".to_string(), Value::String(version.to_string()));
        self.data.insert(
            "version_normalized".to_string(),
            Value::String(normalized.to_string()),
        );
    }

    pub fn set_source(&mut self, source: &Source) -> Result<()> {
        let value = serde_json::to_value(source).context("failed to serialize source block")?;
        self.data.insert("source".to_string(), value);
        Ok(())
    }

    /// Render with Composer's four-space indentation and a trailing newline
    pub fn to_pretty_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.data
            .serialize(&mut ser)
            .context("failed to serialize manifest")?;
        buf.push(b'\n');
        String::from_utf8(buf).context("manifest is not valid UTF-8")
    }

    /// Write the manifest back to where it was loaded from
    pub fn save(&self) -> Result<()> {
        let content = self.to_pretty_string()?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write manifest {}", self.path.display()))
    }
}

/// Load the manifest of a checked-out directory
pub fn load_file(dir: &Path) -> Result<Manifest> {
    Manifest::load(dir)
}

/// Embed version (and optionally source) into the manifest on disk.
///
/// Fails before writing anything when the manifest has no usable `name`.
/// The working tree is left modified; discarding the change is up to the
/// caller.
pub fn mutate_file(
    dir: &Path,
    version: &str,
    normalized: &str,
    source: Option<&Source>,
) -> Result<Manifest> {
    let mut manifest = Manifest::load(dir)?;
    manifest.name()?;

    manifest.set_version(version, normalized);
    if let Some(source) = source {
        manifest.set_source(source)?;
    }

    manifest.save()?;
    Ok(manifest)
}

/// Why a package name could not be split.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackageNameError {
    #[error("package name `{0}` is not of the form vendor/package")]
    MissingSeparator(String),
    #[error("package name `{0}` has an empty vendor or package part")]
    EmptyComponent(String),
    #[error("package name `{0}` has more than one `/`")]
    TooManyComponents(String),
}

/// A `vendor/package` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageName {
    pub namespace: String,
    pub name: String,
}

impl PackageName {
    pub fn parse(full: &str) -> Result<Self, PackageNameError> {
        let (namespace, name) = full
            .split_once('/')
            .ok_or_else(|| PackageNameError::MissingSeparator(full.to_string()))?;

        if name.contains('/') {
            return Err(PackageNameError::TooManyComponents(full.to_string()));
        }
        if namespace.is_empty() || name.is_empty() {
            return Err(PackageNameError::EmptyComponent(full.to_string()));
        }

        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// `{namespace}-{name}-{commit}.zip`
    pub fn artifact_file_name(&self, commit: &str) -> String {
        format!("{}-{}-{}.zip", self.namespace, self.name, commit)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
