//! Mapping remote URLs to working-copy directory names.

use anyhow::{Result, bail};

/// Host used for local (`file://` or bare path) remotes
pub const LOCAL_HOST: &str = "local";

/// A remote reduced to its host and path.
///
/// Different spellings of one remote (`git@host:a/b.git`,
/// `https://host/a/b`) compare equal. Path segments stay separate, so
/// `a/b_c` and `a_b/c` do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId {
    host: String,
    segments: Vec<String>,
}

impl RemoteId {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            bail!("empty repository URL");
        }

        let (host, path) = split_url(url)?;

        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .map(str::to_string)
            .collect();

        if host.is_empty() || segments.is_empty() {
            bail!("repository URL `{url}` has no host or path");
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            segments,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Flat, filesystem-safe directory name
    pub fn directory_name(&self) -> String {
        std::iter::once(self.host.as_str())
            .chain(self.segments.iter().map(String::as_str))
            .map(sanitize)
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Derive a flat, filesystem-safe directory name from a remote URL.
///
/// `git@github.com:acme/pkg.git` and `https://github.com/acme/pkg` both map
/// to `github.com_acme_pkg`.
pub fn git_url_to_directory(url: &str) -> Result<String> {
    Ok(RemoteId::parse(url)?.directory_name())
}

fn split_url(url: &str) -> Result<(&str, &str)> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok((LOCAL_HOST, path));
    }
    if url.starts_with('/') {
        return Ok((LOCAL_HOST, url));
    }

    if let Some((_, rest)) = url.split_once("://") {
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        let host = host.split_once(':').map_or(host, |(h, _)| h);
        return Ok((host, path));
    }

    // scp-like syntax: [user@]host:path
    match url.split_once(':') {
        Some((authority, path)) => {
            let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
            Ok((host, path))
        }
        None => bail!("unrecognized repository URL `{url}`"),
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
