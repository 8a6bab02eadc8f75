//! Path guard shared by the filesystem tools.
//!
//! A path is accepted when it has no `..` components, does not fall under a
//! forbidden prefix, and (if roots are configured) lies inside one of the
//! allowed roots. Prefix checks compare whole path components.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Prefixes refused by [`PathGuard::default`].
pub const DEFAULT_FORBIDDEN: &[&str] = &["~/.ssh", "~/.gnupg", "~/.aws", "/etc/shadow"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),

    #[error("access to {path} is forbidden (matches {prefix})")]
    Forbidden { path: String, prefix: String },

    #[error("{0} is outside the allowed directories")]
    OutsideRoots(String),
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    allowed_roots: Vec<PathBuf>,
    forbidden: Vec<PathBuf>,
}

impl PathGuard {
    /// A guard with no restrictions beyond traversal rejection.
    pub fn permissive() -> Self {
        Self {
            allowed_roots: Vec::new(),
            forbidden: Vec::new(),
        }
    }

    pub fn new<R, F>(allowed_roots: R, forbidden: F) -> Self
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        F: IntoIterator,
        F::Item: AsRef<str>,
    {
        Self {
            allowed_roots: allowed_roots
                .into_iter()
                .map(|r| expand_tilde(r.as_ref()))
                .collect(),
            forbidden: forbidden
                .into_iter()
                .map(|f| expand_tilde(f.as_ref()))
                .collect(),
        }
    }

    /// Validate `raw` and return the path to open.
    ///
    /// Existing paths are canonicalised first, so symlinks pointing into a
    /// forbidden location are caught.
    pub fn check(&self, raw: &str) -> Result<PathBuf, PathError> {
        let input = expand_tilde(raw);
        if input.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathError::Traversal(raw.to_string()));
        }

        let resolved = input.canonicalize().unwrap_or_else(|_| input.clone());

        for prefix in &self.forbidden {
            if input.starts_with(prefix) || resolved.starts_with(prefix) {
                return Err(PathError::Forbidden {
                    path: raw.to_string(),
                    prefix: prefix.display().to_string(),
                });
            }
        }

        if !self.allowed_roots.is_empty()
            && !self.allowed_roots.iter().any(|root| {
                let root = root.canonicalize().unwrap_or_else(|_| root.clone());
                resolved.starts_with(&root)
            })
        {
            return Err(PathError::OutsideRoots(raw.to_string()));
        }

        Ok(resolved)
    }
}

impl Default for PathGuard {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), DEFAULT_FORBIDDEN.iter().copied())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => {
            home.join(rest.trim_start_matches('/'))
        }
        _ => Path::new(path).to_path_buf(),
    }
}
