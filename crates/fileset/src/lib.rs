// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Glob based file matching & enumeration
//!
//! A [`Pattern`] matches a single path relative to some root directory,
//! where `*` stays within one path segment and `**` crosses segments.
//! A [`Fileset`] bundles include and exclude patterns and expands to a
//! deterministic, sorted list of files for a fixed filesystem snapshot.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Matching rules shared by every pattern: `*` never crosses a
/// separator and case sensitivity follows the host filesystem.
fn match_options() -> glob::MatchOptions {
    glob::MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// A single glob pattern, relative to a project root
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Pattern {
    raw: String,
    compiled: glob::Pattern,
}

impl Pattern {
    pub fn new(pattern: impl AsRef<str>) -> Result<Self, Error> {
        let raw = pattern.as_ref().to_owned();
        let compiled = glob::Pattern::new(&raw)?;

        Ok(Self { raw, compiled })
    }

    /// The pattern as originally written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if `path`, taken relative to `root`, matches.
    ///
    /// A path outside `root` is matched as-is, allowing absolute
    /// patterns to be used against absolute paths.
    pub fn matches(&self, root: &Path, path: &Path) -> bool {
        let relative = path.strip_prefix(root).unwrap_or(path);

        self.compiled.matches_path_with(relative, match_options())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Pattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.raw
    }
}

/// An ordered set of include patterns with optional excludes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fileset {
    includes: Vec<Pattern>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    excludes: Vec<Pattern>,
}

impl Fileset {
    pub fn new<S: AsRef<str>>(includes: impl IntoIterator<Item = S>) -> Result<Self, Error> {
        Ok(Self {
            includes: includes
                .into_iter()
                .map(Pattern::new)
                .collect::<Result<_, _>>()?,
            excludes: vec![],
        })
    }

    /// Add exclude patterns, filtering files out of every expansion
    pub fn exclude<S: AsRef<str>>(mut self, excludes: impl IntoIterator<Item = S>) -> Result<Self, Error> {
        self.excludes = excludes
            .into_iter()
            .map(Pattern::new)
            .collect::<Result<_, _>>()?;

        Ok(self)
    }

    /// Enumerate all files under `root` matched by the include patterns
    /// and not matched by any exclude pattern.
    ///
    /// The returned paths are absolute, deduplicated and sorted, so two
    /// expansions over an unchanged tree compare equal.
    pub fn expand(&self, root: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut files = vec![];

        for include in &self.includes {
            let full = root.join(include.as_str());

            for entry in glob::glob_with(&full.to_string_lossy(), match_options())? {
                let path = entry.map_err(|e| Error::Io(e.into_error()))?;

                if !path.is_file() {
                    continue;
                }
                if self.excludes.iter().any(|pattern| pattern.matches(root, &path)) {
                    continue;
                }

                files.push(path);
            }
        }

        files.sort();
        files.dedup();

        Ok(files)
    }
}

impl fmt::Display for Fileset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, include) in self.includes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{include}")?;
        }
        for exclude in &self.excludes {
            write!(f, " -{exclude}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("io")]
    Io(#[from] io::Error),
}
