// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Dependencies observed while a recipe runs
//!
//! Every interaction a recipe has with the outside world is captured as
//! a tagged [`Dependency`] and appended, in call order, to the pending
//! [`BuildResult`]. The change detector replays that list on the next
//! run to decide whether the target is still up to date.

use std::{
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::target::{Artifact, Target};

/// Observed mtimes within this distance count as unchanged. Filesystems
/// commonly truncate mtimes to whole seconds, while our own writes land
/// well inside this window.
pub const TOLERANCE: Duration = Duration::from_millis(100);

/// One recorded interaction between a recipe and the outside world
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    /// A file was consumed, with the mtime observed at that moment
    File { artifact: Artifact, modified: Timestamp },
    /// Another target was demanded through `need`
    Artifact { target: Target },
    /// An OS environment variable was read
    EnvVar { name: String, value: Option<String> },
    /// A script-level variable was read
    Var { name: String, value: Option<String> },
    /// A fileset was enumerated, producing this exact list
    Filelist {
        spec: fileset::Fileset,
        files: Vec<PathBuf>,
    },
    /// The recipe opted out of caching
    AlwaysRerun,
}

/// Persisted record of a target's last successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub target: Target,
    pub depends: Vec<Dependency>,
    pub built: Timestamp,
}

impl BuildResult {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            depends: vec![],
            built: Timestamp::now(),
        }
    }
}

/// Milliseconds since the unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    pub fn from_system(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self(millis as u64)
    }

    /// Absolute distance between two stamps
    pub fn delta(self, other: Self) -> Duration {
        Duration::from_millis(self.0.abs_diff(other.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delta_is_symmetric() {
        let a = Timestamp(1_000);
        let b = Timestamp(1_080);

        assert_eq!(a.delta(b), Duration::from_millis(80));
        assert_eq!(b.delta(a), Duration::from_millis(80));
        assert!(a.delta(b) <= TOLERANCE);
    }

    #[test]
    fn dependencies_roundtrip_through_serde() {
        let deps = vec![
            Dependency::EnvVar {
                name: "MODE".into(),
                value: Some("debug".into()),
            },
            Dependency::Var {
                name: "out".into(),
                value: None,
            },
            Dependency::AlwaysRerun,
        ];

        let json = serde_json::to_string(&deps).unwrap();
        let back: Vec<Dependency> = serde_json::from_str(&json).unwrap();

        assert_eq!(deps, back);
    }
}
