// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Change detection
//!
//! Decides whether a target's last persisted build result still
//! describes the world. Verdicts are memoised per build invocation so
//! walking a shared dependency subtree stays linear, and any probing
//! failure counts as dirty rather than aborting the build.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    db::{self, Database},
    dependency::{BuildResult, Dependency, TOLERANCE},
    target::Target,
};

/// Why a target must rebuild, or `None` when it is up to date
pub(crate) type Verdict = Option<String>;

pub(crate) struct ChangeDetector {
    db: Database,
    root: PathBuf,
    vars: HashMap<String, String>,
    memo: std::sync::Mutex<HashMap<Target, Verdict>>,
}

impl ChangeDetector {
    pub fn new(db: Database, root: PathBuf, vars: HashMap<String, String>) -> Self {
        Self {
            db,
            root,
            vars,
            memo: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, target: &Target) -> Result<Verdict, db::Error> {
        let mut visiting = HashSet::new();

        self.check_inner(target, &mut visiting).await
    }

    fn check_inner<'a>(
        &'a self,
        target: &'a Target,
        visiting: &'a mut HashSet<Target>,
    ) -> BoxFuture<'a, Result<Verdict, db::Error>> {
        async move {
            if let Some(verdict) = self.memo.lock().expect("mutex lock").get(target) {
                return Ok(verdict.clone());
            }

            // A cycle in recorded dependencies must not recurse forever;
            // the outermost evaluation decides for the whole loop.
            if !visiting.insert(target.clone()) {
                return Ok(None);
            }

            let stored = self.db.get(target).await?;
            let verdict = self.evaluate(target, stored.as_ref(), visiting).await?;

            self.memo
                .lock()
                .expect("mutex lock")
                .insert(target.clone(), verdict.clone());

            Ok(verdict)
        }
        .boxed()
    }

    async fn evaluate(
        &self,
        target: &Target,
        stored: Option<&BuildResult>,
        visiting: &mut HashSet<Target>,
    ) -> Result<Verdict, db::Error> {
        let Some(result) = stored else {
            return Ok(Some("unknown state".into()));
        };

        if result.depends.is_empty() {
            return Ok(Some("no dependencies".into()));
        }

        if let Target::File(artifact) = target {
            if !artifact.exists() {
                return Ok(Some("target not found".into()));
            }
        }

        for dependency in &result.depends {
            if let Some(reason) = self.check_dependency(dependency, visiting).await? {
                return Ok(Some(reason));
            }
        }

        Ok(None)
    }

    async fn check_dependency(
        &self,
        dependency: &Dependency,
        visiting: &mut HashSet<Target>,
    ) -> Result<Verdict, db::Error> {
        let verdict = match dependency {
            Dependency::File { artifact, modified } => match artifact.modified() {
                Ok(now) if now.delta(*modified) <= TOLERANCE => None,
                Ok(_) => Some(format!("{artifact} changed")),
                Err(e) => Some(format!("{artifact} is gone ({e})")),
            },
            Dependency::Artifact { target } => {
                if let Target::File(artifact) = target {
                    if !artifact.exists() {
                        return Ok(Some(format!("{target} is missing")));
                    }
                }

                self.check_inner(target, visiting)
                    .await?
                    .map(|reason| format!("{target} is dirty ({reason})"))
            }
            Dependency::EnvVar { name, value } => {
                (std::env::var(name).ok() != *value).then(|| format!("env {name} changed"))
            }
            Dependency::Var { name, value } => {
                (self.vars.get(name).cloned() != *value).then(|| format!("var {name} changed"))
            }
            Dependency::Filelist { spec, files } => match spec.expand(&self.root) {
                Ok(current) if current == *files => None,
                Ok(_) => Some(format!("files of '{spec}' changed")),
                Err(e) => Some(format!("cannot expand '{spec}' ({e})")),
            },
            Dependency::AlwaysRerun => Some("always rebuild".into()),
        };

        Ok(verdict)
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::dependency::Timestamp;
    use crate::logging::Logger;
    use crate::target::Artifact;

    fn make_detector(dir: &Path, vars: &[(&str, &str)]) -> (ChangeDetector, Database) {
        let db = Database::open(dir.join(".xake"), Logger::builder().build()).unwrap();
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();

        (
            ChangeDetector::new(db.clone(), dir.to_path_buf(), vars),
            db,
        )
    }

    async fn stored(db: &Database, target: Target, depends: Vec<Dependency>) {
        let mut result = BuildResult::new(target);
        result.depends = depends;
        db.put(result).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_targets_are_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, _db) = make_detector(dir.path(), &[]);

        let verdict = detector.check(&Target::Phony("main".into())).await.unwrap();
        assert_eq!(verdict, Some("unknown state".into()));
    }

    #[tokio::test]
    async fn empty_dependency_lists_are_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[]);

        let target = Target::Phony("noop".into());
        stored(&db, target.clone(), vec![]).await;

        let verdict = detector.check(&target).await.unwrap();
        assert_eq!(verdict, Some("no dependencies".into()));
    }

    #[tokio::test]
    async fn snapshots_within_tolerance_stay_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[]);

        let path = dir.path().join("input.txt");
        fs::write(&path, "data").unwrap();

        let artifact = Artifact::resolve(dir.path(), "input.txt");
        let target = Target::Phony("consume".into());

        // Stamp nudged by less than the tolerance window
        let observed = fs::metadata(&path).unwrap().modified().unwrap();
        let nudged = Timestamp::from_system(observed + Duration::from_millis(60));

        stored(
            &db,
            target.clone(),
            vec![Dependency::File {
                artifact: artifact.clone(),
                modified: nudged,
            }],
        )
        .await;

        assert_eq!(detector.check(&target).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_snapshot_files_are_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[]);

        let artifact = Artifact::resolve(dir.path(), "never-written.txt");
        let target = Target::Phony("consume".into());

        stored(
            &db,
            target.clone(),
            vec![Dependency::File {
                artifact,
                modified: Timestamp::now(),
            }],
        )
        .await;

        assert!(detector.check(&target).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn env_drift_is_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[]);

        let target = Target::Phony("build".into());
        stored(
            &db,
            target.clone(),
            vec![Dependency::EnvVar {
                name: "XAKE_TEST_UNSET_VARIABLE".into(),
                value: Some("debug".into()),
            }],
        )
        .await;

        let verdict = detector.check(&target).await.unwrap();
        assert_eq!(verdict, Some("env XAKE_TEST_UNSET_VARIABLE changed".into()));
    }

    #[tokio::test]
    async fn var_match_stays_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[("mode", "release")]);

        let target = Target::Phony("build".into());
        stored(
            &db,
            target.clone(),
            vec![Dependency::Var {
                name: "mode".into(),
                value: Some("release".into()),
            }],
        )
        .await;

        assert_eq!(detector.check(&target).await.unwrap(), None);
    }

    #[tokio::test]
    async fn filelist_drift_is_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[]);

        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.c"), "a").unwrap();

        let spec = fileset::Fileset::new(["src/*.c"]).unwrap();
        let files = spec.expand(dir.path()).unwrap();

        let target = Target::Phony("compile".into());
        stored(
            &db,
            target.clone(),
            vec![Dependency::Filelist { spec, files }],
        )
        .await;

        assert_eq!(detector.check(&target).await.unwrap(), None);

        // A new file matching the spec invalidates the list; verdicts
        // are memoised per run, so ask a fresh detector
        fs::write(dir.path().join("src/b.c"), "b").unwrap();

        let (fresh, _db2) = make_detector(dir.path(), &[]);
        let verdict = fresh.check(&target).await.unwrap();
        assert!(verdict.unwrap().contains("changed"));
    }

    #[tokio::test]
    async fn dirty_needed_targets_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, db) = make_detector(dir.path(), &[]);

        let leaf = Target::Phony("leaf".into());
        stored(&db, leaf.clone(), vec![Dependency::AlwaysRerun]).await;

        let top = Target::Phony("top".into());
        stored(
            &db,
            top.clone(),
            vec![Dependency::Artifact { target: leaf }],
        )
        .await;

        let verdict = detector.check(&top).await.unwrap();
        assert!(verdict.unwrap().contains("leaf"));
    }
}
