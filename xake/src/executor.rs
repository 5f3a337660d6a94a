// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build orchestration
//!
//! The executor ties the pieces together: look up the rule for a
//! demanded target, submit its recipe to the pool, consult the change
//! detector, and persist the result on success. Targets with no rule
//! but an existing file are treated as plain inputs and snapshotted.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    db::{self, Database},
    dependency::Dependency,
    detect::ChangeDetector,
    logging::{Level, Logger},
    pool::{Permit, WorkerPool},
    recipe::{self, Recipe, TaskContext},
    rules::RuleSet,
    target::{Artifact, Target},
};

/// How a demanded target was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The recipe ran to completion
    Succeeded,
    /// The stored result was still valid
    Skipped,
    /// No rule matched, an existing file was snapshotted instead
    JustFile,
}

impl ExecStatus {
    /// Combined status of a group of children
    fn combined(statuses: &[ExecStatus]) -> ExecStatus {
        if statuses.contains(&ExecStatus::Succeeded) {
            ExecStatus::Succeeded
        } else {
            ExecStatus::Skipped
        }
    }
}

#[derive(Clone)]
pub(crate) struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    rules: RuleSet,
    vars: HashMap<String, String>,
    db: Database,
    pool: WorkerPool,
    logger: Logger,
    detector: ChangeDetector,
}

impl Executor {
    pub fn new(
        root: PathBuf,
        rules: RuleSet,
        vars: HashMap<String, String>,
        db: Database,
        logger: Logger,
        jobs: usize,
    ) -> Self {
        let detector = ChangeDetector::new(db.clone(), root.clone(), vars.clone());

        Self {
            inner: Arc::new(Inner {
                root,
                rules,
                vars,
                db,
                pool: WorkerPool::new(jobs),
                logger,
                detector,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.inner.vars.get(name).cloned()
    }

    /// Resolve a demanded name: phony when a phony rule binds it,
    /// otherwise a file under the project root.
    pub fn resolve(&self, name: &str) -> Target {
        if self.inner.rules.is_phony(name) {
            Target::Phony(name.to_owned())
        } else {
            Target::File(Artifact::resolve(&self.inner.root, name))
        }
    }

    /// Execute (or skip, or snapshot) one target, returning its status
    /// and the dependency entry the demanding recipe should record.
    pub fn exec_one(
        &self,
        target: Target,
    ) -> BoxFuture<'static, Result<(ExecStatus, Dependency), Arc<Error>>> {
        let executor = self.clone();

        async move {
            let Some(rule) = executor.inner.rules.locate(&target, &executor.inner.root) else {
                return executor.just_file(target);
            };
            let recipe = rule.recipe().clone();

            let body_executor = executor.clone();
            let body_target = target.clone();

            let status = executor
                .inner
                .pool
                .submit(target.clone(), move |permit| {
                    run_recipe(body_executor, body_target, recipe, permit)
                })
                .await?;

            Ok((status, Dependency::Artifact { target }))
        }
        .boxed()
    }

    /// Execute a group of targets in parallel. All children run to
    /// completion before the first failure propagates.
    pub async fn exec_many(
        &self,
        targets: Vec<Target>,
    ) -> Result<(ExecStatus, Vec<Dependency>), Error> {
        let outcomes =
            futures_util::future::join_all(targets.into_iter().map(|t| self.exec_one(t))).await;

        let mut statuses = vec![];
        let mut depends = vec![];
        let mut failures = vec![];

        for outcome in outcomes {
            match outcome {
                Ok((status, dependency)) => {
                    statuses.push(status);
                    depends.push(dependency);
                }
                Err(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() {
            return Err(Error::Failed(failures));
        }

        Ok((ExecStatus::combined(&statuses), depends))
    }

    /// `exec_many` on behalf of a recipe holding a permit: the permit
    /// is surrendered for the duration of the wait.
    pub async fn exec_need(
        &self,
        permit: &mut Permit,
        targets: Vec<Target>,
    ) -> Result<(ExecStatus, Vec<Dependency>), Error> {
        permit.release();
        let outcome = self.exec_many(targets).await;
        permit.reacquire().await;

        outcome
    }

    /// A target with no rule: an existing file is a plain input and
    /// yields a snapshot, anything else is fatal.
    fn just_file(&self, target: Target) -> Result<(ExecStatus, Dependency), Arc<Error>> {
        match &target {
            Target::File(artifact) => match artifact.modified() {
                Ok(modified) => {
                    self.inner
                        .logger
                        .write(Level::Chatty, format!("{target} is a source file"));

                    Ok((
                        ExecStatus::JustFile,
                        Dependency::File {
                            artifact: artifact.clone(),
                            modified,
                        },
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(Arc::new(Error::NoRule(target.name())))
                }
                Err(e) => Err(Arc::new(Error::Stat {
                    target: target.name(),
                    source: e,
                })),
            },
            Target::Phony(name) => Err(Arc::new(Error::NoRule(name.clone()))),
        }
    }
}

async fn run_recipe(
    executor: Executor,
    target: Target,
    recipe: Recipe,
    permit: Permit,
) -> Result<ExecStatus, Arc<Error>> {
    let inner = &executor.inner;

    let verdict = inner
        .detector
        .check(&target)
        .await
        .map_err(|e| Arc::new(Error::Db(e)))?;

    let Some(reason) = verdict else {
        inner.logger.write(Level::Loud, format!("skipped {target}"));
        return Ok(ExecStatus::Skipped);
    };

    inner
        .logger
        .write(Level::Loud, format!("building {target} ({reason})"));

    let started = Instant::now();
    let ctx = TaskContext::new(executor.clone(), target.clone(), permit);

    match recipe.invoke(ctx.clone()).await {
        Ok(()) => {
            inner
                .db
                .put(ctx.finish())
                .await
                .map_err(|e| Arc::new(Error::Db(e)))?;

            inner.logger.write(
                Level::Loud,
                format!("built {target} in {:.2}s", started.elapsed().as_secs_f32()),
            );

            Ok(ExecStatus::Succeeded)
        }
        Err(failure) => {
            inner
                .logger
                .write(Level::Quiet, format!("failed {target}: {failure}"));

            Err(Arc::new(Error::Recipe {
                target: target.name(),
                source: failure,
            }))
        }
    }
}

fn summarize(failures: &[Arc<Error>]) -> String {
    use itertools::Itertools;

    failures.iter().map(|e| e.to_string()).join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Neither rule nor file is found for '{0}'")]
    NoRule(String),
    #[error("target '{target}' failed")]
    Recipe {
        target: String,
        #[source]
        source: recipe::Error,
    },
    #[error("cannot stat '{target}'")]
    Stat {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("db")]
    Db(#[from] db::Error),
    #[error("{}", summarize(.0))]
    Failed(Vec<Arc<Error>>),
}
