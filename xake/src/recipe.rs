// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe runtime
//!
//! A recipe body executes with an ambient [`TaskContext`] through which
//! it demands other targets, reads variables and enumerates files.
//! Every such call is captured as a [`Dependency`] in call order; the
//! accumulated list becomes the target's persisted build result when
//! the recipe returns successfully.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    dependency::{BuildResult, Dependency},
    executor::{self, Executor},
    logging::Level,
    pool::Permit,
    process,
    target::{Artifact, Target},
};

/// The user-supplied body of a rule
#[derive(Clone)]
pub struct Recipe(Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>);

impl Recipe {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self(Arc::new(move |ctx| body(ctx).boxed()))
    }

    pub(crate) fn invoke(&self, ctx: TaskContext) -> BoxFuture<'static, Result<(), Error>> {
        (self.0)(ctx)
    }
}

/// Ambient context handed to a running recipe
///
/// Cheap to clone; all clones feed the same pending build result.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    target: Target,
    executor: Executor,
    depends: Mutex<Vec<Dependency>>,
    permit: tokio::sync::Mutex<Permit>,
}

impl TaskContext {
    pub(crate) fn new(executor: Executor, target: Target, permit: Permit) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                target,
                executor,
                depends: Mutex::new(vec![]),
                permit: tokio::sync::Mutex::new(permit),
            }),
        }
    }

    /// The target this recipe is producing
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// The file behind the target, for recipes bound to file rules
    pub fn artifact(&self) -> Option<&Artifact> {
        self.inner.target.as_artifact()
    }

    pub fn root(&self) -> &Path {
        self.inner.executor.root()
    }

    /// Execute the named targets before continuing, recording each as
    /// a dependency. Names bound to a phony rule resolve phony, all
    /// others resolve to files under the project root.
    pub async fn need<S: AsRef<str>>(&self, names: impl IntoIterator<Item = S>) -> Result<(), Error> {
        let targets = names
            .into_iter()
            .map(|name| self.inner.executor.resolve(name.as_ref()))
            .collect();

        self.need_targets(targets).await
    }

    /// Like [`need`](Self::need), but every name is taken as a file
    pub async fn need_files(
        &self,
        paths: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<(), Error> {
        let targets = paths
            .into_iter()
            .map(|path| Target::File(Artifact::resolve(self.root(), path.as_ref())))
            .collect();

        self.need_targets(targets).await
    }

    async fn need_targets(&self, targets: Vec<Target>) -> Result<(), Error> {
        // The concurrency permit goes back to the pool for as long as
        // we wait on dependencies, otherwise nested need chains could
        // exhaust the cap and stall the whole build.
        let mut permit = self.inner.permit.lock().await;
        let outcome = self.inner.executor.exec_need(&mut permit, targets).await;
        drop(permit);

        let (_, depends) = outcome.map_err(|e| Error::Dependency(Box::new(e)))?;
        self.record_all(depends);

        Ok(())
    }

    /// Read an OS environment variable, recording the observed value
    pub fn get_env(&self, name: impl AsRef<str>) -> Option<String> {
        let name = name.as_ref();
        let value = std::env::var(name).ok();

        self.record(Dependency::EnvVar {
            name: name.to_owned(),
            value: value.clone(),
        });

        value
    }

    /// Read a script-level variable, recording the observed value
    pub fn get_var(&self, name: impl AsRef<str>) -> Option<String> {
        let name = name.as_ref();
        let value = self.inner.executor.var(name);

        self.record(Dependency::Var {
            name: name.to_owned(),
            value: value.clone(),
        });

        value
    }

    /// Enumerate the files matching `spec` under the project root,
    /// recording the resolved list
    pub async fn get_files(&self, spec: &fileset::Fileset) -> Result<Vec<PathBuf>, Error> {
        let expanded = {
            let spec = spec.clone();
            let root = self.root().to_path_buf();
            tokio::task::spawn_blocking(move || spec.expand(&root))
                .await
                .expect("expand fileset")?
        };

        self.record(Dependency::Filelist {
            spec: spec.clone(),
            files: expanded.clone(),
        });

        Ok(expanded)
    }

    /// Opt out of caching: this target rebuilds on every run
    pub fn always_rerun(&self) {
        self.record(Dependency::AlwaysRerun);
    }

    pub fn write_log(&self, level: Level, message: impl AsRef<str>) {
        self.inner.executor.logger().write(level, message);
    }

    /// Write `contents` to this recipe's file target and record the
    /// produced snapshot, so an untouched output skips the next run
    pub async fn write_text(&self, contents: impl AsRef<str>) -> Result<(), Error> {
        let Some(artifact) = self.artifact() else {
            return Err(Error::NoFileTarget(self.inner.target.name()));
        };

        if let Some(parent) = artifact.path().parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        fs_err::tokio::write(artifact.path(), contents.as_ref()).await?;

        let modified = artifact.modified()?;
        self.record(Dependency::File {
            artifact: artifact.clone(),
            modified,
        });

        Ok(())
    }

    /// Run a subprocess, streaming its output into the build log
    /// tagged with this target's name. Fails on non-zero exit.
    pub async fn run(
        &self,
        program: impl AsRef<str>,
        args: impl IntoIterator<Item = impl AsRef<std::ffi::OsStr>>,
    ) -> Result<(), Error> {
        let tag = self.inner.target.name();

        process::run(
            self.inner.executor.logger(),
            &tag,
            program.as_ref(),
            args,
            self.root(),
        )
        .await
        .map_err(Error::Process)
    }

    fn record(&self, dependency: Dependency) {
        self.inner.depends.lock().expect("mutex lock").push(dependency);
    }

    fn record_all(&self, depends: Vec<Dependency>) {
        self.inner.depends.lock().expect("mutex lock").extend(depends);
    }

    /// Snapshot the accumulated dependencies into a persistable result
    pub(crate) fn finish(&self) -> BuildResult {
        let mut result = BuildResult::new(self.inner.target.clone());
        result.depends = self.inner.depends.lock().expect("mutex lock").clone();
        result
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("fileset")]
    Fileset(#[from] fileset::Error),
    #[error("dependency failed: {0}")]
    Dependency(#[source] Box<executor::Error>),
    #[error("process")]
    Process(#[source] process::Error),
    #[error("'{0}' is not a file target")]
    NoFileTarget(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Shorthand for failing a recipe with a plain message
    pub fn message(message: impl ToString) -> Self {
        Self::Message(message.to_string())
    }
}
