// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded-parallel task execution with per-target memoisation
//!
//! Each target is admitted at most once per build invocation: the first
//! submit spawns the task and every later submit joins the same shared
//! future. A semaphore caps the number of recipe bodies executing at
//! once; a recipe must surrender its permit while it waits on
//! dependencies (see [`Permit`]), otherwise a `need` chain as deep as
//! the cap would starve itself.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    executor::{Error, ExecStatus},
    target::Target,
};

type TaskFuture = Shared<BoxFuture<'static, Result<ExecStatus, Arc<Error>>>>;

pub(crate) struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<Target, TaskFuture>>,
}

impl WorkerPool {
    pub fn new(jobs: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(jobs.max(1))),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `body` for `target`, or join the in-flight / completed run
    /// if this target was already submitted during this invocation.
    ///
    /// The body only starts once a permit is available and receives
    /// ownership of that permit for its lifetime.
    pub async fn submit<F, Fut>(&self, target: Target, body: F) -> Result<ExecStatus, Arc<Error>>
    where
        F: FnOnce(Permit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<ExecStatus, Arc<Error>>> + Send + 'static,
    {
        let task = {
            let mut tasks = self.tasks.lock().expect("mutex lock");

            if let Some(task) = tasks.get(&target) {
                task.clone()
            } else {
                let semaphore = Arc::clone(&self.semaphore);

                let task = tokio::spawn(async move {
                    let held = Arc::clone(&semaphore)
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");

                    body(Permit {
                        semaphore,
                        held: Some(held),
                    })
                    .await
                })
                .map(|joined| joined.expect("build task panicked"))
                .boxed()
                .shared();

                tasks.insert(target, task.clone());
                task
            }
        };

        task.await
    }
}

/// One unit of the concurrency budget, held while a recipe body runs
pub(crate) struct Permit {
    semaphore: Arc<Semaphore>,
    held: Option<OwnedSemaphorePermit>,
}

impl Permit {
    /// Give the permit back before awaiting dependencies
    pub fn release(&mut self) {
        self.held = None;
    }

    /// Take a permit again before resuming recipe code
    pub async fn reacquire(&mut self) {
        if self.held.is_none() {
            self.held = Some(
                Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore closed"),
            );
        }
    }
}
