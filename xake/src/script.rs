// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build script driver
//!
//! A [`Script`] collects the rule set and configuration, then `run`
//! wires up the logger, database, pool and executor, resolves the
//! want list and drives it to completion.

use std::{collections::HashMap, io, time::Instant};

use crate::{
    db::Database,
    executor::{self, Executor},
    logging::{Level, Logger},
    options::Options,
    rules::{Rule, RuleSet},
};

pub struct Script {
    options: Options,
    rules: RuleSet,
}

impl Script {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            rules: RuleSet::new(),
        }
    }

    /// Append one rule; declaration order decides match precedence
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.add(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        for rule in rules {
            self.rules.add(rule);
        }
        self
    }

    /// Replace the want list from the options
    pub fn want<S: ToString>(mut self, targets: impl IntoIterator<Item = S>) -> Self {
        self.options.want = targets.into_iter().map(|t| t.to_string()).collect();
        self
    }

    /// Run the build to completion
    pub async fn run(self) -> Result<(), Error> {
        let Script { options, rules } = self;

        let root = fs_err::canonicalize(&options.root)?;

        let mut logger = Logger::builder().console(options.con_log_level);
        if let Some(path) = &options.file_log {
            if options.file_log_level != Level::Silent {
                logger = logger.file(options.file_log_level, path).await?;
            }
        }
        if let Some(sink) = options.custom_logger.clone() {
            logger = logger.custom(Level::Diag, sink);
        }
        let logger = logger.build();

        let outcome = drive(&options, rules, root, logger.clone()).await;

        logger.close().await;

        outcome
    }
}

async fn drive(
    options: &Options,
    rules: RuleSet,
    root: std::path::PathBuf,
    logger: Logger,
) -> Result<(), Error> {
    let db = Database::open(root.join(".xake"), logger.clone())?;
    let vars: HashMap<String, String> = options.vars.iter().cloned().collect();

    let executor = Executor::new(
        root,
        rules,
        vars,
        db.clone(),
        logger.clone(),
        options.jobs,
    );

    let want = if options.want.is_empty() {
        vec!["main".to_owned()]
    } else {
        options.want.clone()
    };

    logger.write(Level::Normal, format!("building {}", want.join(", ")));

    let targets = want.iter().map(|name| executor.resolve(name)).collect();

    let started = Instant::now();
    let outcome = executor.exec_many(targets).await;
    let elapsed = started.elapsed();

    if let Err(e) = db.close().await {
        logger.write(
            Level::Normal,
            format!("warning: could not flush build database: {e}"),
        );
    }

    match outcome {
        Ok(_) => {
            logger.write(
                Level::Normal,
                format!("completed in {:.2}s", elapsed.as_secs_f32()),
            );
            Ok(())
        }
        Err(failure) => {
            logger.write(
                Level::Quiet,
                format!("failed in {:.2}s: {failure}", elapsed.as_secs_f32()),
            );

            if options.fail_on_error {
                Err(Error::Build(failure))
            } else {
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] executor::Error),
    #[error("db")]
    Db(#[from] crate::db::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
