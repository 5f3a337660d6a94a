// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Incremental, parallel build engine
//!
//! A build program declares rules (pattern → recipe) and wants
//! (targets to produce). The engine resolves each want to a rule, runs
//! outdated recipes concurrently up to a worker cap, records every
//! dependency a recipe actually touched, and on later runs skips
//! targets whose recorded dependencies are all unchanged. State lives
//! in `<root>/.xake`.
//!
//! ```no_run
//! use xake::{Options, Rule, Script};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut options = Options::default();
//!     options.want = vec!["main".into()];
//!
//!     Script::new(options)
//!         .rule(Rule::demands("main", ["out/hello.txt"]))
//!         .rule(Rule::pattern("out/*.txt", |ctx| async move {
//!             ctx.write_text("hello").await
//!         })?)
//!         .run()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub use self::dependency::{BuildResult, Dependency, Timestamp, TOLERANCE};
pub use self::executor::ExecStatus;
pub use self::logging::{CustomSink, Level, Logger};
pub use self::options::Options;
pub use self::recipe::{Recipe, TaskContext};
pub use self::rules::{Rule, RuleSet};
pub use self::script::Script;
pub use self::target::{Artifact, Target};
pub use fileset::{Fileset, Pattern};

pub mod db;
pub mod dependency;
mod detect;
pub mod executor;
pub mod logging;
pub mod options;
mod pool;
pub mod process;
pub mod recipe;
pub mod rules;
pub mod script;
pub mod target;
