// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{num::NonZeroUsize, path::PathBuf, thread};

use crate::logging::{CustomSink, Level};

/// Immutable configuration for one build invocation
pub struct Options {
    /// Directory globs and file targets resolve against
    pub root: PathBuf,
    /// Worker pool cap
    pub jobs: usize,
    /// Initial targets; `main` when left empty
    pub want: Vec<String>,
    /// Enables the file sink together with `file_log_level`
    pub file_log: Option<PathBuf>,
    pub file_log_level: Level,
    /// Console sink level
    pub con_log_level: Level,
    /// Additional sink composed with the built-ins
    pub custom_logger: Option<CustomSink>,
    /// Script-level variables visible through `get_var`
    pub vars: Vec<(String, String)>,
    /// Return the aggregated failure from `run`, or swallow it after
    /// logging
    pub fail_on_error: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            jobs: num_cpus(),
            want: vec![],
            file_log: None,
            file_log_level: Level::Chatty,
            con_log_level: Level::Normal,
            custom_logger: None,
            vars: vec![],
            fail_on_error: true,
        }
    }
}

pub fn num_cpus() -> usize {
    thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}
