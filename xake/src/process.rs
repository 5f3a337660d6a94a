// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Subprocess execution for recipes
//!
//! Stdout and stderr are pumped line by line into the build log,
//! prefixed with the owning target's name so interleaved output from
//! parallel recipes stays attributable.

use std::{ffi::OsStr, io, path::Path, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};

use crate::logging::{Level, Logger};

pub(crate) async fn run(
    logger: &Logger,
    tag: &str,
    program: &str,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    current_dir: &Path,
) -> Result<(), Error> {
    logger.write(Level::Chatty, format!("[{tag}] exec {program}"));

    let mut child = Command::new(program)
        .args(args)
        .current_dir(current_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = pump(logger.clone(), tag.to_owned(), child.stdout.take().expect("piped stdout"));
    let stderr = pump(logger.clone(), tag.to_owned(), child.stderr.take().expect("piped stderr"));

    let status = child.wait().await?;
    let _ = tokio::join!(stdout, stderr);

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(Error::Code(code)),
        None => Err(Error::Terminated),
    }
}

fn pump<R>(logger: Logger, tag: String, pipe: R) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            logger.write(Level::Loud, format!("[{tag}] {line}"));
        }
    })
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("exited with code {0}")]
    Code(i32),
    #[error("terminated by signal")]
    Terminated,
    #[error("io")]
    Io(#[from] io::Error),
}
