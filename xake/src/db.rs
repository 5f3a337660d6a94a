// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Persistent build database
//!
//! An append-only record log at `<root>/.xake`, replayed into memory on
//! open with the latest entry per target winning. All access funnels
//! through a single mailbox task, so reads stay consistent with writes
//! and the file only ever has one writer.
//!
//! The log is versioned: a header line, then one record per line. A
//! torn tail record (crash mid-append) is discarded at the next open by
//! truncating back to the last consistent prefix. Any deeper damage
//! downgrades to an empty database with a warning rather than an error.

use std::{collections::HashMap, io, path::PathBuf};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    dependency::BuildResult,
    logging::{Level, Logger},
    target::Target,
};

const VERSION: u32 = 1;

/// Compact the log on close once stale records outnumber live ones
/// by this factor.
const COMPACT_RATIO: usize = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
}

impl Header {
    fn current() -> Self {
        Self {
            magic: "xake-db".into(),
            version: VERSION,
        }
    }

    fn is_current(&self) -> bool {
        self.magic == "xake-db" && self.version == VERSION
    }
}

enum Request {
    Get {
        target: Target,
        resp: oneshot::Sender<Option<BuildResult>>,
    },
    Put {
        result: BuildResult,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Close {
        resp: oneshot::Sender<Result<(), Error>>,
    },
}

/// Handle to the database mailbox, freely cloneable
#[derive(Clone)]
pub struct Database {
    tx: mpsc::Sender<Request>,
}

impl Database {
    /// Open (or create) the database backing file and start the
    /// mailbox task. A file we cannot make sense of is reported and
    /// replaced with an empty database.
    pub fn open(path: impl Into<PathBuf>, logger: Logger) -> Result<Self, Error> {
        let path = path.into();
        let mut state = State::load(&path, &logger)?;

        let (tx, mut rx) = mpsc::channel::<Request>(64);

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Get { target, resp } => {
                        let _ = resp.send(state.map.get(&target).cloned());
                    }
                    Request::Put { result, resp } => {
                        let _ = resp.send(state.append(result));
                    }
                    Request::Close { resp } => {
                        let _ = resp.send(state.flush());
                        break;
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    pub async fn get(&self, target: &Target) -> Result<Option<BuildResult>, Error> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Request::Get {
                target: target.clone(),
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn put(&self, result: BuildResult) -> Result<(), Error> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Request::Put { result, resp })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?
    }

    /// Flush, optionally compact, and stop the mailbox. Requests sent
    /// after closing fail with [`Error::Closed`].
    pub async fn close(&self) -> Result<(), Error> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Request::Close { resp })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?
    }
}

struct State {
    path: PathBuf,
    file: fs::File,
    map: HashMap<Target, BuildResult>,
    records: usize,
}

impl State {
    fn load(path: &std::path::Path, logger: &Logger) -> Result<Self, Error> {
        let mut map = HashMap::new();
        let mut records = 0;
        let mut fresh = true;

        match fs::read_to_string(path) {
            Ok(contents) => match replay(&contents, &mut map) {
                Replay::Intact { records: n } => {
                    records = n;
                    fresh = false;
                }
                Replay::TornTail { records: n, valid_len } => {
                    logger.write(
                        Level::Chatty,
                        format!("db: discarding torn tail record in {}", path.display()),
                    );
                    let file = fs::OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_len as u64)?;
                    records = n;
                    fresh = false;
                }
                Replay::Unusable => {
                    logger.write(
                        Level::Normal,
                        format!(
                            "warning: build database {} is unreadable, starting empty",
                            path.display()
                        ),
                    );
                    map.clear();
                    fs::remove_file(path)?;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(_) => {
                logger.write(
                    Level::Normal,
                    format!(
                        "warning: build database {} is unreadable, starting empty",
                        path.display()
                    ),
                );
                fs::remove_file(path)?;
            }
        }

        let mut file = fs::OpenOptions::new().append(true).create(true).open(path)?;

        if fresh {
            write_line(&mut file, &Header::current())?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            records,
        })
    }

    fn append(&mut self, result: BuildResult) -> Result<(), Error> {
        write_line(&mut self.file, &result)?;

        self.records += 1;
        self.map.insert(result.target.clone(), result);

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        use io::Write;

        self.file.flush()?;

        if self.records > self.map.len() * COMPACT_RATIO {
            self.compact()?;
        }

        Ok(())
    }

    /// Rewrite the log as a latest-entry-per-target snapshot, swapped
    /// in with an atomic rename.
    fn compact(&mut self) -> Result<(), Error> {
        let tmp = self.path.with_extension("compact");

        let mut file = fs::File::create(&tmp)?;
        write_line(&mut file, &Header::current())?;
        for result in self.map.values() {
            write_line(&mut file, result)?;
        }

        fs::rename(&tmp, &self.path)?;
        self.file = fs::OpenOptions::new().append(true).open(&self.path)?;
        self.records = self.map.len();

        Ok(())
    }
}

enum Replay {
    Intact { records: usize },
    TornTail { records: usize, valid_len: usize },
    Unusable,
}

fn replay(contents: &str, map: &mut HashMap<Target, BuildResult>) -> Replay {
    let mut lines = contents.split_inclusive('\n');

    let Some(first) = lines.next() else {
        return Replay::Unusable;
    };
    let header = serde_json::from_str::<Header>(first.trim_end());
    if !header.map(|h| h.is_current()).unwrap_or_default() {
        return Replay::Unusable;
    }

    let mut records = 0;
    let mut valid_len = first.len();

    for line in lines {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            valid_len += line.len();
            continue;
        }

        match serde_json::from_str::<BuildResult>(trimmed) {
            Ok(result) => {
                map.insert(result.target.clone(), result);
                records += 1;
                valid_len += line.len();
            }
            Err(_) => {
                return Replay::TornTail { records, valid_len };
            }
        }
    }

    Replay::Intact { records }
}

fn write_line<T: Serialize>(file: &mut fs::File, value: &T) -> Result<(), Error> {
    use io::Write;

    let mut line = serde_json::to_string(value)?;
    line.push('\n');

    file.write_all(line.as_bytes())?;
    file.flush()?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encode")]
    Encode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
    #[error("database mailbox closed")]
    Closed,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dependency::Dependency;
    use crate::target::Artifact;
    use std::path::Path;

    fn quiet() -> Logger {
        Logger::builder().build()
    }

    fn result(name: &str) -> BuildResult {
        let mut result = BuildResult::new(Target::Phony(name.into()));
        result.depends.push(Dependency::AlwaysRerun);
        result
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".xake");

        let db = Database::open(&path, quiet()).unwrap();
        db.put(result("main")).await.unwrap();
        db.close().await.unwrap();

        let db = Database::open(&path, quiet()).unwrap();
        let stored = db.get(&Target::Phony("main".into())).await.unwrap();
        let stored = stored.expect("record restored");
        assert_eq!(stored.target, Target::Phony("main".into()));
        assert_eq!(stored.depends, vec![Dependency::AlwaysRerun]);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn latest_entry_per_target_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".xake");

        let db = Database::open(&path, quiet()).unwrap();

        let target = Target::File(Artifact::resolve(Path::new("/p"), "out.txt"));
        let mut first = BuildResult::new(target.clone());
        first.depends.push(Dependency::AlwaysRerun);
        let mut second = BuildResult::new(target.clone());
        second.depends.push(Dependency::EnvVar {
            name: "MODE".into(),
            value: None,
        });

        db.put(first).await.unwrap();
        db.put(second.clone()).await.unwrap();
        db.close().await.unwrap();

        let db = Database::open(&path, quiet()).unwrap();
        assert_eq!(db.get(&target).await.unwrap(), Some(second));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".xake");

        let db = Database::open(&path, quiet()).unwrap();
        db.put(result("main")).await.unwrap();
        db.close().await.unwrap();

        // Simulate a crash mid-append
        use io::Write;
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"target\":{\"Pho").unwrap();
        drop(file);

        let db = Database::open(&path, quiet()).unwrap();
        assert!(db.get(&Target::Phony("main".into())).await.unwrap().is_some());

        // The database stays writable after recovery
        db.put(result("other")).await.unwrap();
        db.close().await.unwrap();

        let db = Database::open(&path, quiet()).unwrap();
        assert!(db.get(&Target::Phony("other".into())).await.unwrap().is_some());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_file_downgrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".xake");

        std::fs::write(&path, "not a database\n").unwrap();

        let db = Database::open(&path, quiet()).unwrap();
        assert_eq!(db.get(&Target::Phony("main".into())).await.unwrap(), None);
        db.close().await.unwrap();
    }
}
