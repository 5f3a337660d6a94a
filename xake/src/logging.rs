// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Leveled multi-sink build log
//!
//! Messages fan out to a console sink, an optional file sink and an
//! optional caller-supplied sink. Each sink filters on its own level.
//! Console writes serialise over a mutex; the file sink owns its file
//! handle behind a mailbox so writers never block on disk.

use std::{
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use tokio::{
    io::AsyncWriteExt,
    sync::mpsc,
    task::JoinHandle,
};

/// Verbosity ranking. A sink set to `Loud` passes everything logged
/// at `Loud` and below; `Silent` admits nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Level {
    Silent,
    Quiet,
    #[default]
    Normal,
    Loud,
    Chatty,
    Diag,
}

impl Level {
    fn admits(self, message: Level) -> bool {
        self != Level::Silent && message != Level::Silent && message <= self
    }
}

/// Extra sink composed with the built-ins
pub type CustomSink = Arc<dyn Fn(Level, &str) + Send + Sync>;

enum Sink {
    Console {
        level: Level,
        out: Mutex<io::Stdout>,
    },
    File {
        level: Level,
        tx: mpsc::UnboundedSender<Message>,
    },
    Custom {
        level: Level,
        write: CustomSink,
    },
}

enum Message {
    Line(String),
    Shutdown,
}

#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

struct Inner {
    sinks: Vec<Sink>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Logger {
    pub fn builder() -> Builder {
        Builder {
            sinks: vec![],
            pumps: vec![],
        }
    }

    pub fn write(&self, level: Level, message: impl AsRef<str>) {
        let message = message.as_ref();

        for sink in &self.inner.sinks {
            match sink {
                Sink::Console { level: threshold, out } => {
                    if threshold.admits(level) {
                        let mut out = out.lock().expect("mutex lock");
                        let _ = writeln!(out, "{message}");
                    }
                }
                Sink::File { level: threshold, tx } => {
                    if threshold.admits(level) {
                        let _ = tx.send(Message::Line(format!("[{level:>6}] {message}")));
                    }
                }
                Sink::Custom { level: threshold, write } => {
                    if threshold.admits(level) {
                        write(level, message);
                    }
                }
            }
        }
    }

    /// Flush and stop the file pump(s). Further writes to file sinks
    /// are dropped; console and custom sinks keep working.
    pub async fn close(&self) {
        for sink in &self.inner.sinks {
            if let Sink::File { tx, .. } = sink {
                let _ = tx.send(Message::Shutdown);
            }
        }

        let pumps = std::mem::take(&mut *self.inner.pumps.lock().expect("mutex lock"));
        for pump in pumps {
            let _ = pump.await;
        }
    }
}

pub struct Builder {
    sinks: Vec<Sink>,
    pumps: Vec<JoinHandle<()>>,
}

impl Builder {
    pub fn console(mut self, level: Level) -> Self {
        self.sinks.push(Sink::Console {
            level,
            out: Mutex::new(io::stdout()),
        });
        self
    }

    pub async fn file(mut self, level: Level, path: &Path) -> io::Result<Self> {
        let file = fs_err::tokio::File::create(path).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.pumps.push(tokio::spawn(pump(file, rx)));
        self.sinks.push(Sink::File { level, tx });

        Ok(self)
    }

    pub fn custom(mut self, level: Level, write: CustomSink) -> Self {
        self.sinks.push(Sink::Custom { level, write });
        self
    }

    pub fn build(self) -> Logger {
        Logger {
            inner: Arc::new(Inner {
                sinks: self.sinks,
                pumps: Mutex::new(self.pumps),
            }),
        }
    }
}

async fn pump(file: fs_err::tokio::File, mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut file = file;

    while let Some(message) = rx.recv().await {
        match message {
            Message::Line(line) => {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            Message::Shutdown => break,
        }
    }

    let _ = file.flush().await;
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn levels_rank_by_verbosity() {
        assert!(Level::Silent < Level::Quiet);
        assert!(Level::Quiet < Level::Normal);
        assert!(Level::Normal < Level::Loud);
        assert!(Level::Loud < Level::Chatty);
        assert!(Level::Chatty < Level::Diag);
    }

    #[test]
    fn sinks_filter_independently() {
        assert!(Level::Normal.admits(Level::Quiet));
        assert!(Level::Normal.admits(Level::Normal));
        assert!(!Level::Normal.admits(Level::Loud));
        assert!(!Level::Silent.admits(Level::Quiet));
    }

    #[tokio::test]
    async fn custom_sink_receives_admitted_messages() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |level: Level, message: &str| {
                seen.lock().unwrap().push((level, message.to_owned()));
            })
        };

        let logger = Logger::builder().custom(Level::Normal, sink).build();
        logger.write(Level::Quiet, "kept");
        logger.write(Level::Chatty, "dropped");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(Level::Quiet, "kept".to_owned())]);
    }

    #[tokio::test]
    async fn file_sink_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");

        let logger = Logger::builder().file(Level::Loud, &path).await.unwrap().build();
        logger.write(Level::Normal, "hello");
        logger.write(Level::Diag, "hidden");
        logger.close().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(!contents.contains("hidden"));
    }
}
