//! Logging hooks.
//!
//! Diagnostics go through the injectable [`Logger`] trait so embedding
//! applications can route engine output into their own logging stack. Raw
//! wire traffic goes to a per-session [`WireJournal`] file instead, which
//! keeps frame dumps out of the diagnostic stream.

use crate::fix::mem::MsgBuf;
use crate::fix::SessionError;

use chrono::offset::Local;
use chrono::{DateTime, Duration};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use std::path::Path;
use std::time::Instant;

use anyhow::Result;

const JOURNAL_FILE_TYPE: &str = "log";

/// Severity of a diagnostic line, lowest value most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(s)
    }
}

/// Diagnostic sink injected through the settings. Implementations must be
/// cheap to call from session tasks; `enabled` lets callers skip formatting
/// for suppressed levels.
pub trait Logger: Send + Sync {
    fn enabled(&self, level: LogLevel) -> bool;
    fn log(&self, level: LogLevel, line: &str);
}

/// Default logger: levels up to `Info` to standard output.
pub struct StdoutLogger {
    max_level: LogLevel,
}

impl StdoutLogger {
    pub fn new(max_level: LogLevel) -> Self {
        StdoutLogger { max_level }
    }
}

impl Default for StdoutLogger {
    fn default() -> Self {
        StdoutLogger::new(LogLevel::Info)
    }
}

impl Logger for StdoutLogger {
    fn enabled(&self, level: LogLevel) -> bool {
        level <= self.max_level
    }
    fn log(&self, level: LogLevel, line: &str) {
        if self.enabled(level) {
            println!("{} {}", level, line);
        }
    }
}

enum JournalRequest {
    Append(String, Instant),
    Disconnect(oneshot::Sender<Result<(), SessionError>>),
}

/// Per-session frame journal: every inbound and outbound frame, timestamped,
/// one per line, SOH rendered as `|`. Appends happen on a dedicated task so
/// the session loop never blocks on file I/O.
pub(super) struct WireJournal {
    sender: mpsc::UnboundedSender<JournalRequest>,
}

impl WireJournal {
    pub(super) async fn open(dir: &Path, session_name: &str) -> Result<WireJournal> {
        tokio::fs::create_dir_all(dir).await?;
        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(session_name).with_extension(JOURNAL_FILE_TYPE))
            .await?;

        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let begin_time = Local::now();
            let begin_instant = Instant::now();
            while let Some(req) = receiver.recv().await {
                match req {
                    JournalRequest::Append(line, instant) => {
                        let stamp = match Duration::from_std(instant.duration_since(begin_instant))
                        {
                            Ok(d) => begin_time + d,
                            Err(_) => Local::now(),
                        };
                        if let Err(e) = append_line(&mut journal, line, stamp).await {
                            eprintln!("error writing wire journal: {e:?}");
                        }
                    }
                    JournalRequest::Disconnect(sender) => {
                        let resp = flush(&mut journal).await;
                        let _ = sender.send(resp);
                    }
                }
            }
        });

        Ok(WireJournal { sender })
    }

    pub(super) fn record(&self, buf: &MsgBuf) -> Result<(), SessionError> {
        let req = JournalRequest::Append(format!("{:?}", buf), Instant::now());
        self.sender.send(req).map_err(to_io_err)?;
        Ok(())
    }

    pub(super) async fn disconnect(&self) -> Result<(), SessionError> {
        let (sender, receiver) = oneshot::channel();
        let req = JournalRequest::Disconnect(sender);
        self.sender.send(req).map_err(to_io_err)?;
        receiver.await.map_err(to_io_err)?
    }
}

async fn append_line(
    journal: &mut File,
    line: String,
    time: DateTime<Local>,
) -> Result<(), SessionError> {
    journal
        .write_all(format!("{} : {}\n", time.format("%Y%m%d-%H:%M:%S%.9f"), line).as_bytes())
        .await?;
    journal.flush().await?;
    Ok(())
}

async fn flush(journal: &mut File) -> Result<(), SessionError> {
    journal.flush().await?;
    Ok(())
}

fn to_io_err<E>(e: E) -> std::io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    std::io::Error::new(std::io::ErrorKind::Other, e)
}
