// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide tracing setup.
//!
//! Every event becomes one line:
//!
//! ```text
//! I20240102 03:04:05.000006 7 novaflow_exec src/exec/pipeline/plan.rs:120] plan started
//! ```
//!
//! The destination is `$NOVAFLOW_LOG_FILE` when set, otherwise
//! `$NOVAFLOW_LOG_DIR/novaflow.log`, otherwise stderr. A log file that
//! cannot be opened also means stderr.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

const LOG_FILE_ENV: &str = "NOVAFLOW_LOG_FILE";
const LOG_DIR_ENV: &str = "NOVAFLOW_LOG_DIR";
const DEFAULT_LOG_FILE_NAME: &str = "novaflow.log";

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Where formatted lines end up.
#[derive(Clone)]
enum LogTarget {
    File(Arc<Mutex<File>>),
    Stderr,
}

impl LogTarget {
    fn from_env() -> Self {
        match log_path_from_env().and_then(|path| open_append(&path)) {
            Some(file) => LogTarget::File(Arc::new(Mutex::new(file))),
            None => LogTarget::Stderr,
        }
    }

    fn wants_ansi(&self) -> bool {
        match self {
            LogTarget::File(_) => false,
            LogTarget::Stderr => atty::is(atty::Stream::Stderr),
        }
    }
}

/// Per-event handle; file writes take the shared lock for each call.
enum TargetWriter {
    File(Arc<Mutex<File>>),
    Stderr(io::Stderr),
}

impl<'a> MakeWriter<'a> for LogTarget {
    type Writer = TargetWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            LogTarget::File(file) => TargetWriter::File(Arc::clone(file)),
            LogTarget::Stderr => TargetWriter::Stderr(io::stderr()),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::other("novaflow log file lock poisoned")
}

impl Write for TargetWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TargetWriter::File(file) => file.lock().map_err(|_| poisoned())?.write(buf),
            TargetWriter::Stderr(stderr) => stderr.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TargetWriter::File(file) => file.lock().map_err(|_| poisoned())?.flush(),
            TargetWriter::Stderr(stderr) => stderr.flush(),
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn log_path_from_env() -> Option<PathBuf> {
    env_path(LOG_FILE_ENV).or_else(|| env_path(LOG_DIR_ENV).map(|d| d.join(DEFAULT_LOG_FILE_NAME)))
}

fn open_append(path: &Path) -> Option<File> {
    let opened = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(path));
    match opened {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!(
                "novaflow: cannot log to {} ({}), using stderr",
                path.display(),
                err
            );
            None
        }
    }
}

fn severity(level: &Level) -> char {
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        Level::TRACE => 'T',
    }
}

/// Numeric part of `ThreadId(N)`; std has no stable accessor for it.
fn thread_number() -> u64 {
    let id = format!("{:?}", std::thread::current().id());
    id.chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let current = std::thread::current();
        write!(
            writer,
            "{}{} {} {} {}:{}] ",
            severity(meta.level()),
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            thread_number(),
            current.name().unwrap_or("-"),
            meta.file().unwrap_or("unknown"),
            meta.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber with `filter` as an `EnvFilter` directive.
///
/// Only the first call in a process has any effect. A subscriber installed
/// by someone else is left in place.
pub fn init_with_level(filter: &str) {
    INSTALLED.get_or_init(|| {
        let target = LogTarget::from_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_ansi(target.wants_ansi())
            .event_format(LineFormat)
            .with_writer(target)
            .try_init();
    });
}

/// Initializes logging from the loaded config, `info` when there is none.
pub fn init() {
    init_with_level(&crate::common::config::log_filter());
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_uses_glog_letters() {
        assert_eq!(severity(&Level::ERROR), 'E');
        assert_eq!(severity(&Level::WARN), 'W');
        assert_eq!(severity(&Level::TRACE), 'T');
    }

    #[test]
    fn open_append_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("novaflow.log");
        let mut file = open_append(&path).expect("log file");
        writeln!(file, "hello").expect("write");
        assert!(path.exists());
    }
}
