// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::entry::format_timestamp;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use time::OffsetDateTime;

/// `log` backend writing one line per record:
/// `<RFC3339 time> | <node> | <LEVEL> | <target> | <message>`.
pub struct NodeLogger {
    node: String,
    level: LevelFilter,
    out: Mutex<Box<dyn Write + Send>>,
}

impl NodeLogger {
    pub fn new(node: impl Into<String>, level: LevelFilter) -> Self {
        Self::with_writer(node, level, Box::new(io::stderr()))
    }

    pub fn with_writer(
        node: impl Into<String>,
        level: LevelFilter,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            node: node.into(),
            level,
            out: Mutex::new(out),
        }
    }

    /// Append to a log file, creating it if needed.
    pub fn to_file(node: impl Into<String>, level: LevelFilter, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_writer(node, level, Box::new(file)))
    }

    pub fn format_record(&self, record: &Record<'_>) -> String {
        format!(
            "{} | {} | {} | {} | {}",
            format_timestamp(OffsetDateTime::now_utc()),
            self.node,
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for NodeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format_record(record);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // Nowhere left to report a failing sink.
        let _ = writeln!(out, "{line}");
    }

    fn flush(&self) {
        let _ = self
            .out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
    }
}

/// Install a stderr [`NodeLogger`] as the global logger.
pub fn init(node: &str, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(NodeLogger::new(node, level)))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn emit(logger: &NodeLogger, level: log::Level, msg: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("slc_nsm::dispatcher")
                .args(format_args!("{msg}"))
                .build(),
        );
    }

    #[test]
    fn test_line_format() {
        let buf = SharedBuf::default();
        let logger = NodeLogger::with_writer("RUNCONTROL", LevelFilter::Info, Box::new(buf.clone()));
        emit(&logger, log::Level::Info, "[basf2] spawned (pid=42)");

        let re = Regex::new(
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z \| RUNCONTROL \| INFO \| slc_nsm::dispatcher \| \[basf2\] spawned \(pid=42\)\n$",
        )
        .unwrap();
        let out = buf.contents();
        assert!(re.is_match(&out), "unexpected line: {out:?}");
    }

    #[test]
    fn test_level_filter() {
        let buf = SharedBuf::default();
        let logger = NodeLogger::with_writer("n", LevelFilter::Warn, Box::new(buf.clone()));
        emit(&logger, log::Level::Info, "hidden");
        emit(&logger, log::Level::Error, "shown");
        let out = buf.contents();
        assert!(!out.contains("hidden"));
        assert!(out.contains("shown"));
    }

    #[test]
    fn test_to_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        {
            let logger = NodeLogger::to_file("n", LevelFilter::Debug, &path).unwrap();
            emit(&logger, log::Level::Debug, "first");
            logger.flush();
        }
        {
            let logger = NodeLogger::to_file("n", LevelFilter::Debug, &path).unwrap();
            emit(&logger, log::Level::Debug, "second");
            logger.flush();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }
}
