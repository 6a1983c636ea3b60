// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Background readers of a worker's output.
//!
//! Status lines have the form `<priority> <text>`; a line without a known
//! priority is `info`. Text naming a worker state moves the controller to it.

use crate::controller::Shared;
use crate::state::WorkerState;
use log::{debug, warn};
use slc_log::Priority;
use std::io::{self, BufRead, BufReader, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) const WORKER_EXITED: &str = "worker exited";

pub(crate) fn parse_line(line: &str) -> (Priority, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((head, rest)) => match head.parse::<Priority>() {
            Ok(priority) => (priority, rest.trim()),
            Err(_) => (Priority::Info, line),
        },
        None => match line.parse::<Priority>() {
            Ok(priority) => (priority, ""),
            Err(_) => (Priority::Info, line),
        },
    }
}

/// Read status lines until end of stream. Ends early once a newer load or
/// an abort made this listener's epoch stale.
pub(crate) fn spawn<R>(shared: Arc<Shared>, epoch: u64, output: R) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("listener-{}", shared.name))
        .spawn(move || {
            for line in BufReader::new(output).lines() {
                let Ok(line) = line else {
                    break;
                };
                if !apply(&shared, epoch, &line) {
                    debug!("[{}] stale listener (epoch {epoch}) finished", shared.name);
                    return;
                }
            }
            worker_exited(&shared, epoch);
        })
}

/// Forward a worker's stderr to the log.
pub(crate) fn drain<R>(name: String, output: R) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("stderr-{name}"))
        .spawn(move || {
            for line in BufReader::new(output).lines().map_while(Result::ok) {
                debug!("[{name}] stderr: {line}");
            }
        })
}

/// Apply one status line. Returns false when `epoch` is stale.
pub(crate) fn apply(shared: &Shared, epoch: u64, line: &str) -> bool {
    let (priority, text) = parse_line(line);
    let state = {
        let mut run = shared.lock();
        if run.epoch != epoch {
            return false;
        }
        if run.state != WorkerState::Fatal {
            if let Ok(named) = text.parse::<WorkerState>() {
                run.state = named;
            }
            match priority {
                Priority::Fatal => run.state = WorkerState::Fatal,
                Priority::Error => run.state = WorkerState::Error,
                _ => {}
            }
        }
        if !text.is_empty() {
            text.clone_into(&mut run.last_message);
        }
        run.state
    };
    shared.changed.notify_all();
    if !text.is_empty() {
        log::log!(priority.level(), "[{}] {text}", shared.name);
        surface(shared, priority, text, state);
    }
    true
}

fn worker_exited(shared: &Shared, epoch: u64) {
    let state = {
        let mut run = shared.lock();
        if run.epoch != epoch {
            return;
        }
        if run.state != WorkerState::Fatal {
            run.state = WorkerState::Error;
        }
        WORKER_EXITED.clone_into(&mut run.last_message);
        run.state
    };
    shared.changed.notify_all();
    warn!("[{}] {WORKER_EXITED}", shared.name);
    surface(shared, Priority::Error, WORKER_EXITED, state);
}

fn surface(shared: &Shared, priority: Priority, text: &str, state: WorkerState) {
    let Some(observer) = shared.observer() else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| observer(priority, text, state))).is_err() {
        warn!("[{}] status observer panicked", shared.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("info ready"), (Priority::Info, "ready"));
        assert_eq!(parse_line("FATAL  crashed hard "), (Priority::Fatal, "crashed hard"));
        assert_eq!(parse_line("warn buffer 90% full"), (Priority::Warning, "buffer 90% full"));
        assert_eq!(parse_line("ready"), (Priority::Info, "ready"));
        assert_eq!(parse_line("reading config"), (Priority::Info, "reading config"));
        assert_eq!(parse_line("error"), (Priority::Error, ""));
        assert_eq!(parse_line(""), (Priority::Info, ""));
    }

    fn shared_at(state: WorkerState) -> Arc<Shared> {
        let shared = Arc::new(Shared::new("ttd"));
        shared.lock().state = state;
        shared
    }

    #[test]
    fn test_state_text_applied() {
        let shared = shared_at(WorkerState::Loading);
        assert!(apply(&shared, 0, "info ready"));
        let run = shared.lock();
        assert_eq!(run.state, WorkerState::Ready);
        assert_eq!(run.last_message, "ready");
    }

    #[test]
    fn test_priority_forces_state() {
        let shared = shared_at(WorkerState::Running);
        apply(&shared, 0, "error link lost");
        assert_eq!(shared.lock().state, WorkerState::Error);
        apply(&shared, 0, "fatal crashed");
        assert_eq!(shared.lock().state, WorkerState::Fatal);
        assert_eq!(shared.lock().last_message, "crashed");
    }

    #[test]
    fn test_fatal_is_sticky() {
        let shared = shared_at(WorkerState::Fatal);
        apply(&shared, 0, "info ready");
        let run = shared.lock();
        assert_eq!(run.state, WorkerState::Fatal);
        assert_eq!(run.last_message, "ready");
    }

    #[test]
    fn test_stale_epoch_discarded() {
        let shared = shared_at(WorkerState::Loading);
        shared.lock().epoch = 4;
        assert!(!apply(&shared, 3, "info ready"));
        worker_exited(&shared, 3);
        let run = shared.lock();
        assert_eq!(run.state, WorkerState::Loading);
        assert!(run.last_message.is_empty());
    }

    #[test]
    fn test_observer_sees_text_only() {
        let shared = shared_at(WorkerState::Loading);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        shared.set_observer(Arc::new(move |p: Priority, text: &str, s: WorkerState| {
            sink.lock().unwrap().push((p, text.to_string(), s));
        }));
        apply(&shared, 0, "notice 120 events buffered");
        apply(&shared, 0, "error");
        apply(&shared, 0, "   ");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "120 events buffered");
        assert_eq!(seen[0].2, WorkerState::Loading);
        assert_eq!(shared.lock().state, WorkerState::Error);
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let shared = shared_at(WorkerState::Loading);
        shared.set_observer(Arc::new(|_: Priority, _: &str, _: WorkerState| panic!("boom")));
        assert!(apply(&shared, 0, "info ready"));
        assert_eq!(shared.lock().state, WorkerState::Ready);
    }

    #[test]
    fn test_eof_marks_error() {
        let shared = shared_at(WorkerState::Running);
        let handle = spawn(Arc::clone(&shared), 0, &b"info running\n"[..]).unwrap();
        handle.join().unwrap();
        let run = shared.lock();
        assert_eq!(run.state, WorkerState::Error);
        assert_eq!(run.last_message, WORKER_EXITED);
    }
}
