// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Stand-in readout worker. Reports its state on stdout, follows the
//! requests posted in the status block and counts events while running
//! (not while paused).
//!
//! `MOCK_WORKER_MODE` selects a misbehaviour:
//! `normal`, `silent` (never ready), `fail-start`, `fatal-on-start`,
//! `crash-running` (exits shortly after a run starts) and `stubborn`
//! (ignores SIGTERM).

use log::{LevelFilter, info};
use nix::sys::signal::{self, SigHandler, Signal};
use slc_runcontrol::WorkerState;
use slc_runcontrol::status_block::{Field, Request, STATUS_BLOCK_ENV, StatusBlock};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(10);

fn report(block: &StatusBlock, state: WorkerState, line: &str) {
    block.set(Field::State, state.code());
    println!("{line}");
}

fn main() -> ExitCode {
    let _ = slc_log::init("mock-worker", LevelFilter::Info);
    let mode = std::env::var("MOCK_WORKER_MODE").unwrap_or_else(|_| "normal".to_string());
    let Some(path) = std::env::var_os(STATUS_BLOCK_ENV).map(PathBuf::from) else {
        eprintln!("{STATUS_BLOCK_ENV} is not set");
        return ExitCode::from(2);
    };
    let block = match StatusBlock::open(&path) {
        Ok(block) => block,
        Err(e) => {
            eprintln!("cannot open {}: {e}", path.display());
            return ExitCode::from(2);
        }
    };

    if mode == "stubborn" {
        // SAFETY: ignoring a signal installs no handler code.
        if let Err(e) = unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigIgn) } {
            eprintln!("cannot ignore SIGTERM: {e}");
        }
    }

    report(&block, WorkerState::Loading, "info loading");
    if mode == "silent" {
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }
    thread::sleep(Duration::from_millis(50));
    report(&block, WorkerState::Ready, "info ready");

    let mut seen = Request::None;
    loop {
        let request = block.request();
        if request != seen {
            seen = request;
            info!("request {request:?}");
            match request {
                Request::Start => {
                    let (exp, run) = (block.get(Field::ExpNo), block.get(Field::RunNo));
                    match mode.as_str() {
                        "fail-start" => println!("error cannot open run database"),
                        "fatal-on-start" => {
                            report(&block, WorkerState::Fatal, "fatal crashed");
                        }
                        _ => {
                            println!("notice run {exp}.{run}");
                            report(&block, WorkerState::Running, "info running");
                            if mode == "crash-running" {
                                thread::sleep(Duration::from_millis(100));
                                return ExitCode::from(3);
                            }
                        }
                    }
                }
                Request::Stop => report(&block, WorkerState::Ready, "info ready"),
                Request::Pause => report(&block, WorkerState::Paused, "info paused"),
                Request::Resume => report(&block, WorkerState::Running, "info running"),
                Request::None => {}
            }
        }
        if block.worker_state() == Some(WorkerState::Running) {
            block.increment(Field::Events);
        }
        thread::sleep(TICK);
    }
}
