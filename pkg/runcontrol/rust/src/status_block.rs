// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Memory-mapped status block shared between a controller and its worker.
//!
//! Every field has exactly one writer: the controller owns the request and
//! run numbers, the worker owns its state and event counter.

use crate::state::WorkerState;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Environment variable through which a worker learns the block's path.
pub const STATUS_BLOCK_ENV: &str = "SLC_STATUS_BLOCK";

const BLOCK_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Request,
    ExpNo,
    RunNo,
    SubNo,
    State,
    Events,
}

impl Field {
    const SUPERVISOR_OWNED: [Field; 4] = [Field::Request, Field::ExpNo, Field::RunNo, Field::SubNo];

    fn offset(self) -> usize {
        self as usize * size_of::<u32>()
    }

    pub fn is_worker_owned(self) -> bool {
        matches!(self, Field::State | Field::Events)
    }
}

/// Request the controller posts for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    None = 0,
    Start = 1,
    Stop = 2,
    Pause = 3,
    Resume = 4,
}

impl Request {
    pub fn from_code(code: u32) -> Request {
        match code {
            1 => Request::Start,
            2 => Request::Stop,
            3 => Request::Pause,
            4 => Request::Resume,
            _ => Request::None,
        }
    }
}

#[derive(Debug)]
pub struct StatusBlock {
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
}

impl StatusBlock {
    /// Create the block at `path`, or zero it if it already exists.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(BLOCK_LEN as u64)?;
        let mut block = Self::map(file, path)?;
        block.mmap.fill(0);
        block.mmap.flush()?;
        Ok(block)
    }

    /// Attach to a block created by the controller.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < BLOCK_LEN as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a status block", path.display()),
            ));
        }
        Self::map(file, path)
    }

    fn map(file: File, path: &Path) -> io::Result<Self> {
        // SAFETY: the file is open read/write and at least BLOCK_LEN bytes long.
        let mmap = unsafe { MmapOptions::new().len(BLOCK_LEN).map_mut(&file)? };
        Ok(Self {
            mmap,
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cell(&self, field: Field) -> &AtomicU32 {
        // SAFETY: the mapping is page aligned and BLOCK_LEN bytes long, every
        // offset is a multiple of 4 inside it, and all access goes through
        // atomics because the other side of the mapping is another process.
        unsafe { &*(self.mmap.as_ptr().add(field.offset()) as *const AtomicU32) }
    }

    pub fn get(&self, field: Field) -> u32 {
        self.cell(field).load(Ordering::Acquire)
    }

    pub fn set(&self, field: Field, value: u32) {
        self.cell(field).store(value, Ordering::Release);
    }

    /// Returns the new value.
    pub fn increment(&self, field: Field) -> u32 {
        self.cell(field).fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn request(&self) -> Request {
        Request::from_code(self.get(Field::Request))
    }

    pub fn post_request(&self, request: Request) {
        self.set(Field::Request, request as u32);
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        WorkerState::from_code(self.get(Field::State))
    }

    /// Zero the controller-owned fields.
    pub fn clear(&self) {
        for field in Field::SUPERVISOR_OWNED {
            self.set(field, 0);
        }
    }
}
