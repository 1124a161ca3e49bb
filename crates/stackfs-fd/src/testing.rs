// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only modules for observing fd teardown

use std::sync::{Arc, Mutex};

use crate::fd::FdObject;
use crate::module::{Module, ReleaseStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Release { module: String, pid: u32 },
    ReleaseDir { module: String, pid: u32 },
}

/// Module that appends every release notification to a (possibly shared) log.
pub struct RecordingModule {
    name: String,
    log: Arc<Mutex<Vec<Event>>>,
}

impl RecordingModule {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_log(name, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_log(name: &str, log: Arc<Mutex<Vec<Event>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }
}

impl Module for RecordingModule {
    fn release(&self, fd: &FdObject) -> ReleaseStatus {
        self.log.lock().unwrap().push(Event::Release {
            module: self.name.clone(),
            pid: fd.pid().as_u32(),
        });
        ReleaseStatus::Released
    }

    fn release_dir(&self, fd: &FdObject) -> ReleaseStatus {
        self.log.lock().unwrap().push(Event::ReleaseDir {
            module: self.name.clone(),
            pid: fd.pid().as_u32(),
        });
        ReleaseStatus::Released
    }
}
