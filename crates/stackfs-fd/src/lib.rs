// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! StackFS open file handle layer
//!
//! Maps small integer fd numbers to reference-counted fd objects, ties each
//! fd to the inode it was opened against, and fans out release notifications
//! to the stacked modules that kept private state on an fd once its last
//! reference is gone.

pub mod config;
pub mod context;
pub mod error;
pub mod fd;
pub mod inode;
pub mod module;
pub mod table;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FdTableConfig;
pub use context::{CtxValue, FdContext};
pub use error::{FsError, FsResult};
pub use fd::{Fd, FdObject};
pub use inode::{Inode, InodeKind};
pub use module::{Module, ModuleGraph, ReleaseStatus};
pub use table::{FdTable, FdTableStats};
pub use types::Pid;
