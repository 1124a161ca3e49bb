// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the StackFS handle layer

/// Handle layer error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("fd slot {0} already in use")]
    SlotOccupied(i32),
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("fd already bound to its inode")]
    AlreadyBound,
    #[error("fd context is sealed")]
    ContextSealed,
    #[error("already exists")]
    AlreadyExists,
}

pub type FsResult<T> = Result<T, FsError>;
