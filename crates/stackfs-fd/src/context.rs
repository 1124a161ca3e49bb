// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-fd extension context
//!
//! Each module stacked above the handle layer may attach private state to an
//! fd under its own name. Entries keep insertion order, which is also the
//! order release notifications are delivered in. Once the owning fd is bound
//! the context is sealed: values of existing keys may still be replaced, but
//! keys can no longer be added or removed.

use std::any::Any;
use std::sync::Arc;

use crate::error::{FsError, FsResult};

/// Opaque module-private value stored in an [`FdContext`].
pub type CtxValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct FdContext {
    entries: Vec<(String, CtxValue)>,
    sealed: bool,
}

impl FdContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Insert or replace the value stored under `key`, returning the old value.
    pub fn insert(&mut self, key: &str, value: CtxValue) -> FsResult<Option<CtxValue>> {
        if let Some(idx) = self.position(key) {
            return Ok(Some(std::mem::replace(&mut self.entries[idx].1, value)));
        }
        if self.sealed {
            return Err(FsError::ContextSealed);
        }
        self.entries.push((key.to_string(), value));
        Ok(None)
    }

    pub fn get(&self, key: &str) -> Option<&CtxValue> {
        self.position(key).map(|idx| &self.entries[idx].1)
    }

    pub fn remove(&mut self, key: &str) -> FsResult<Option<CtxValue>> {
        if self.sealed {
            return Err(FsError::ContextSealed);
        }
        Ok(self.position(key).map(|idx| self.entries.remove(idx).1))
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CtxValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry regardless of the seal. Only used during fd teardown.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for FdContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdContext")
            .field("keys", &self.keys())
            .field("sealed", &self.sealed)
            .finish()
    }
}
