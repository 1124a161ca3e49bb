// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stacked module capabilities consumed by fd teardown

use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::fd::FdObject;

/// Outcome of delivering a release notification to a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// The hook ran and the module dropped whatever it kept for the fd.
    Released,
    /// The module has no hook for this kind of fd.
    NoHook,
}

/// A processing layer that may keep private state on fds.
///
/// Both hooks are optional and default to returning
/// [`ReleaseStatus::NoHook`]. Teardown reads the returned status and nothing
/// else: a module that stored context on an fd and then answers `NoHook` gets
/// an `error` event with `consistency_fault = true`, after which teardown moves
/// on to the next context entry. Modules that never call `ctx_set` are never
/// asked, so they can leave both hooks at the default.
///
/// Hooks run with no handle-layer locks held.
#[cfg_attr(test, mockall::automock)]
pub trait Module: Send + Sync {
    /// Called once when the last reference to a regular-file fd goes away.
    fn release(&self, _fd: &FdObject) -> ReleaseStatus {
        ReleaseStatus::NoHook
    }

    /// Called once when the last reference to a directory fd goes away.
    fn release_dir(&self, _fd: &FdObject) -> ReleaseStatus {
        ReleaseStatus::NoHook
    }
}

/// Ordered registry of the modules stacked over a volume, looked up by name.
#[derive(Default)]
pub struct ModuleGraph {
    modules: Vec<(String, Arc<dyn Module>)>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, module: Arc<dyn Module>) -> FsResult<()> {
        let name = name.into();
        if self.search_by_name(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.modules.push((name, module));
        Ok(())
    }

    /// Builder-style registration. Panics on duplicate names.
    pub fn with_module(mut self, name: impl Into<String>, module: Arc<dyn Module>) -> Self {
        let name = name.into();
        assert!(self.search_by_name(&name).is_none(), "duplicate module name {name}");
        self.modules.push((name, module));
        self
    }

    pub fn search_by_name(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.modules.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for ModuleGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleGraph").field("modules", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passive;
    impl Module for Passive {}

    #[test]
    fn lookup_by_name() {
        let graph = ModuleGraph::new()
            .with_module("client", Arc::new(Passive))
            .with_module("io-cache", Arc::new(Passive));

        assert!(graph.search_by_name("io-cache").is_some());
        assert!(graph.search_by_name("posix").is_none());
        assert_eq!(graph.names(), vec!["client", "io-cache"]);
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut graph = ModuleGraph::new();
        graph.register("client", Arc::new(Passive)).unwrap();
        assert!(matches!(
            graph.register("client", Arc::new(Passive)),
            Err(FsError::AlreadyExists)
        ));
        assert_eq!(graph.len(), 1);
    }
}
