// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The part of an inode the handle layer depends on
//!
//! An inode keeps the list of fds currently open against it. The same mutex
//! also guards the reference count of every fd bound to the inode, so a
//! lookup can never hand out an fd whose last reference is being dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fd::{Fd, FdObject};
use crate::module::ModuleGraph;
use crate::types::Pid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    Directory,
}

impl InodeKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, InodeKind::Directory)
    }
}

/// State guarded by the inode lock.
#[derive(Default)]
pub(crate) struct InodeFds {
    /// Open fds in bind order. Entries do not count as fd references.
    pub(crate) open: Vec<Arc<FdObject>>,
}

pub struct Inode {
    ino: u64,
    kind: InodeKind,
    graph: Arc<ModuleGraph>,
    fds: Mutex<InodeFds>,
}

impl Inode {
    pub fn new(ino: u64, kind: InodeKind, graph: Arc<ModuleGraph>) -> Arc<Self> {
        Arc::new(Self {
            ino,
            kind,
            graph,
            fds: Mutex::new(InodeFds::default()),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    /// Modules that may hold context on fds of this inode.
    pub fn graph(&self) -> &Arc<ModuleGraph> {
        &self.graph
    }

    pub(crate) fn lock_fds(&self) -> MutexGuard<'_, InodeFds> {
        self.fds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find an open fd for `pid`, taking a reference on it.
    ///
    /// [`Pid::ANY`] matches the first open fd. Ties go to the fd bound first.
    pub fn fd_lookup(&self, pid: Pid) -> Option<Fd> {
        let fds = self.lock_fds();
        fds.open
            .iter()
            .find(|obj| pid.is_any() || obj.pid() == pid)
            .map(|obj| Fd::new_ref(obj, &fds))
    }

    pub fn has_open_fds(&self) -> bool {
        !self.lock_fds().open.is_empty()
    }

    /// Complement of [`has_open_fds`](Self::has_open_fds).
    pub fn fd_list_empty(&self) -> bool {
        !self.has_open_fds()
    }

    pub fn open_fd_count(&self) -> usize {
        self.lock_fds().open.len()
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("open_fds", &self.open_fd_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inode() -> Arc<Inode> {
        Inode::new(7, InodeKind::Regular, Arc::new(ModuleGraph::new()))
    }

    fn bound(inode: &Arc<Inode>, pid: u32) -> Fd {
        let fd = Fd::create(inode, Pid::new(pid));
        fd.bind().unwrap();
        fd
    }

    #[test]
    fn lookup_on_empty_list() {
        let inode = inode();
        assert!(inode.fd_list_empty());
        assert!(inode.fd_lookup(Pid::ANY).is_none());
        assert!(inode.fd_lookup(Pid::new(10)).is_none());
    }

    #[test]
    fn lookup_any_returns_first_bound() {
        let inode = inode();
        let first = bound(&inode, 10);
        let _second = bound(&inode, 20);

        let found = inode.fd_lookup(Pid::ANY).expect("fd");
        assert!(Fd::ptr_eq(&found, &first));
        assert_eq!(first.refcount(), 2);
    }

    #[test]
    fn lookup_by_pid() {
        let inode = inode();
        let _a = bound(&inode, 10);
        let b = bound(&inode, 20);
        let _c = bound(&inode, 20);

        let found = inode.fd_lookup(Pid::new(20)).expect("fd");
        assert!(Fd::ptr_eq(&found, &b));
        assert!(inode.fd_lookup(Pid::new(30)).is_none());
    }

    #[test]
    fn unbound_fds_are_not_discoverable() {
        let inode = inode();
        let _fd = Fd::create(&inode, Pid::new(10));
        assert!(inode.fd_lookup(Pid::ANY).is_none());
        assert!(!inode.has_open_fds());
    }

    #[test]
    fn list_tracks_last_release() {
        let inode = inode();
        let a = bound(&inode, 1);
        let b = bound(&inode, 2);
        assert_eq!(inode.open_fd_count(), 2);

        drop(a);
        assert_eq!(inode.open_fd_count(), 1);
        assert!(inode.has_open_fds());

        drop(b);
        assert!(inode.fd_list_empty());
    }
}
