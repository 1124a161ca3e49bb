// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reference-counted fd objects
//!
//! An [`Fd`] is a counted reference to an [`FdObject`]: cloning takes a
//! reference and dropping releases one. The count lives in the object but is
//! only ever changed under the owning inode's lock. The transition to zero
//! detaches the object from the inode's open list under that lock, then the
//! releasing thread notifies every module holding context on the fd with no
//! lock held. Only one thread can observe the zero transition, so teardown
//! runs exactly once.
//!
//! Lock order: table, then inode, then fd context. Module hooks run with none
//! of them held.

use std::any::Any;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, trace};

use crate::context::{CtxValue, FdContext};
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, InodeFds};
use crate::module::ReleaseStatus;
use crate::types::Pid;

/// One open instance of an inode for one requesting process.
pub struct FdObject {
    inode: Arc<Inode>,
    pid: Pid,
    // Both fields below are written only under the inode lock.
    refcount: AtomicUsize,
    bound: AtomicBool,
    ctx: Mutex<FdContext>,
}

impl FdObject {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn refcount(&self) -> usize {
        let _fds = self.inode.lock_fds();
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn is_bound(&self) -> bool {
        let _fds = self.inode.lock_fds();
        self.bound.load(Ordering::Relaxed)
    }

    fn lock_ctx(&self) -> MutexGuard<'_, FdContext> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store module-private state under `key`, normally the module name.
    ///
    /// New keys are only accepted before the fd is bound.
    pub fn ctx_set<T: Any + Send + Sync>(&self, key: &str, value: T) -> FsResult<()> {
        self.lock_ctx().insert(key, Arc::new(value))?;
        Ok(())
    }

    pub fn ctx_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.lock_ctx().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn ctx_del(&self, key: &str) -> FsResult<Option<CtxValue>> {
        self.lock_ctx().remove(key)
    }

    pub fn ctx_keys(&self) -> Vec<String> {
        self.lock_ctx().keys()
    }

    pub fn ctx_sealed(&self) -> bool {
        self.lock_ctx().is_sealed()
    }

    fn take_ref(&self, _held: &InodeFds) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; returns true when this was the last one.
    fn put_ref(self: &Arc<Self>, fds: &mut InodeFds) -> bool {
        let current = self.refcount.load(Ordering::Relaxed);
        assert!(current > 0, "fd {:p} released more often than referenced", Arc::as_ptr(self));
        self.refcount.store(current - 1, Ordering::Relaxed);
        if current > 1 {
            return false;
        }
        if self.bound.swap(false, Ordering::Relaxed) {
            fds.open.retain(|obj| !Arc::ptr_eq(obj, self));
        }
        true
    }

    /// Deliver release notifications and drop module state.
    fn destroy(&self) {
        let keys = self.lock_ctx().keys();
        let graph = self.inode.graph();
        let is_dir = self.inode.kind().is_dir();

        for key in &keys {
            let Some(module) = graph.search_by_name(key) else {
                error!(
                    consistency_fault = true,
                    fd = ?(self as *const Self),
                    key = %key,
                    "fd context has invalid key"
                );
                continue;
            };
            let status = if is_dir { module.release_dir(self) } else { module.release(self) };
            if status == ReleaseStatus::NoHook {
                error!(
                    consistency_fault = true,
                    fd = ?(self as *const Self),
                    module = %key,
                    dir = is_dir,
                    "module holds fd context but has no release hook"
                );
            }
        }

        self.lock_ctx().clear();
        trace!(ino = self.inode.ino(), pid = %self.pid, "fd destroyed");
    }
}

impl std::fmt::Debug for FdObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdObject")
            .field("ino", &self.inode.ino())
            .field("pid", &self.pid)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("bound", &self.bound.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counted reference to an [`FdObject`].
pub struct Fd {
    obj: Arc<FdObject>,
}

impl Fd {
    /// Create an unbound fd on `inode` holding one reference.
    pub fn create(inode: &Arc<Inode>, pid: Pid) -> Fd {
        let obj = Arc::new(FdObject {
            inode: Arc::clone(inode),
            pid,
            refcount: AtomicUsize::new(0),
            bound: AtomicBool::new(false),
            ctx: Mutex::new(FdContext::new()),
        });
        let fds = inode.lock_fds();
        Fd::new_ref(&obj, &fds)
    }

    pub(crate) fn new_ref(obj: &Arc<FdObject>, held: &InodeFds) -> Fd {
        obj.take_ref(held);
        Fd { obj: Arc::clone(obj) }
    }

    /// Seal the context and publish the fd on its inode's open list.
    ///
    /// A second bind fails with [`FsError::AlreadyBound`] and changes nothing.
    pub fn bind(&self) -> FsResult<()> {
        let mut fds = self.obj.inode.lock_fds();
        if self.obj.bound.load(Ordering::Relaxed) {
            return Err(FsError::AlreadyBound);
        }
        // Sealed before the fd becomes discoverable; the context lock nests
        // inside the inode lock.
        self.obj.lock_ctx().seal();
        self.obj.bound.store(true, Ordering::Relaxed);
        fds.open.push(Arc::clone(&self.obj));
        Ok(())
    }

    pub fn ptr_eq(a: &Fd, b: &Fd) -> bool {
        Arc::ptr_eq(&a.obj, &b.obj)
    }
}

impl Deref for Fd {
    type Target = FdObject;

    fn deref(&self) -> &FdObject {
        &self.obj
    }
}

impl Clone for Fd {
    fn clone(&self) -> Self {
        let fds = self.obj.inode.lock_fds();
        Fd::new_ref(&self.obj, &fds)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let last = {
            let mut fds = self.obj.inode.lock_fds();
            self.obj.put_ref(&mut fds)
        };
        if last {
            self.obj.destroy();
        }
    }
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.obj.fmt(f)
    }
}
