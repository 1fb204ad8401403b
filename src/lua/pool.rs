//! Bounded pool of reusable interpreters.
//!
//! `get` hands out an idle interpreter or builds a new one; `put` resets
//! it and keeps it if there is room. Dedicated interpreters are never
//! pooled: they belong to the callback table.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use super::runtime::{LuaVm, VmFactory};

#[derive(Debug)]
pub(crate) struct VmPool {
    capacity: usize,
    idle: Mutex<VecDeque<Arc<LuaVm>>>,
    closed: AtomicBool,
    factory: VmFactory,
}

impl VmPool {
    /// Create a pool and pre-fill it with `capacity` interpreters.
    pub(crate) fn new(capacity: usize, factory: VmFactory) -> Result<Self> {
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push_back(factory.create()?);
        }
        log::debug!("Interpreter pool ready with {} interpreters", capacity);
        Ok(Self {
            capacity,
            idle: Mutex::new(idle),
            closed: AtomicBool::new(false),
            factory,
        })
    }

    /// Take an idle interpreter, or create one when the pool is empty.
    pub(crate) fn get(&self) -> Result<Arc<LuaVm>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("interpreter pool is closed");
        }
        let pooled = self.idle.lock().expect("pool mutex poisoned").pop_front();
        match pooled {
            Some(vm) => Ok(vm),
            None => {
                log::debug!("Interpreter pool empty, creating a new interpreter");
                self.factory.create()
            }
        }
    }

    /// Return an interpreter after use.
    ///
    /// Dedicated interpreters are left alone. Interpreters that fail to
    /// reset, or that do not fit, are closed.
    pub(crate) fn put(&self, vm: Arc<LuaVm>) {
        if vm.is_dedicated() {
            log::debug!("Interpreter #{} is dedicated, not returning it to the pool", vm.id());
            return;
        }
        if vm.is_closed() || self.closed.load(Ordering::Acquire) {
            vm.close();
            return;
        }
        if let Err(e) = vm.reset() {
            log::warn!("Discarding interpreter #{} after failed reset: {}", vm.id(), e);
            vm.close();
            return;
        }

        let mut idle = self.idle.lock().expect("pool mutex poisoned");
        if idle.len() < self.capacity {
            idle.push_back(vm);
        } else {
            drop(idle);
            vm.close();
        }
    }

    /// Close `old` and pool a freshly built replacement.
    pub(crate) fn replace(&self, old: &LuaVm) -> Result<()> {
        old.close();
        let fresh = self.factory.create()?;
        log::debug!("Replaced interpreter #{} with #{}", old.id(), fresh.id());
        self.put(fresh);
        Ok(())
    }

    /// Close every idle interpreter and refuse further `get`s.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.idle.lock().expect("pool mutex poisoned").drain(..).collect();
        for vm in &drained {
            vm.close();
        }
        log::debug!("Interpreter pool closed ({} idle interpreters)", drained.len());
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().expect("pool mutex poisoned").len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::host::HostApi;

    fn pool(rt: &tokio::runtime::Runtime, capacity: usize) -> VmPool {
        let factory = VmFactory::new(HostApi::for_tests(rt.handle().clone()), 16 * 1024 * 1024);
        VmPool::new(capacity, factory).unwrap()
    }

    #[test]
    fn test_prefilled_to_capacity() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&rt, 3);
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn test_get_put_cycle() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&rt, 2);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        assert_eq!(pool.idle_count(), 0);

        pool.put(a);
        pool.put(b);
        pool.put(Arc::clone(&c));
        assert_eq!(pool.idle_count(), 2);
        assert!(c.is_closed(), "overflow interpreter is closed");
    }

    #[test]
    fn test_dedicated_never_pooled() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&rt, 1);

        let vm = pool.get().unwrap();
        vm.mark_dedicated();
        pool.put(Arc::clone(&vm));
        assert_eq!(pool.idle_count(), 0);
        assert!(!vm.is_closed());
    }

    #[test]
    fn test_replace_keeps_size() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&rt, 2);

        let vm = pool.get().unwrap();
        pool.replace(&vm).unwrap();
        assert!(vm.is_closed());
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_close_refuses_get() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&rt, 2);
        let held = pool.get().unwrap();

        pool.close();
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.get().is_err());

        pool.put(Arc::clone(&held));
        assert!(held.is_closed());
        assert_eq!(pool.idle_count(), 0);
    }
}
