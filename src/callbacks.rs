//! Closures scripts have bound to the host, and the interpreters that own them.
//!
//! A Lua closure is only valid inside the interpreter that created it, so
//! every entry keeps its interpreter alive. Those interpreters are
//! "dedicated": they never go back to the pool, and they are closed only
//! when the engine closes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use mlua::RegistryKey;
use tokio::task::JoinHandle;

use crate::lua::LuaVm;

/// A Lua function pinned in its interpreter's registry.
#[derive(Clone)]
pub(crate) struct CallbackEntry {
    pub(crate) id: u64,
    /// Hook name, task type, or bus topic the closure was bound to.
    pub(crate) target: String,
    pub(crate) vm: Arc<LuaVm>,
    pub(crate) function: Arc<RegistryKey>,
}

impl std::fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("vm", &self.vm.id())
            .finish_non_exhaustive()
    }
}

/// Hook callbacks, task handlers, bus subscriptions, and the dedicated set.
#[derive(Default)]
pub(crate) struct CallbackTable {
    hooks: HashMap<String, Vec<CallbackEntry>>,
    tasks: BTreeMap<String, CallbackEntry>,
    subscriptions: Vec<JoinHandle<()>>,
    dedicated: BTreeMap<u64, Arc<LuaVm>>,
    next_id: u64,
}

pub(crate) type SharedCallbacks = Arc<RwLock<CallbackTable>>;

pub(crate) fn new_shared_callbacks() -> SharedCallbacks {
    Arc::new(RwLock::new(CallbackTable::default()))
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("hooks", &self.hooks.len())
            .field("tasks", &self.tasks.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("dedicated", &self.dedicated.len())
            .finish()
    }
}

impl CallbackTable {
    fn entry(&mut self, target: &str, vm: &Arc<LuaVm>, function: RegistryKey) -> CallbackEntry {
        self.dedicate(vm);
        self.next_id += 1;
        CallbackEntry {
            id: self.next_id,
            target: target.to_string(),
            vm: Arc::clone(vm),
            function: Arc::new(function),
        }
    }

    /// Mark `vm` dedicated and keep it alive until [`clear`](Self::clear).
    pub(crate) fn dedicate(&mut self, vm: &Arc<LuaVm>) {
        vm.mark_dedicated();
        self.dedicated
            .entry(vm.id())
            .or_insert_with(|| Arc::clone(vm));
    }

    /// Append a hook callback. Callbacks run in registration order.
    pub(crate) fn add_hook_callback(&mut self, hook: &str, vm: &Arc<LuaVm>, function: RegistryKey) -> u64 {
        let entry = self.entry(hook, vm, function);
        let id = entry.id;
        self.hooks.entry(hook.to_string()).or_default().push(entry);
        log::debug!("Bound callback #{} to hook '{}' on interpreter #{}", id, hook, vm.id());
        id
    }

    /// Install the handler for `task_type`, replacing any previous one.
    ///
    /// Returns `true` when a handler was replaced.
    pub(crate) fn set_task_handler(&mut self, task_type: &str, vm: &Arc<LuaVm>, function: RegistryKey) -> bool {
        let entry = self.entry(task_type, vm, function);
        let replaced = self.tasks.insert(task_type.to_string(), entry).is_some();
        if replaced {
            log::info!("Replaced handler for task type '{}'", task_type);
        }
        replaced
    }

    /// Build a subscription entry for `topic` (dedicating `vm`).
    pub(crate) fn subscription(&mut self, topic: &str, vm: &Arc<LuaVm>, function: RegistryKey) -> CallbackEntry {
        self.entry(topic, vm, function)
    }

    /// Track a delivery task so it is aborted on [`clear`](Self::clear).
    pub(crate) fn track_subscription(&mut self, handle: JoinHandle<()>) {
        self.subscriptions.retain(|h| !h.is_finished());
        self.subscriptions.push(handle);
    }

    /// Callbacks bound to `hook`, in registration order.
    pub(crate) fn snapshot(&self, hook: &str) -> Vec<CallbackEntry> {
        self.hooks.get(hook).cloned().unwrap_or_default()
    }

    pub(crate) fn task_handler(&self, task_type: &str) -> Option<CallbackEntry> {
        self.tasks.get(task_type).cloned()
    }

    pub(crate) fn task_types(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub(crate) fn callback_count(&self, hook: &str) -> usize {
        self.hooks.get(hook).map_or(0, Vec::len)
    }

    pub(crate) fn dedicated_ids(&self) -> Vec<u64> {
        self.dedicated.keys().copied().collect()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.iter().filter(|h| !h.is_finished()).count()
    }

    /// Drop every binding, abort delivery tasks, and hand back the
    /// dedicated interpreters for closing.
    pub(crate) fn clear(&mut self) -> Vec<Arc<LuaVm>> {
        for handle in self.subscriptions.drain(..) {
            handle.abort();
        }
        self.hooks.clear();
        self.tasks.clear();
        std::mem::take(&mut self.dedicated).into_values().collect()
    }
}
