//! Registrations made while a file's top level is evaluated.
//!
//! Nothing a file binds becomes visible until the whole file has run: the
//! host modules record hooks, scripts, closures, and subscriptions here
//! while the file loads, and the engine commits them in one step once
//! evaluation succeeds. A file that fails part way leaves no trace.
//!
//! Outside of loading (inside a script or a callback) the same calls take
//! effect immediately.

use std::sync::Arc;

use mlua::RegistryKey;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::EngineError;
use crate::registry::{HookRegistry, SharedRegistry};
use crate::script::Script;

use super::host::HostApi;
use super::primitives::eventbus;
use super::runtime::LuaVm;

/// One deferred registration.
pub(crate) enum Staged {
    Hook {
        name: String,
        description: String,
    },
    Script {
        hook: String,
        script: Script,
    },
    Callback {
        hook: String,
        function: RegistryKey,
    },
    Task {
        task_type: String,
        function: RegistryKey,
    },
    Subscription {
        topic: String,
        function: RegistryKey,
        events: UnboundedReceiver<Value>,
    },
}

/// Pending registrations of the file being loaded.
#[derive(Default)]
pub(crate) struct Staging {
    /// Live registry plus this file's changes, created on first use.
    view: Option<HookRegistry>,
    ops: Vec<Staged>,
}

impl std::fmt::Debug for Staging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Staging")
            .field("ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}

impl Staging {
    fn view(&mut self, live: &SharedRegistry) -> &mut HookRegistry {
        self.view.get_or_insert_with(|| {
            live.read().expect("hook registry lock poisoned").clone()
        })
    }

    fn task_types(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            Staged::Task { task_type, .. } => Some(task_type.as_str()),
            _ => None,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Apply `op` now, or record it when `vm` is loading a file.
///
/// Hook and script registrations are validated at the call either way, so
/// a bad call fails inside the script that made it.
pub(crate) fn submit(api: &Arc<HostApi>, vm: &Arc<LuaVm>, op: Staged) -> mlua::Result<()> {
    let mut pending = vm.staging();
    let Some(staging) = pending.as_mut() else {
        drop(pending);
        return apply(api, vm, op).map_err(mlua::Error::external);
    };

    match &op {
        Staged::Hook { name, description } => staging
            .view(&api.registry)
            .register_hook(name, description)
            .map_err(mlua::Error::external)?,
        Staged::Script { hook, script } => {
            staging
                .view(&api.registry)
                .add_script(hook, script.clone())
                .map_err(mlua::Error::external)?;
        }
        _ => {}
    }
    staging.ops.push(op);
    Ok(())
}

/// Hook names as the calling code sees them, staged hooks included.
pub(crate) fn hook_names(api: &HostApi, vm: &LuaVm) -> Vec<String> {
    if let Some(staging) = vm.staging().as_ref() {
        if let Some(view) = &staging.view {
            return view.list_hooks();
        }
    }
    api.registry
        .read()
        .expect("hook registry lock poisoned")
        .list_hooks()
}

/// Task types as the calling code sees them, staged handlers included.
pub(crate) fn task_types(api: &HostApi, vm: &LuaVm) -> Vec<String> {
    let mut types = api
        .callbacks
        .read()
        .expect("callback table lock poisoned")
        .task_types();
    if let Some(staging) = vm.staging().as_ref() {
        types.extend(staging.task_types().map(str::to_string));
        types.sort();
        types.dedup();
    }
    types
}

/// Publish everything `staging` recorded on `vm`.
///
/// Registry changes are replayed on a copy of the live registry and swapped
/// in together, so a conflict with a concurrent registration rejects the
/// whole file. Closures are bound afterwards and dedicate `vm`.
///
/// # Errors
///
/// Returns the first registry validation error; nothing is applied then.
pub(crate) fn commit(api: &Arc<HostApi>, vm: &Arc<LuaVm>, staging: Staging) -> Result<(), EngineError> {
    let (registrations, bindings): (Vec<Staged>, Vec<Staged>) = staging
        .ops
        .into_iter()
        .partition(|op| matches!(op, Staged::Hook { .. } | Staged::Script { .. }));

    if !registrations.is_empty() {
        let mut live = api.registry.write().expect("hook registry lock poisoned");
        let mut next = live.clone();
        for op in registrations {
            match op {
                Staged::Hook { name, description } => next.register_hook(&name, &description)?,
                Staged::Script { hook, script } => {
                    next.add_script(&hook, script)?;
                }
                _ => {}
            }
        }
        *live = next;
    }

    for op in bindings {
        apply(api, vm, op)?;
    }
    Ok(())
}

fn apply(api: &Arc<HostApi>, vm: &Arc<LuaVm>, op: Staged) -> Result<(), EngineError> {
    match op {
        Staged::Hook { name, description } => api
            .registry
            .write()
            .expect("hook registry lock poisoned")
            .register_hook(&name, &description),
        Staged::Script { hook, script } => api
            .registry
            .write()
            .expect("hook registry lock poisoned")
            .add_script(&hook, script)
            .map(|_| ()),
        Staged::Callback { hook, function } => {
            api.callbacks
                .write()
                .expect("callback table lock poisoned")
                .add_hook_callback(&hook, vm, function);
            Ok(())
        }
        Staged::Task { task_type, function } => {
            api.callbacks
                .write()
                .expect("callback table lock poisoned")
                .set_task_handler(&task_type, vm, function);
            log::debug!("Registered task handler '{}' on interpreter #{}", task_type, vm.id());
            Ok(())
        }
        Staged::Subscription {
            topic,
            function,
            events,
        } => {
            let mut callbacks = api.callbacks.write().expect("callback table lock poisoned");
            let entry = callbacks.subscription(&topic, vm, function);
            let handle = api
                .runtime
                .spawn(eventbus::deliver(Arc::clone(api), entry, events));
            callbacks.track_subscription(handle);
            log::debug!("Interpreter #{} subscribed to '{}'", vm.id(), topic);
            Ok(())
        }
    }
}

/// Load `source` on `vm` and commit what it registered, the way the engine
/// loads a file.
#[cfg(test)]
pub(crate) fn load_for_tests(api: &Arc<HostApi>, vm: &Arc<LuaVm>, source: &str) -> Result<(), String> {
    use super::runtime::Job;

    vm.run(
        Job::Chunk {
            name: "test".into(),
            source: source.into(),
        },
        tokio_util::sync::CancellationToken::new(),
        false,
    )?;
    let staging = vm.take_staging().unwrap_or_default();
    commit(api, vm, staging).map_err(|e| e.to_string())
}
