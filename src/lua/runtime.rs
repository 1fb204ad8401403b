//! Sandboxed Lua interpreters and the factory that builds them.
//!
//! Every [`LuaVm`] is created the same way:
//!
//! 1. A Lua 5.4 state with only the base, table, string, and math libraries.
//! 2. The sandbox: file loaders, `load`, `collectgarbage`, and `string.dump`
//!    are removed and `print` is routed to the `log` crate.
//! 3. A `require` that only resolves modules from `package.preload`.
//! 4. The host modules, each installed under `kratos_<name>` and `<name>`,
//!    plus a global binding.
//! 5. An instruction hook that aborts execution once the current
//!    invocation is cancelled, and `pcall`/`xpcall` wrappers that let that
//!    abort through instead of catching it.
//! 6. A snapshot of every table reachable from the globals, which
//!    [`LuaVm::reset`] restores before the interpreter is pooled again.
//! 7. The per-interpreter memory limit.
//!
//! Interpreters never run on runtime worker threads. The engine hands each
//! [`Job`] to a blocking thread via [`run_with_timeout`] and races it
//! against the configured timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use mlua::{
    Function, HookTriggers, Lua, LuaOptions, RegistryKey, StdLib, Table, Value as LuaValue,
    Variadic, VmState,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::error::EngineError;

use super::context_table;
use super::host::HostApi;
use super::marshal;
use super::primitives;
use super::staging::Staging;

/// Global a script defines to take part in hook dispatch.
pub(crate) const EXECUTE_FN: &str = "execute";

/// Global holding the id of the context being served, read by `logger`.
pub(crate) const CTX_ID_GLOBAL: &str = "__ctx_id";

/// Error message raised inside Lua when an invocation is cancelled.
pub(crate) const INTERRUPTED: &str = "execution interrupted";

const PRELOAD_KEY: &str = "luahook.preload";
const LOADED_KEY: &str = "luahook.loaded";
const MODULES_KEY: &str = "luahook.modules";
const BASELINE_KEY: &str = "luahook.baseline";

/// Instructions between cancellation checks.
const INTERRUPT_EVERY: u32 = 1000;

const REMOVED_GLOBALS: &[&str] = &[
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "require",
    "collectgarbage",
    "module",
];

/// Cancellation state polled by the instruction hook and by blocking host calls.
#[derive(Debug, Default)]
pub(crate) struct VmSignals {
    closed: AtomicBool,
    active: Mutex<Option<CancellationToken>>,
}

impl VmSignals {
    fn begin(&self, token: CancellationToken) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    fn finish(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Token of the invocation currently running, if any.
    pub(crate) fn token(&self) -> Option<CancellationToken> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_interrupted(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(token) = self.token() {
            token.cancel();
        }
    }
}

/// Work handed to an interpreter.
pub(crate) enum Job {
    /// Evaluate a chunk's top level (script loading).
    Chunk { name: String, source: String },
    /// Evaluate a hook script and call its `execute(ctx)`.
    Script {
        name: String,
        source: String,
        ctx: Arc<ExecutionContext>,
    },
    /// Call a closure registered through `hook.register`.
    Callback {
        function: Arc<RegistryKey>,
        ctx: Arc<ExecutionContext>,
    },
    /// Call a task handler with a payload and return its result.
    Task {
        function: Arc<RegistryKey>,
        payload: Value,
    },
    /// Deliver a bus event to a subscriber as `fn(payload, topic)`.
    Event {
        function: Arc<RegistryKey>,
        topic: String,
        payload: Value,
    },
}

/// Lets module functions find the interpreter they run in.
struct VmSelf(Weak<LuaVm>);

/// One sandboxed interpreter.
///
/// Pooled interpreters are borrowed for a single script and returned. Once
/// a script registers a closure with the host (hook callback, task handler,
/// or bus subscription) the interpreter is marked dedicated and is owned by
/// the callback table until the engine closes.
pub struct LuaVm {
    id: u64,
    lua: Lua,
    signals: Arc<VmSignals>,
    dedicated: AtomicBool,
    exec_lock: Mutex<()>,
    /// Registrations of the file being loaded, if one is.
    staging: Mutex<Option<Staging>>,
}

impl std::fmt::Debug for LuaVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaVm")
            .field("id", &self.id)
            .field("dedicated", &self.is_dedicated())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl LuaVm {
    /// Interpreter id, unique within one engine.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a script has bound a closure in this interpreter.
    #[must_use]
    pub fn is_dedicated(&self) -> bool {
        self.dedicated.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dedicated(&self) {
        if !self.dedicated.swap(true, Ordering::AcqRel) {
            log::debug!("Interpreter #{} is now dedicated", self.id);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.signals.closed.load(Ordering::Acquire)
    }

    /// Abort any running invocation and refuse further work.
    ///
    /// The Lua state itself is freed when the last handle drops.
    pub fn close(&self) {
        if !self.is_closed() {
            log::debug!("Closing interpreter #{}", self.id);
        }
        self.signals.close();
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    pub(crate) fn staging(&self) -> MutexGuard<'_, Option<Staging>> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registrations recorded by the last successful file load.
    pub(crate) fn take_staging(&self) -> Option<Staging> {
        self.staging().take()
    }

    /// Run `job` to completion on the calling thread.
    ///
    /// A [`Job::Chunk`] records its registrations instead of applying them;
    /// on success they wait in [`take_staging`](Self::take_staging) and on
    /// failure they are dropped.
    ///
    /// Errors are rendered to strings here because `mlua` errors carry the
    /// stack traceback, which is only kept when `debug` is set.
    pub(crate) fn run(
        &self,
        job: Job,
        token: CancellationToken,
        debug: bool,
    ) -> std::result::Result<Option<Value>, String> {
        if self.is_closed() {
            return Err(format!("interpreter #{} is closed", self.id));
        }
        let _exec = self.exec_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            return Err(INTERRUPTED.to_string());
        }

        self.signals.begin(token);
        let _active = scopeguard::guard((), |()| {
            self.signals.finish();
            if let Err(e) = self.lua.globals().raw_set(CTX_ID_GLOBAL, LuaValue::Nil) {
                log::debug!("Failed to clear context id on interpreter #{}: {}", self.id, e);
            }
        });

        let loading = matches!(job, Job::Chunk { .. });
        *self.staging() = loading.then(Staging::default);
        let result = self.dispatch(job);
        if loading && result.is_err() {
            if let Some(dropped) = self.take_staging() {
                log::debug!(
                    "Discarded {} registration(s) on interpreter #{}",
                    dropped.len(),
                    self.id
                );
            }
        }
        result.map_err(|e| describe_error(&e, debug))
    }

    fn dispatch(&self, job: Job) -> mlua::Result<Option<Value>> {
        let globals = self.lua.globals();
        match job {
            Job::Chunk { name, source } => {
                globals.raw_set(EXECUTE_FN, LuaValue::Nil)?;
                self.lua.load(source).set_name(format!("={name}")).exec()?;
                Ok(None)
            }
            Job::Script { name, source, ctx } => {
                globals.raw_set(EXECUTE_FN, LuaValue::Nil)?;
                globals.raw_set(CTX_ID_GLOBAL, ctx.id().to_string())?;
                self.lua.load(source).set_name(format!("={name}")).exec()?;

                match globals.raw_get::<LuaValue>(EXECUTE_FN)? {
                    LuaValue::Function(execute) => {
                        let table = context_table::build(&self.lua, &ctx)?;
                        check_verdict(execute.call::<LuaValue>(table)?, "script")?;
                    }
                    _ => log::debug!("Script '{}' defines no execute function", name),
                }
                Ok(None)
            }
            Job::Callback { function, ctx } => {
                globals.raw_set(CTX_ID_GLOBAL, ctx.id().to_string())?;
                let callback: Function = self.lua.registry_value(&function)?;
                let table = context_table::build(&self.lua, &ctx)?;
                check_verdict(callback.call::<LuaValue>(table)?, "callback")?;
                Ok(None)
            }
            Job::Task { function, payload } => {
                let handler: Function = self.lua.registry_value(&function)?;
                let arg = marshal::to_lua(&self.lua, &payload)?;
                let ret: LuaValue = handler.call(arg)?;
                Ok(Some(marshal::from_lua(&ret)))
            }
            Job::Event {
                function,
                topic,
                payload,
            } => {
                let subscriber: Function = self.lua.registry_value(&function)?;
                let arg = marshal::to_lua(&self.lua, &payload)?;
                subscriber.call::<()>((arg, topic))?;
                Ok(None)
            }
        }
    }

    /// Return the interpreter to its freshly created state before pooling.
    ///
    /// Every table recorded at creation (the globals, the libraries, the
    /// host modules, `package`, and the string metatable) gets its original
    /// fields and metatable back; anything a script added is removed.
    pub(crate) fn reset(&self) -> mlua::Result<()> {
        let baseline: Table = self.lua.named_registry_value(BASELINE_KEY)?;
        let contents: Table = baseline.raw_get("contents")?;
        let metatables: Table = baseline.raw_get("metatables")?;

        for pair in contents.pairs::<Table, Table>() {
            let (table, original) = pair?;
            restore_fields(&table, &original)?;
            match metatables.raw_get::<LuaValue>(table.clone())? {
                LuaValue::Table(mt) => table.set_metatable(Some(mt)),
                _ => table.set_metatable(None),
            }
        }

        self.lua.expire_registry_values();
        self.lua.gc_collect()?;
        Ok(())
    }
}

fn restore_fields(table: &Table, original: &Table) -> mlua::Result<()> {
    let mut added = Vec::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, _) = pair?;
        if original.raw_get::<LuaValue>(key.clone())?.is_nil() {
            added.push(key);
        }
    }
    for key in added {
        table.raw_set(key, LuaValue::Nil)?;
    }
    for pair in original.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        table.raw_set(key, value)?;
    }
    Ok(())
}

/// Interpreter hosting the calling Lua code.
pub(crate) fn current_vm(lua: &Lua) -> mlua::Result<Arc<LuaVm>> {
    lua.app_data_ref::<VmSelf>()
        .and_then(|handle| handle.0.upgrade())
        .ok_or_else(|| mlua::Error::runtime("interpreter handle is not available"))
}

/// `false` from a script or callback means failure; anything else is success.
fn check_verdict(value: LuaValue, what: &str) -> mlua::Result<()> {
    match value {
        LuaValue::Boolean(false) => Err(mlua::Error::runtime(format!("{what} returned false"))),
        _ => Ok(()),
    }
}

fn describe_error(err: &mlua::Error, debug: bool) -> String {
    let message = err.to_string();
    if debug {
        return message;
    }
    match message.find("\nstack traceback:") {
        Some(idx) => message[..idx].trim_end().to_string(),
        None => message.trim_end().to_string(),
    }
}

/// Run `job` on a blocking thread and wait at most `timeout` for it.
///
/// On timeout the invocation token is cancelled, which unwinds the script
/// at its next instruction check or blocking host call. The caller decides
/// what happens to the interpreter.
pub(crate) async fn run_with_timeout(
    vm: Arc<LuaVm>,
    job: Job,
    parent: Option<&CancellationToken>,
    timeout: Duration,
    debug: bool,
) -> std::result::Result<Option<Value>, EngineError> {
    let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
    let invocation = token.clone();
    let worker = tokio::task::spawn_blocking(move || vm.run(job, invocation, debug));

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(message))) => Err(EngineError::Execution {
            hook: String::new(),
            by: String::new(),
            message,
        }),
        Ok(Err(join_err)) => Err(EngineError::Execution {
            hook: String::new(),
            by: String::new(),
            message: format!("interpreter thread failed: {join_err}"),
        }),
        Err(_) => {
            token.cancel();
            Err(EngineError::Timeout {
                hook: String::new(),
                by: String::new(),
                timeout,
            })
        }
    }
}

/// Builds interpreters configured for one engine.
pub(crate) struct VmFactory {
    api: Arc<HostApi>,
    max_memory: usize,
    next_id: AtomicU64,
}

impl std::fmt::Debug for VmFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmFactory")
            .field("max_memory", &self.max_memory)
            .field("created", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl VmFactory {
    pub(crate) fn new(api: Arc<HostApi>, max_memory: usize) -> Self {
        Self {
            api,
            max_memory,
            next_id: AtomicU64::new(0),
        }
    }

    /// Create a sandboxed interpreter with every host module installed.
    pub(crate) fn create(&self) -> Result<Arc<LuaVm>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )
        .context("Failed to create Lua state")?;

        apply_sandbox(&lua).context("Failed to apply sandbox")?;
        install_require(&lua).context("Failed to install require")?;

        let signals = Arc::new(VmSignals::default());
        install_interrupt(&lua, Arc::clone(&signals));
        guard_protected_calls(&lua, Arc::clone(&signals)).context("Failed to wrap pcall")?;
        primitives::register_all(&lua, &self.api, &signals)?;
        snapshot_globals(&lua).context("Failed to snapshot globals")?;

        lua.set_memory_limit(self.max_memory)
            .context("Failed to set memory limit")?;

        let vm = Arc::new(LuaVm {
            id,
            lua,
            signals,
            dedicated: AtomicBool::new(false),
            exec_lock: Mutex::new(()),
            staging: Mutex::new(None),
        });
        vm.lua.set_app_data(VmSelf(Arc::downgrade(&vm)));

        log::debug!("Created interpreter #{}", id);
        Ok(vm)
    }
}

fn apply_sandbox(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, LuaValue::Nil)?;
    }
    if let LuaValue::Table(string) = globals.raw_get::<LuaValue>("string")? {
        string.raw_set("dump", LuaValue::Nil)?;
    }

    // print(...) -> info log, tab separated like the stock print
    let print = lua.create_function(|_, args: Variadic<LuaValue>| {
        let line: Vec<String> = args.iter().map(marshal::display).collect();
        log::info!(target: "lua", "{}", line.join("\t"));
        Ok(())
    })?;
    globals.raw_set("print", print)?;
    Ok(())
}

fn install_require(lua: &Lua) -> mlua::Result<()> {
    let preload = lua.create_table()?;
    let loaded = lua.create_table()?;
    lua.set_named_registry_value(PRELOAD_KEY, preload.clone())?;
    lua.set_named_registry_value(LOADED_KEY, loaded.clone())?;
    lua.set_named_registry_value(MODULES_KEY, lua.create_table()?)?;

    let package = lua.create_table()?;
    package.raw_set("preload", preload)?;
    package.raw_set("loaded", loaded)?;

    // require(name): package.loaded, then package.preload; nothing else
    let require = lua.create_function(|lua, name: String| {
        let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
        let cached: LuaValue = loaded.raw_get(name.as_str())?;
        if !cached.is_nil() {
            return Ok(cached);
        }

        let preload: Table = lua.named_registry_value(PRELOAD_KEY)?;
        let LuaValue::Function(loader) = preload.raw_get::<LuaValue>(name.as_str())? else {
            return Err(mlua::Error::runtime(format!("module '{name}' not found")));
        };
        let module: LuaValue = loader.call(name.as_str())?;
        let module = if module.is_nil() {
            LuaValue::Boolean(true)
        } else {
            module
        };
        loaded.raw_set(name.as_str(), module.clone())?;
        Ok(module)
    })?;

    let globals = lua.globals();
    globals.raw_set("package", package)?;
    globals.raw_set("require", require)?;
    Ok(())
}

/// Make `module` resolvable by `require(canonical)` and `require(alias)`.
///
/// Both names load the same table.
pub(crate) fn install_module(lua: &Lua, canonical: &str, alias: &str, module: Table) -> mlua::Result<()> {
    let modules: Table = lua.named_registry_value(MODULES_KEY)?;
    modules.raw_set(canonical, module)?;

    let name = canonical.to_string();
    let loader = lua.create_function(move |lua, _: Variadic<LuaValue>| {
        let modules: Table = lua.named_registry_value(MODULES_KEY)?;
        modules.raw_get::<Table>(name.as_str())
    })?;

    let preload: Table = lua.named_registry_value(PRELOAD_KEY)?;
    preload.raw_set(canonical, loader.clone())?;
    preload.raw_set(alias, loader)?;
    Ok(())
}

fn install_interrupt(lua: &Lua, signals: Arc<VmSignals>) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(INTERRUPT_EVERY),
        move |_lua, _debug| {
            if signals.is_interrupted() {
                Err(mlua::Error::runtime(INTERRUPTED))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

/// Protected calls still catch script errors, but once the invocation is
/// interrupted they re-raise whatever they caught, so a script cannot loop
/// around `pcall` and outlive its timeout.
fn guard_protected_calls(lua: &Lua, signals: Arc<VmSignals>) -> mlua::Result<()> {
    let globals = lua.globals();
    let pcall: Function = globals.raw_get("pcall")?;
    let xpcall: Function = globals.raw_get("xpcall")?;
    let interrupted = lua.create_function(move |_, ()| Ok(signals.is_interrupted()))?;

    let (guarded_pcall, guarded_xpcall): (Function, Function) = lua
        .load(
            r#"
            local raw_pcall, raw_xpcall, interrupted = ...
            local function settle(ok, ...)
                if not ok and interrupted() then
                    error((...), 0)
                end
                return ok, ...
            end
            return function(f, ...) return settle(raw_pcall(f, ...)) end,
                function(f, handler, ...) return settle(raw_xpcall(f, handler, ...)) end
        "#,
        )
        .set_name("=protected_calls")
        .call((pcall, xpcall, interrupted))?;

    globals.raw_set("pcall", guarded_pcall)?;
    globals.raw_set("xpcall", guarded_xpcall)?;
    Ok(())
}

/// Shallow copies (fields and metatable) of every table reachable from the
/// globals and the string metatable.
fn snapshot_globals(lua: &Lua) -> mlua::Result<()> {
    let contents = lua.create_table()?;
    let metatables = lua.create_table()?;

    let mut pending = vec![lua.globals()];
    if let Some(string_mt) = lua
        .load("return getmetatable('')")
        .set_name("=string_metatable")
        .eval::<Option<Table>>()?
    {
        pending.push(string_mt);
    }

    while let Some(table) = pending.pop() {
        if !contents.raw_get::<LuaValue>(table.clone())?.is_nil() {
            continue;
        }
        let copy = lua.create_table()?;
        for pair in table.pairs::<LuaValue, LuaValue>() {
            let (key, value) = pair?;
            if let LuaValue::Table(inner) = &value {
                pending.push(inner.clone());
            }
            copy.raw_set(key, value)?;
        }
        match table.metatable() {
            Some(mt) => {
                pending.push(mt.clone());
                metatables.raw_set(table.clone(), mt)?;
            }
            None => metatables.raw_set(table.clone(), false)?,
        }
        contents.raw_set(table, copy)?;
    }

    let baseline = lua.create_table()?;
    baseline.raw_set("contents", contents)?;
    baseline.raw_set("metatables", metatables)?;
    lua.set_named_registry_value(BASELINE_KEY, baseline)
}
