//! Engine facade: registration, script loading, and hook dispatch.
//!
//! # Dispatch
//!
//! `execute_hook(hook, ctx)` runs, in order:
//!
//! 1. every closure bound to `hook` through `hook.register(name, fn)`, on
//!    the dedicated interpreter that owns it;
//! 2. every enabled script record of `hook` by ascending priority, each on
//!    an interpreter borrowed from the pool.
//!
//! The first failure ends the dispatch and is returned tagged with the
//! hook and the failing callback or script. A `ctx.stop(reason)` ends it
//! the same way after the entry that called it.
//!
//! # Timeouts
//!
//! Each script, callback, or task handler gets `vm_timeout`. A pooled
//! interpreter that times out is closed and replaced so the pool stays at
//! `pool_size`. A dedicated interpreter only has its invocation cancelled;
//! its other closures stay usable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::callbacks::{new_shared_callbacks, CallbackEntry};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::crypto::AesGcmEncryptor;
use crate::error::{EngineError, EngineResult};
use crate::lua::host::HostApi;
use crate::lua::pool::VmPool;
use crate::lua::runtime::{run_with_timeout, Job, LuaVm, VmFactory};
use crate::lua::staging;
use crate::registry::new_shared_registry;
use crate::script::{Script, ScriptRecord};
use crate::services::{CacheStore, Encryptor, EventBus, HostServices, ObjectStore};

/// Outcome of [`Engine::load_scripts_from_dir`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Files evaluated successfully.
    pub loaded: Vec<PathBuf>,
    /// Files that failed, with the error.
    pub failed: Vec<(PathBuf, String)>,
}

/// Embeddable Lua hook engine.
///
/// Create one per process with [`Engine::new`] inside a tokio runtime.
/// All methods take `&self`; the engine can be shared behind an `Arc`.
pub struct Engine {
    config: EngineConfig,
    api: Arc<HostApi>,
    pool: VmPool,
    limiter: Semaphore,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pool_capacity", &self.pool.capacity())
            .field("pool_idle", &self.pool.idle_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validate `config`, build the interpreter pool, and auto-load
    /// `config.scripts_dir`.
    ///
    /// A missing scripts directory is logged and ignored; individual
    /// script failures are logged and skipped.
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Config(format!("engine must be created inside a tokio runtime: {e}")))?;

        let services = Arc::new(HostServices::new());
        if let Some(key) = config.encryption_key.as_deref() {
            let encryptor = AesGcmEncryptor::from_base64_key(key)
                .map_err(|e| EngineError::Config(format!("{e:#}")))?;
            services.set_encryptor(Arc::new(encryptor));
        }

        let api = Arc::new(HostApi {
            registry: new_shared_registry(),
            callbacks: new_shared_callbacks(),
            services,
            runtime,
            vm_timeout: config.vm_timeout,
            enable_debug: config.enable_debug,
        });

        let factory = VmFactory::new(Arc::clone(&api), config.max_memory);
        let pool = VmPool::new(config.pool_size, factory).map_err(|e| {
            EngineError::ResourceExhausted(format!("failed to create interpreter pool: {e:#}"))
        })?;

        let engine = Self {
            limiter: Semaphore::new(config.max_vms),
            config,
            api,
            pool,
            closed: AtomicBool::new(false),
        };
        log::info!(
            "Hook engine started (pool_size={}, max_vms={}, vm_timeout={:?})",
            engine.config.pool_size,
            engine.config.max_vms,
            engine.config.vm_timeout
        );

        if !engine.config.scripts_dir.as_os_str().is_empty() {
            let dir = engine.config.scripts_dir.clone();
            let report = engine.load_scripts_from_dir(&dir).await;
            if !report.loaded.is_empty() || !report.failed.is_empty() {
                log::info!(
                    "Loaded {} script(s) from {} ({} failed)",
                    report.loaded.len(),
                    dir.display(),
                    report.failed.len()
                );
            }
        }
        Ok(engine)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Registration ===

    /// Register a hook. Idempotent.
    pub fn register_hook(&self, name: &str, description: &str) -> EngineResult<()> {
        self.api
            .registry
            .write()
            .expect("hook registry lock poisoned")
            .register_hook(name, description)
    }

    /// Attach a script to a registered hook.
    pub fn add_script(&self, hook: &str, script: Script) -> EngineResult<ScriptRecord> {
        self.api
            .registry
            .write()
            .expect("hook registry lock poisoned")
            .add_script(hook, script)
    }

    /// Detach the script named `name` from `hook`.
    pub fn remove_script(&self, hook: &str, name: &str) -> EngineResult<ScriptRecord> {
        self.api
            .registry
            .write()
            .expect("hook registry lock poisoned")
            .remove_script(hook, name)
    }

    /// Registered hook names, sorted.
    #[must_use]
    pub fn list_hooks(&self) -> Vec<String> {
        self.api
            .registry
            .read()
            .expect("hook registry lock poisoned")
            .list_hooks()
    }

    /// Scripts of `hook` in dispatch order (disabled ones included).
    #[must_use]
    pub fn get_scripts(&self, hook: &str) -> Vec<ScriptRecord> {
        self.api
            .registry
            .read()
            .expect("hook registry lock poisoned")
            .get_scripts(hook)
    }

    /// Description of `hook`, if registered.
    #[must_use]
    pub fn hook_description(&self, hook: &str) -> Option<String> {
        self.api
            .registry
            .read()
            .expect("hook registry lock poisoned")
            .description(hook)
            .map(str::to_string)
    }

    // === Host services ===

    /// Install the cache used by the `cache` module.
    pub fn set_cache(&self, cache: Arc<dyn CacheStore>) {
        self.api.services.set_cache(cache);
    }

    /// Install the bus used by the `eventbus` module.
    pub fn set_event_bus(&self, bus: Arc<dyn EventBus>) {
        self.api.services.set_event_bus(bus);
    }

    /// Install the object store used by the `oss` module.
    pub fn set_oss(&self, store: Arc<dyn ObjectStore>) {
        self.api.services.set_object_store(store);
    }

    /// Install the encryptor used by `crypto.encrypt`/`crypto.decrypt`.
    pub fn set_encryptor(&self, encryptor: Arc<dyn Encryptor>) {
        self.api.services.set_encryptor(encryptor);
    }

    // === Loading ===

    /// Read and evaluate a script file at top level.
    ///
    /// Top-level code is where scripts call `hook.register`,
    /// `hook.add_script`, `eventbus.subscribe`, and `task.register`.
    pub async fn load_script_file(&self, path: &Path) -> EngineResult<()> {
        let name = path.display().to_string();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::Load {
                name: name.clone(),
                message: e.to_string(),
            })?;
        self.load_chunk(name, source).await
    }

    /// Evaluate inline source at top level.
    pub async fn load_script_string(&self, name: &str, source: &str) -> EngineResult<()> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("script name must not be empty".to_string()));
        }
        self.load_chunk(name.to_string(), source.to_string()).await
    }

    /// Load every `.lua` file under `dir`, recursively, in path order.
    ///
    /// Never fails: unreadable directories and failing files are logged and
    /// reported.
    pub async fn load_scripts_from_dir(&self, dir: &Path) -> LoadReport {
        let mut report = LoadReport::default();
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            log::warn!("Scripts directory {} does not exist, skipping", dir.display());
            return report;
        }

        for path in collect_lua_files(dir).await {
            match self.load_script_file(&path).await {
                Ok(()) => {
                    log::debug!("Loaded script {}", path.display());
                    report.loaded.push(path);
                }
                Err(e) => {
                    log::error!("Failed to load {}: {}", path.display(), e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        report
    }

    /// Evaluate a file's top level and publish what it registered.
    ///
    /// Registrations are committed before the interpreter goes back to the
    /// pool, and only when the whole file evaluated; a failing file leaves
    /// no hooks, scripts, or bindings behind.
    async fn load_chunk(&self, name: String, source: String) -> EngineResult<()> {
        let job = Job::Chunk {
            name: name.clone(),
            source,
        };
        let api = Arc::clone(&self.api);
        self.with_pooled(job, None, |vm, result| {
            result?;
            let staging = vm.take_staging().unwrap_or_default();
            staging::commit(&api, vm, staging)
        })
        .await
        .map_err(|e| match e {
            EngineError::Execution { message, .. } => EngineError::Load { name, message },
            EngineError::Timeout { timeout, .. } => EngineError::Load {
                name,
                message: format!("top-level evaluation timed out after {timeout:?}"),
            },
            EngineError::Validation(message) => EngineError::Load { name, message },
            other => other,
        })
    }

    // === Dispatch ===

    /// Run one script record against `ctx` on a pooled interpreter.
    pub async fn execute(&self, record: &ScriptRecord, ctx: &Arc<ExecutionContext>) -> EngineResult<()> {
        let by = format!("script '{}'", record.name);
        let job = Job::Script {
            name: record.name.clone(),
            source: record.source.clone(),
            ctx: Arc::clone(ctx),
        };
        self.run_pooled(job, ctx.cancellation_token())
            .await
            .map_err(|e| e.tagged(&record.hook, &by))?;
        check_stopped(&record.hook, &by, ctx)
    }

    /// Dispatch `hook`: bound callbacks first, then enabled scripts by priority.
    pub async fn execute_hook(&self, hook: &str, ctx: &Arc<ExecutionContext>) -> EngineResult<()> {
        self.ensure_open()?;
        check_stopped(hook, "context", ctx)?;

        let callbacks = self
            .api
            .callbacks
            .read()
            .expect("callback table lock poisoned")
            .snapshot(hook);
        for (index, callback) in callbacks.iter().enumerate() {
            let by = format!("callback #{index}");
            self.execute_callback(callback, ctx)
                .await
                .map_err(|e| e.tagged(hook, &by))?;
            check_stopped(hook, &by, ctx)?;
        }

        let scripts = self
            .api
            .registry
            .read()
            .expect("hook registry lock poisoned")
            .enabled_scripts(hook);
        if callbacks.is_empty() && scripts.is_empty() {
            log::debug!("Hook '{}' has no callbacks or scripts", hook);
            return Ok(());
        }

        for record in &scripts {
            self.execute(record, ctx).await?;
        }

        log::debug!(
            "Dispatched hook '{}' ({} callbacks, {} scripts) in {:?}",
            hook,
            callbacks.len(),
            scripts.len(),
            ctx.duration()
        );
        Ok(())
    }

    async fn execute_callback(&self, callback: &CallbackEntry, ctx: &Arc<ExecutionContext>) -> EngineResult<()> {
        let job = Job::Callback {
            function: Arc::clone(&callback.function),
            ctx: Arc::clone(ctx),
        };
        run_with_timeout(
            Arc::clone(&callback.vm),
            job,
            ctx.cancellation_token(),
            self.config.vm_timeout,
            self.config.enable_debug,
        )
        .await
        .map(|_| ())
    }

    /// Run the handler a script installed with `task.register(type, fn)`.
    ///
    /// Returns the handler's return value (`Null` for none).
    pub async fn run_task(&self, task_type: &str, payload: Value) -> EngineResult<Value> {
        self.ensure_open()?;
        let handler = self
            .api
            .callbacks
            .read()
            .expect("callback table lock poisoned")
            .task_handler(task_type)
            .ok_or_else(|| {
                EngineError::Validation(format!("no handler registered for task type '{task_type}'"))
            })?;

        let job = Job::Task {
            function: Arc::clone(&handler.function),
            payload,
        };
        let result = run_with_timeout(
            Arc::clone(&handler.vm),
            job,
            None,
            self.config.vm_timeout,
            self.config.enable_debug,
        )
        .await
        .map_err(|e| e.tagged(task_type, "task handler"))?;
        Ok(result.unwrap_or(Value::Null))
    }

    /// Borrow a pooled interpreter for `job` and give it back afterwards.
    async fn run_pooled(&self, job: Job, parent: Option<&CancellationToken>) -> EngineResult<Option<Value>> {
        self.with_pooled(job, parent, |_, result| result).await
    }

    /// Run `job` on a pooled interpreter and let `finish` inspect the
    /// interpreter and the outcome before it is released.
    async fn with_pooled<T>(
        &self,
        job: Job,
        parent: Option<&CancellationToken>,
        finish: impl FnOnce(&Arc<LuaVm>, EngineResult<Option<Value>>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.ensure_open()?;
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| EngineError::ResourceExhausted(format!("engine is closed ({e})")))?;
        let vm = self
            .pool
            .get()
            .map_err(|e| EngineError::ResourceExhausted(format!("{e:#}")))?;

        let result = run_with_timeout(
            Arc::clone(&vm),
            job,
            parent,
            self.config.vm_timeout,
            self.config.enable_debug,
        )
        .await;
        let timed_out = result.as_ref().is_err_and(EngineError::is_timeout);
        let outcome = finish(&vm, result);
        self.release(vm, timed_out);
        outcome
    }

    fn release(&self, vm: Arc<LuaVm>, timed_out: bool) {
        if vm.is_dedicated() {
            // owned by the callback table from here on
            return;
        }
        if timed_out {
            if let Err(e) = self.pool.replace(&vm) {
                log::warn!("Failed to replace timed-out interpreter #{}: {:#}", vm.id(), e);
            }
        } else {
            self.pool.put(vm);
        }
    }

    // === Introspection ===

    /// Number of closures bound to `hook`.
    #[must_use]
    pub fn callback_count(&self, hook: &str) -> usize {
        self.api
            .callbacks
            .read()
            .expect("callback table lock poisoned")
            .callback_count(hook)
    }

    /// Number of dedicated interpreters.
    #[must_use]
    pub fn dedicated_count(&self) -> usize {
        self.dedicated_ids().len()
    }

    /// Ids of the dedicated interpreters.
    #[must_use]
    pub fn dedicated_ids(&self) -> Vec<u64> {
        self.api
            .callbacks
            .read()
            .expect("callback table lock poisoned")
            .dedicated_ids()
    }

    /// Task types with a registered handler, sorted.
    #[must_use]
    pub fn task_types(&self) -> Vec<String> {
        self.api
            .callbacks
            .read()
            .expect("callback table lock poisoned")
            .task_types()
    }

    /// Live event bus subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.api
            .callbacks
            .read()
            .expect("callback table lock poisoned")
            .subscription_count()
    }

    /// Idle interpreters in the pool.
    #[must_use]
    pub fn pool_idle(&self) -> usize {
        self.pool.idle_count()
    }

    // === Lifecycle ===

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::ResourceExhausted("engine is closed".to_string()));
        }
        Ok(())
    }

    /// Close every interpreter and drop all bindings. Idempotent.
    ///
    /// In-flight invocations are interrupted; later calls fail with
    /// `ResourceExhausted`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.limiter.close();
        self.pool.close();

        let dedicated = self
            .api
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for vm in &dedicated {
            vm.close();
        }
        log::info!("Hook engine closed ({} dedicated interpreters released)", dedicated.len());
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_stopped(hook: &str, by: &str, ctx: &ExecutionContext) -> EngineResult<()> {
    match ctx.stop_reason() {
        Some(reason) => Err(EngineError::Stopped {
            hook: hook.to_string(),
            by: by.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// `.lua` files under `root`, sorted. Unreadable subdirectories are skipped.
async fn collect_lua_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot read directory {}: {}", dir.display(), e);
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Error listing {}: {}", dir.display(), e);
                    break;
                }
            };
            let path = entry.path();
            match entry.file_type().await {
                Ok(t) if t.is_dir() => pending.push(path),
                Ok(t) if t.is_file() && path.extension().is_some_and(|ext| ext == "lua") => {
                    files.push(path);
                }
                _ => {}
            }
        }
    }

    files.sort();
    files
}
