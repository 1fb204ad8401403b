//! Shared state every interpreter's host modules close over.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::callbacks::SharedCallbacks;
use crate::registry::SharedRegistry;
use crate::services::HostServices;

use super::runtime::{VmSignals, INTERRUPTED};

/// Engine state reachable from Lua.
///
/// Created once per engine and captured (as `Arc<HostApi>`) by the module
/// functions of every interpreter the factory builds.
pub(crate) struct HostApi {
    pub(crate) registry: SharedRegistry,
    pub(crate) callbacks: SharedCallbacks,
    pub(crate) services: Arc<HostServices>,
    /// Runtime that host I/O futures are driven on.
    pub(crate) runtime: Handle,
    pub(crate) vm_timeout: Duration,
    pub(crate) enable_debug: bool,
}

impl std::fmt::Debug for HostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostApi")
            .field("vm_timeout", &self.vm_timeout)
            .field("enable_debug", &self.enable_debug)
            .finish_non_exhaustive()
    }
}

impl HostApi {
    /// Drive `fut` to completion from an interpreter thread.
    ///
    /// Interpreters run on blocking threads, never on runtime workers, so
    /// blocking here is allowed. The future is abandoned as soon as the
    /// current invocation is cancelled (timeout, caller cancellation, or
    /// interpreter close), which surfaces in Lua as an error.
    pub(crate) fn block_on<F: Future>(&self, signals: &VmSignals, fut: F) -> mlua::Result<F::Output> {
        let Some(token) = signals.token() else {
            return Ok(self.runtime.block_on(fut));
        };
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(mlua::Error::runtime(INTERRUPTED)),
                out = fut => Ok(out),
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            registry: crate::registry::new_shared_registry(),
            callbacks: crate::callbacks::new_shared_callbacks(),
            services: Arc::new(HostServices::new()),
            runtime,
            vm_timeout: Duration::from_secs(2),
            enable_debug: false,
        })
    }
}
