//! Event bus module backed by the host's [`EventBus`](crate::services::EventBus).
//!
//! # Usage in Lua
//!
//! ```lua
//! eventbus.publish("user.created", { id = ctx.get("user_id") })
//!
//! eventbus.subscribe("user.deleted", function(payload, topic)
//!     cache.delete("user:" .. payload.id)
//! end)
//! ```
//!
//! Each subscription gets a delivery task on the engine's runtime that
//! feeds events to the subscriber one at a time, under the same timeout as
//! hook scripts. Subscribing dedicates the calling interpreter; a
//! subscription made while a file loads starts delivering only once the
//! file has loaded.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, Table, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use super::{host_error, require_service};
use crate::callbacks::CallbackEntry;
use crate::lua::host::HostApi;
use crate::lua::marshal;
use crate::lua::runtime::{self, Job, VmSignals};
use crate::lua::staging::{self, Staged};

/// Build the `eventbus` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>, signals: &Arc<VmSignals>) -> Result<Table> {
    let eventbus = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create eventbus table: {e}"))?;

    // eventbus.publish(topic, payload)
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let publish_fn = lua
        .create_function(move |_, (topic, payload): (String, Value)| {
            let bus = require_service(host.services.event_bus(), "eventbus")?;
            let payload = marshal::from_lua(&payload);
            host.block_on(&sig, bus.publish(&topic, payload))?
                .map_err(host_error("eventbus.publish"))
        })
        .map_err(|e| anyhow!("Failed to create eventbus.publish function: {e}"))?;
    eventbus
        .set("publish", publish_fn)
        .map_err(|e| anyhow!("Failed to set eventbus.publish: {e}"))?;

    // eventbus.subscribe(topic, fn(payload, topic)) -> true
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let subscribe_fn = lua
        .create_function(move |lua, (topic, callback): (String, Function)| {
            let bus = require_service(host.services.event_bus(), "eventbus")?;
            let vm = runtime::current_vm(lua)?;
            let events = host
                .block_on(&sig, bus.subscribe(&topic))?
                .map_err(host_error("eventbus.subscribe"))?;

            let function = lua.create_registry_value(callback)?;
            staging::submit(
                &host,
                &vm,
                Staged::Subscription {
                    topic,
                    function,
                    events,
                },
            )?;
            Ok(true)
        })
        .map_err(|e| anyhow!("Failed to create eventbus.subscribe function: {e}"))?;
    eventbus
        .set("subscribe", subscribe_fn)
        .map_err(|e| anyhow!("Failed to set eventbus.subscribe: {e}"))?;

    Ok(eventbus)
}

/// Feed `events` to the subscriber in `entry` until the bus closes or the
/// interpreter does.
pub(crate) async fn deliver(api: Arc<HostApi>, entry: CallbackEntry, mut events: UnboundedReceiver<serde_json::Value>) {
    while let Some(payload) = events.recv().await {
        if entry.vm.is_closed() {
            break;
        }
        let job = Job::Event {
            function: Arc::clone(&entry.function),
            topic: entry.target.clone(),
            payload,
        };
        if let Err(e) = runtime::run_with_timeout(
            Arc::clone(&entry.vm),
            job,
            None,
            api.vm_timeout,
            api.enable_debug,
        )
        .await
        {
            let e = e.tagged(&entry.target, &format!("subscriber #{}", entry.id));
            log::warn!("Event delivery failed: {}", e);
        }
    }
    log::debug!("Subscription #{} to '{}' ended", entry.id, entry.target);
}
