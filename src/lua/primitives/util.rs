//! Time utilities.
//!
//! # Usage in Lua
//!
//! ```lua
//! local started = util.now()
//! util.sleep(250)
//! log.info("waited", "ms", util.now() - started)
//! log.info(util.format_time(started, "%Y-%m-%d %H:%M:%S"))
//! ```
//!
//! `util.sleep` blocks only the calling script. It is cut short (with an
//! error) when the invocation times out or the caller cancels the context.
//! `format_time` takes chrono/strftime layouts and formats in UTC; without
//! a layout it produces RFC 3339.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use mlua::{Lua, Table};

use crate::lua::host::HostApi;
use crate::lua::runtime::VmSignals;

/// Build the `util` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>, signals: &Arc<VmSignals>) -> Result<Table> {
    let util = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create util table: {e}"))?;

    // util.sleep(ms)
    let (host, sig) = (Arc::clone(api), Arc::clone(signals));
    let sleep_fn = lua
        .create_function(move |_, ms: f64| host.block_on(&sig, tokio::time::sleep(sleep_duration(ms))))
        .map_err(|e| anyhow!("Failed to create util.sleep function: {e}"))?;
    util.set("sleep", sleep_fn)
        .map_err(|e| anyhow!("Failed to set util.sleep: {e}"))?;

    // util.now() -> epoch milliseconds
    let now_fn = lua
        .create_function(|_, ()| Ok(Utc::now().timestamp_millis()))
        .map_err(|e| anyhow!("Failed to create util.now function: {e}"))?;
    util.set("now", now_fn)
        .map_err(|e| anyhow!("Failed to set util.now: {e}"))?;

    // util.format_time(epoch_ms [, layout]) -> string
    let format_fn = lua
        .create_function(|_, (epoch_ms, layout): (i64, Option<String>)| {
            format_time(epoch_ms, layout.as_deref()).map_err(mlua::Error::runtime)
        })
        .map_err(|e| anyhow!("Failed to create util.format_time function: {e}"))?;
    util.set("format_time", format_fn)
        .map_err(|e| anyhow!("Failed to set util.format_time: {e}"))?;

    Ok(util)
}

/// Negative and NaN durations sleep for zero; anything too large for a
/// `Duration` (including `math.huge`) sleeps until interrupted.
fn sleep_duration(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
}

fn format_time(epoch_ms: i64, layout: Option<&str>) -> std::result::Result<String, String> {
    let time = DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .ok_or_else(|| format!("util.format_time: timestamp {epoch_ms} is out of range"))?;

    let Some(layout) = layout.filter(|l| !l.is_empty()) else {
        return Ok(time.to_rfc3339_opts(SecondsFormat::Millis, true));
    };

    let items: Vec<Item<'_>> = StrftimeItems::new(layout).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("util.format_time: invalid layout '{layout}'"));
    }

    let mut out = String::new();
    write!(out, "{}", time.format_with_items(items.into_iter()))
        .map_err(|_| format!("util.format_time: cannot format with '{layout}'"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::runtime::{Job, VmFactory};
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_format_time_layouts() {
        // 2024-01-02T03:04:05.678Z
        let ms = 1_704_164_645_678;
        assert_eq!(format_time(ms, None).unwrap(), "2024-01-02T03:04:05.678Z");
        assert_eq!(
            format_time(ms, Some("%Y-%m-%d %H:%M:%S")).unwrap(),
            "2024-01-02 03:04:05"
        );
        assert!(format_time(ms, Some("%Q")).is_err());
    }

    #[test]
    fn test_sleep_duration_clamps() {
        assert_eq!(sleep_duration(-5.0), Duration::ZERO);
        assert_eq!(sleep_duration(f64::NAN), Duration::ZERO);
        assert_eq!(sleep_duration(250.0), Duration::from_millis(250));
        assert_eq!(sleep_duration(1e300), Duration::MAX);
        assert_eq!(sleep_duration(f64::INFINITY), Duration::MAX);
    }

    #[test]
    fn test_now_and_sleep_from_script() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let api = HostApi::for_tests(rt.handle().clone());
        let vm = VmFactory::new(api, 16 * 1024 * 1024).create().unwrap();

        let started = Instant::now();
        vm.run(
            Job::Chunk {
                name: "util_test".into(),
                source: r#"
                    local before = util.now()
                    util.sleep(30)
                    assert(util.now() >= before)
                    assert(type(util.format_time(before)) == "string")
                "#
                .into(),
            },
            CancellationToken::new(),
            false,
        )
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_sleep_is_preempted_by_cancellation() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let api = HostApi::for_tests(rt.handle().clone());
        let vm = VmFactory::new(api, 16 * 1024 * 1024).create().unwrap();

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                token.cancel();
            })
        };

        let started = Instant::now();
        let err = vm
            .run(
                Job::Chunk {
                    name: "sleepy".into(),
                    source: "util.sleep(5000)".into(),
                },
                token,
                false,
            )
            .unwrap_err();
        canceller.join().unwrap();

        assert!(err.contains("interrupted"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_huge_sleep_waits_for_cancellation() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let api = HostApi::for_tests(rt.handle().clone());
        let vm = VmFactory::new(api, 16 * 1024 * 1024).create().unwrap();

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                token.cancel();
            })
        };

        let err = vm
            .run(
                Job::Chunk {
                    name: "forever".into(),
                    source: "util.sleep(1e300)".into(),
                },
                token,
                false,
            )
            .unwrap_err();
        canceller.join().unwrap();
        assert!(err.contains("interrupted"), "{err}");
    }
}
