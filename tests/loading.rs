//! Script directory loading and configuration files.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use luahook::{Engine, EngineConfig, EngineError, ExecutionContext};
use serde_json::json;

fn write(dir: &std::path::Path, rel: &str, body: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
}

fn config_for(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        scripts_dir: dir.to_path_buf(),
        pool_size: 2,
        max_vms: 4,
        vm_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_startup_loads_scripts_dir_and_skips_failures() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "audit.lua",
        r#"
        hook.register("order.created", "after an order is stored")
        hook.add_script("order.created", {
            name = "audit",
            priority = 5,
            source = [[function execute(ctx) ctx.set("audited", true) return true end]],
        })
        "#,
    );
    write(dir.path(), "nested/broken.lua", "function (");
    write(
        dir.path(),
        "nested/welcome.lua",
        r#"hook.register("user.created", function(ctx) ctx.set("welcomed", true) end)"#,
    );
    write(dir.path(), "README.md", "not a script");

    let engine = Engine::new(config_for(dir.path())).await.unwrap();

    assert_eq!(
        engine.list_hooks(),
        vec!["order.created".to_string(), "user.created".to_string()]
    );
    assert_eq!(
        engine.hook_description("order.created").as_deref(),
        Some("after an order is stored")
    );

    let ctx = Arc::new(ExecutionContext::new("order.created"));
    engine.execute_hook("order.created", &ctx).await.unwrap();
    assert_eq!(ctx.get("audited"), Some(json!(true)));

    let ctx = Arc::new(ExecutionContext::new("user.created"));
    engine.execute_hook("user.created", &ctx).await.unwrap();
    assert_eq!(ctx.get("welcomed"), Some(json!(true)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_report_lists_successes_and_failures() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.lua", "x = 1");
    write(dir.path(), "b.lua", "error('refuse to load')");

    let engine = Engine::new(EngineConfig {
        scripts_dir: std::path::PathBuf::new(),
        ..config_for(dir.path())
    })
    .await
    .unwrap();

    let report = engine.load_scripts_from_dir(dir.path()).await;
    assert_eq!(report.loaded, vec![dir.path().join("a.lua")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, dir.path().join("b.lua"));
    assert!(report.failed[0].1.contains("refuse to load"), "{}", report.failed[0].1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_load_leaves_no_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig {
        scripts_dir: std::path::PathBuf::new(),
        ..config_for(dir.path())
    })
    .await
    .unwrap();

    let err = engine
        .load_script_string(
            "half_done.lua",
            r#"
            hook.register("order.created", "partially wired")
            hook.register("order.created", function(ctx) ctx.set("half", true) end)
            hook.add_script("order.created", {
                name = "audit",
                source = [[function execute(ctx) ctx.set("audited", true) end]],
            })
            task.register("archive", function(p) return p end)
            error("broken file")
            "#,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Load { .. }), "{err}");
    assert!(err.to_string().contains("broken file"), "{err}");

    assert!(engine.list_hooks().is_empty());
    assert_eq!(engine.callback_count("order.created"), 0);
    assert!(engine.task_types().is_empty());
    assert_eq!(engine.dedicated_count(), 0);

    let ctx = Arc::new(ExecutionContext::new("order.created"));
    engine.execute_hook("order.created", &ctx).await.unwrap();
    assert!(ctx.to_map().is_empty());

    // the same file loads cleanly once fixed
    engine
        .load_script_string(
            "half_done.lua",
            r#"hook.register("order.created", function(ctx) ctx.set("half", true) end)"#,
        )
        .await
        .unwrap();
    engine.execute_hook("order.created", &ctx).await.unwrap();
    assert_eq!(ctx.get("half"), Some(json!(true)));
    assert_eq!(engine.dedicated_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_missing_file_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig {
        scripts_dir: std::path::PathBuf::new(),
        ..config_for(dir.path())
    })
    .await
    .unwrap();

    let err = engine
        .load_script_file(&dir.path().join("nope.lua"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Load { .. }), "{err}");
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("luahook.json");
    fs::write(
        &path,
        r#"{ "vm_timeout_ms": 250, "pool_size": 3, "max_vms": 6, "scripts_dir": "hooks" }"#,
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.vm_timeout, Duration::from_millis(250));
    assert_eq!(config.pool_size, 3);
    assert_eq!(config.max_vms, 6);
    assert_eq!(config.scripts_dir, std::path::PathBuf::from("hooks"));
    // unspecified fields keep their defaults
    assert_eq!(config.max_memory, EngineConfig::default().max_memory);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_file_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(&path, "{ pool_size: ").unwrap();
    assert!(EngineConfig::load(&path).is_err());
}
