//! luahook CLI - load a scripts directory and dispatch hooks from the shell.
//!
//! Useful for trying scripts out before embedding the engine. Host
//! services are the in-memory implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use luahook::{
    AesGcmEncryptor, Engine, EngineConfig, ExecutionContext, MemoryCache, MemoryEventBus, MemoryObjectStore,
};
use mimalloc::MiMalloc;
use serde_json::Value;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "luahook")]
#[command(about = "Sandboxed Lua hook runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON config file (defaults plus LUAHOOK_* overrides when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load scripts and dispatch one hook
    Run {
        /// Scripts directory to load
        #[arg(long)]
        scripts: PathBuf,
        /// Hook to dispatch
        #[arg(long)]
        hook: String,
        /// JSON object copied into the context before dispatch
        #[arg(long)]
        data: Option<String>,
    },
    /// Load scripts and run one task handler
    Task {
        /// Scripts directory to load
        #[arg(long)]
        scripts: PathBuf,
        /// Task type registered with `task.register`
        #[arg(long = "type")]
        task_type: String,
        /// JSON payload handed to the handler
        #[arg(long)]
        payload: Option<String>,
    },
    /// List hooks, scripts, and bound callbacks after loading a directory
    Hooks {
        /// Scripts directory to load
        #[arg(long)]
        scripts: PathBuf,
    },
    /// Evaluate script files and report load errors
    Check {
        /// Files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print a fresh base64 AES-256 key for LUAHOOK_ENCRYPTION_KEY
    Keygen,
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::from_env()),
    }
}

async fn start_engine(mut config: EngineConfig, scripts: Option<&Path>) -> Result<Engine> {
    config.scripts_dir = scripts.map(Path::to_path_buf).unwrap_or_default();
    let engine = Engine::new(config).await?;
    engine.set_cache(Arc::new(MemoryCache::new()));
    engine.set_event_bus(Arc::new(MemoryEventBus::new()));
    engine.set_oss(Arc::new(MemoryObjectStore::new()));
    Ok(engine)
}

fn parse_json(label: &str, raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("--{label} is not valid JSON")),
        None => Ok(Value::Null),
    }
}

async fn run_hook(config: EngineConfig, scripts: &Path, hook: &str, data: Option<&str>) -> Result<()> {
    let engine = start_engine(config, Some(scripts)).await?;

    let ctx = Arc::new(ExecutionContext::new(hook));
    match parse_json("data", data)? {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                ctx.set(key, value);
            }
        }
        _ => bail!("--data must be a JSON object"),
    }

    let result = engine.execute_hook(hook, &ctx).await;
    println!("{}", serde_json::to_string_pretty(&Value::Object(ctx.to_map()))?);
    log::info!("Hook '{}' finished in {:?}", hook, ctx.duration());
    engine.close();
    result?;
    Ok(())
}

async fn run_task(config: EngineConfig, scripts: &Path, task_type: &str, payload: Option<&str>) -> Result<()> {
    let engine = start_engine(config, Some(scripts)).await?;
    let result = engine.run_task(task_type, parse_json("payload", payload)?).await;
    engine.close();
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn list_hooks(config: EngineConfig, scripts: &Path) -> Result<()> {
    let engine = start_engine(config, Some(scripts)).await?;

    let hooks = engine.list_hooks();
    if hooks.is_empty() {
        println!("No hooks registered.");
    }
    for hook in hooks {
        let description = engine.hook_description(&hook).unwrap_or_default();
        println!("{hook}  {description}");
        println!("  callbacks: {}", engine.callback_count(&hook));
        for record in engine.get_scripts(&hook) {
            println!(
                "  script {} (priority {}{})",
                record.name,
                record.priority,
                if record.enabled { "" } else { ", disabled" }
            );
        }
    }

    let tasks = engine.task_types();
    if !tasks.is_empty() {
        println!("tasks: {}", tasks.join(", "));
    }
    engine.close();
    Ok(())
}

async fn check_files(config: EngineConfig, files: &[PathBuf]) -> Result<()> {
    let engine = start_engine(config, None).await?;
    let mut failed = 0usize;
    for file in files {
        match engine.load_script_file(file).await {
            Ok(()) => println!("ok    {}", file.display()),
            Err(e) => {
                failed += 1;
                println!("FAIL  {}: {}", file.display(), e);
            }
        }
    }
    engine.close();
    if failed > 0 {
        bail!("{failed} of {} file(s) failed to load", files.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { scripts, hook, data } => run_hook(config, &scripts, &hook, data.as_deref()).await,
        Commands::Task {
            scripts,
            task_type,
            payload,
        } => run_task(config, &scripts, &task_type, payload.as_deref()).await,
        Commands::Hooks { scripts } => list_hooks(config, &scripts).await,
        Commands::Check { files } => check_files(config, &files).await,
        Commands::Keygen => {
            println!("{}", AesGcmEncryptor::generate_key());
            Ok(())
        }
    }
}
