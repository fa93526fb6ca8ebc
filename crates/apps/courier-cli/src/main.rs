mod backlog;

use anyhow::{bail, Context};
use backlog::{load_backlog, replay_registry, BacklogGateway};
use clap::{Parser, Subcommand};
use courier_core::{Cursor, CursorStore, DeviceMetadata, MemoryCursorStore, SqliteCursorStore};
use courier_pipeline::{NotificationPipeline, PipelineConfig, PipelineDeps};
use log::LevelFilter;
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(about = "Operator CLI for the notification delivery pipeline")]
struct Cli {
    /// Pipeline config (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Feeds a JSON backlog through the pipeline and reports the result.
    Replay {
        #[arg(long)]
        backlog: PathBuf,
        #[arg(long, default_value_t = 50)]
        page_size: usize,
        /// Message type whose handler fails every attempt. Repeatable.
        #[arg(long = "fail-type")]
        fail_types: Vec<String>,
        /// Pull attempts before giving up on a stalled cursor.
        #[arg(long, default_value_t = 8)]
        rounds: u32,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
    /// Prints a config template with every default filled in.
    ExampleConfig,
}

#[derive(Debug, Subcommand)]
enum CursorAction {
    Show,
    Reset,
}

enum Output {
    Json(JsonValue),
    Text(String),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(output) => {
            emit_output(&cli, output);
            ExitCode::SUCCESS
        }
        Err(err) => {
            emit_error(&cli, &err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<Output> {
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config, cli.quiet);
    match &cli.command {
        Command::Replay { backlog, page_size, fail_types, rounds, timeout_ms } => {
            let options = ReplayOptions {
                backlog,
                page_size: *page_size,
                fail_types,
                rounds: (*rounds).max(1),
                timeout: Duration::from_millis(*timeout_ms),
            };
            replay(config, &options).map(Output::Json)
        }
        Command::Cursor { action } => {
            let store = open_durable_store(&config)?;
            match action {
                CursorAction::Show => {
                    let cursor = store.load().context("failed to load cursor")?;
                    Ok(Output::Json(json!({ "cursor": cursor })))
                }
                CursorAction::Reset => {
                    store.clear().context("failed to clear cursor")?;
                    Ok(Output::Json(json!({ "cursor": Cursor::default(), "reset": true })))
                }
            }
        }
        Command::ExampleConfig => Ok(Output::Text(PipelineConfig::example_toml())),
    }
}

struct ReplayOptions<'a> {
    backlog: &'a Path,
    page_size: usize,
    fail_types: &'a [String],
    rounds: u32,
    timeout: Duration,
}

fn replay(config: PipelineConfig, options: &ReplayOptions<'_>) -> anyhow::Result<JsonValue> {
    let messages = load_backlog(options.backlog)?;
    let gateway = Arc::new(BacklogGateway::new(messages, options.page_size));
    let store: Arc<dyn CursorStore> = match config.cursor_db_path.as_deref() {
        Some(_) => Arc::new(open_durable_store(&config)?),
        None => Arc::new(MemoryCursorStore::new()),
    };
    let (registry, counts) = replay_registry(options.fail_types);
    let device = DeviceMetadata::new("courier-cli", std::env::consts::OS, "ACTIVE");
    let deps = PipelineDeps::new(Arc::clone(&gateway), store, registry, device);
    let pipeline = NotificationPipeline::start(config, deps)?;

    let target = gateway.maximum_id();
    let mut previous: Option<Cursor> = None;
    let mut rounds = 0;
    while rounds < options.rounds {
        rounds += 1;
        pipeline.pull_now()?;
        if !pipeline.wait_until_idle(options.timeout) {
            pipeline.shutdown();
            bail!("pipeline did not settle within {}ms", options.timeout.as_millis());
        }
        let cursor = pipeline.status().cursor;
        let caught_up = cursor.is_some_and(|c| c.last_processed_id >= target);
        if caught_up || (previous.is_some() && cursor == previous) {
            break;
        }
        previous = cursor;
    }

    let status = pipeline.status();
    pipeline.shutdown();
    let handled = counts.lock().map(|counts| json!(&*counts)).unwrap_or(JsonValue::Null);
    Ok(json!({
        "backlog": { "messages": gateway.message_count(), "maximum_id": target },
        "rounds": rounds,
        "caught_up": status.cursor.is_some_and(|c| c.last_processed_id >= target),
        "fetches": gateway.fetches(),
        "confirmations": gateway.confirmations(),
        "handled": handled,
        "status": status,
    }))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load_from_path(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn open_durable_store(config: &PipelineConfig) -> anyhow::Result<SqliteCursorStore> {
    let Some(path) = config.cursor_db_path.as_deref() else {
        bail!("cursor_db_path is not set in the config");
    };
    SqliteCursorStore::open(path).with_context(|| format!("failed to open cursor store {path}"))
}

fn init_logging(config: &PipelineConfig, quiet: bool) {
    let level = if quiet { LevelFilter::Error } else { parse_level(&config.logging.level) };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.parse_default_env();
    let _ = builder.try_init();
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn emit_output(cli: &Cli, output: Output) {
    let result = match output {
        Output::Text(text) if !cli.json => {
            print!("{text}");
            return;
        }
        Output::Text(text) => JsonValue::String(text),
        Output::Json(value) => value,
    };
    let envelope = json!({ "ok": true, "result": result });
    let rendered = if cli.json {
        serde_json::to_string_pretty(&envelope)
    } else {
        serde_json::to_string(&envelope)
    };
    match rendered {
        Ok(text) => println!("{text}"),
        Err(err) => println!("{{\"ok\":false,\"error\":\"failed to serialize output: {err}\"}}"),
    }
}

fn emit_error(cli: &Cli, err: &anyhow::Error) {
    if cli.json {
        let envelope = json!({ "ok": false, "error": { "message": format!("{err:#}") } });
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => eprintln!("{text}"),
            Err(_) => eprintln!("error: {err:#}"),
        }
    } else {
        eprintln!("error: {err:#}");
    }
}
