//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `serve` (default) -- respond to JSON-lines messages on stdin
//! - `check` -- compile the trigger list and report problems
//! - `match <text>` -- show which trigger a message would fire
//! - `exec <text>` -- run the full pipeline for one message
//! - `scripts` -- list scripts in the scripts directory
//! - `config show|path` -- inspect configuration
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Auto responder for mesh radio networks.
#[derive(Parser, Debug)]
#[command(
    name = "meshresponder",
    version = env!("CARGO_PKG_VERSION"),
    about = "Trigger-driven auto responder for mesh radio networks"
)]
pub struct Cli {
    /// Config file (default: $MESHRESPONDER_CONFIG or the platform config dir).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Trigger list file, overriding the configured triggers.
    #[arg(short, long, global = true)]
    pub triggers: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read JSON-lines messages from stdin and write replies to stdout (default).
    Serve {
        /// Do not reload the trigger file when it changes.
        #[arg(long)]
        no_watch: bool,
    },

    /// Compile the trigger list and report rejected triggers.
    Check,

    /// Show which trigger and pattern a message would match.
    Match {
        /// Message text.
        text: String,
    },

    /// Run the full pipeline for one message and print the replies.
    Exec {
        /// Message text.
        text: String,

        /// Sender node (`!abcd1234`, `0xabcd1234` or decimal).
        #[arg(long, default_value = "!00000001")]
        from: String,

        /// Send replies back to back instead of honouring the spacing.
        #[arg(long)]
        no_spacing: bool,
    },

    /// List scripts and their metadata.
    Scripts,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the loaded configuration as JSON.
    Show,

    /// Print the config file path in use.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

use crate::autoreply::{
    AutoResponder, IncomingMessage, MeshContext, TriggerSet, TriggerStore, TriggerWatcher,
};
use crate::config::{self, ResponderConfig};
use crate::messages::{
    delivery_loop, DeliveryQueue, DeliverySettings, JsonLinesTransport, MeshTransport, NodeNum,
};
use crate::scripts::{meta, ScriptExecutor, ScriptSandbox};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type HandlerResult = Result<(), Box<dyn std::error::Error>>;

/// How often shutdown checks whether the queue has drained
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Resolve the config path from the flag or the default location.
pub fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(config::default_config_path)
}

/// Load configuration, applying the `--triggers` override.
pub fn load_config(cli: &Cli) -> Result<ResponderConfig, config::ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => ResponderConfig::load(path)?,
        None => ResponderConfig::load_default()?,
    };
    if let Some(path) = &cli.triggers {
        cfg.triggers = config::load_triggers(path)?;
        cfg.triggers_file = Some(path.clone());
        cfg.validate()?;
    }
    Ok(cfg)
}

/// Everything a responding subcommand needs
struct Pipeline {
    responder: Arc<AutoResponder>,
    queue: Arc<DeliveryQueue>,
    settings: DeliverySettings,
}

/// One line of `serve` input: a received text message, or a status update
/// from the radio bridge
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Message(IncomingMessage),
    Status(MeshStatus),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeshStatus {
    node_count: usize,
}

fn build_pipeline(cfg: &ResponderConfig) -> Result<Pipeline, Box<dyn std::error::Error>> {
    let sandbox = ScriptSandbox::new(&cfg.scripts.dir, &cfg.scripts.allowed_extensions)?;
    let executor = ScriptExecutor::new(sandbox, cfg.scripts.limits());
    let queue = Arc::new(DeliveryQueue::new(
        cfg.delivery.queue_capacity,
        cfg.delivery.overflow_policy,
    ));
    let triggers = Arc::new(TriggerStore::new(cfg.triggers.clone()));

    let responder = AutoResponder::new(
        triggers,
        Arc::new(executor),
        queue.clone(),
        cfg.replies.policy(),
    )
    .with_mesh_context(MeshContext {
        ip: cfg.mesh.ip.clone(),
        port: cfg.mesh.port,
        local_position: cfg.mesh.position(),
        node_count: cfg.mesh.node_count,
    });

    Ok(Pipeline {
        responder: Arc::new(responder),
        queue,
        settings: cfg.delivery.settings(),
    })
}

fn report_rejected(set: &TriggerSet) {
    for rejected in set.rejected() {
        eprintln!("  trigger '{}' disabled: {}", rejected.id, rejected.error);
    }
}

/// Run the `check` subcommand.
pub fn handle_check(cfg: &ResponderConfig) -> HandlerResult {
    let set = TriggerSet::compile(cfg.triggers.clone());
    println!(
        "{} trigger(s) active, {} rejected",
        set.len(),
        set.rejected().len()
    );
    for trigger in set.triggers() {
        let definition = trigger.definition();
        println!(
            "  {} [{}] {} pattern(s) -> {}",
            definition.id,
            definition.response_type,
            trigger.patterns().len(),
            definition.response
        );
    }
    report_rejected(&set);
    if !set.rejected().is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the `match <text>` subcommand.
pub fn handle_match(cfg: &ResponderConfig, text: &str) -> HandlerResult {
    let set = TriggerSet::compile(cfg.triggers.clone());
    match set.find_match(text) {
        Some(matched) => {
            let params: serde_json::Map<String, serde_json::Value> = matched
                .bindings
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect();
            let out = json!({
                "trigger": matched.trigger_id(),
                "patternIndex": matched.pattern_index,
                "pattern": matched.pattern,
                "params": params,
                "responseType": matched.trigger.response_type.to_string(),
                "response": matched.trigger.response,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        None => {
            eprintln!("No trigger matches");
            std::process::exit(1);
        }
    }
    Ok(())
}

/// Run the `exec <text>` subcommand.
pub async fn handle_exec(
    cfg: &ResponderConfig,
    text: &str,
    from: &str,
    no_spacing: bool,
) -> HandlerResult {
    let from: NodeNum = from.parse()?;
    let mut pipeline = build_pipeline(cfg)?;
    if no_spacing {
        pipeline.settings.spacing = Duration::ZERO;
    }

    let outcome = pipeline
        .responder
        .respond(&IncomingMessage::new(text, from))
        .await;
    eprintln!("{:?}", outcome);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport: Arc<dyn MeshTransport> = Arc::new(JsonLinesTransport::stdout());
    let delivery = tokio::spawn(delivery_loop(
        pipeline.queue.clone(),
        transport,
        pipeline.settings,
        shutdown_rx,
    ));

    wait_for_drain(&pipeline.queue).await;
    let _ = shutdown_tx.send(true);
    delivery.await?;
    Ok(())
}

/// Run the `serve` subcommand.
///
/// Stops on Ctrl-C, or at end of input once every reply is delivered.
pub async fn handle_serve(cfg: &ResponderConfig, watch_triggers: bool) -> HandlerResult {
    let pipeline = build_pipeline(cfg)?;
    report_rejected(&pipeline.responder.triggers().snapshot());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport: Arc<dyn MeshTransport> = Arc::new(JsonLinesTransport::stdout());
    let delivery = tokio::spawn(delivery_loop(
        pipeline.queue.clone(),
        transport,
        pipeline.settings,
        shutdown_rx.clone(),
    ));

    let reloader = match &cfg.triggers_file {
        Some(path) if watch_triggers => match TriggerWatcher::new(path) {
            Ok(watcher) => Some(tokio::spawn(
                watcher.run(pipeline.responder.clone(), shutdown_rx),
            )),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot watch trigger file, reload disabled");
                None
            }
        },
        _ => None,
    };

    info!(
        triggers = pipeline.responder.triggers().snapshot().len(),
        "listening for messages on stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight: Vec<JoinHandle<_>> = Vec::new();
    let interrupted = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break false };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<InputLine>(line) {
                    Ok(InputLine::Message(message)) => {
                        if let Some(task) = pipeline.responder.handle_message(message) {
                            in_flight.push(task);
                        }
                    }
                    Ok(InputLine::Status(status)) => {
                        let mut mesh = pipeline.responder.mesh_context();
                        mesh.node_count = Some(status.node_count);
                        pipeline.responder.set_mesh_context(mesh);
                        debug!(node_count = status.node_count, "mesh status updated");
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed input line"),
                }
                in_flight.retain(|task| !task.is_finished());
            }
            _ = tokio::signal::ctrl_c() => break true,
        }
    };

    if interrupted {
        info!("interrupted, shutting down");
        pipeline.responder.shutdown();
    } else {
        debug!(pending_tasks = in_flight.len(), "end of input, draining");
        for task in in_flight {
            let _ = task.await;
        }
        wait_for_drain(&pipeline.queue).await;
    }

    let _ = shutdown_tx.send(true);
    delivery.await?;
    if let Some(reloader) = reloader {
        let _ = reloader.await;
    }
    let stats = pipeline.queue.stats();
    info!(
        sent = stats.sent,
        retried = stats.retried,
        dropped = stats.dropped,
        evicted = stats.evicted,
        rejected = stats.rejected,
        pending = stats.pending,
        "delivery finished"
    );
    Ok(())
}

/// Run the `scripts` subcommand.
pub fn handle_scripts(cfg: &ResponderConfig) -> HandlerResult {
    let sandbox = ScriptSandbox::new(&cfg.scripts.dir, &cfg.scripts.allowed_extensions)?;
    for entry in meta::scan(&sandbox)? {
        let label = match (&entry.meta.emoji, &entry.meta.name) {
            (Some(emoji), Some(name)) => format!("{} {}", emoji, name),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        };
        let language = entry.meta.language.as_deref().unwrap_or("-");
        println!("{:<32} {:<12} {}", entry.path.display(), language, label);
    }
    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show(cfg: &ResponderConfig) -> HandlerResult {
    println!("{}", serde_json::to_string_pretty(cfg)?);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path(cli: &Cli) {
    match config_path(cli) {
        Some(path) => println!("{}", path.display()),
        None => println!("(none)"),
    }
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("meshresponder {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("MESHRESPONDER_BUILD_DATE"));
    println!("  Git commit: {}", env!("MESHRESPONDER_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn wait_for_drain(queue: &DeliveryQueue) {
    while !queue.stats().is_settled() {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_no_args_defaults_to_none() {
        let cli = Cli::try_parse_from(["meshresponder"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_serve_defaults() {
        let cli = Cli::try_parse_from(["meshresponder", "serve"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Serve { no_watch: false })));
    }

    #[test]
    fn test_cli_serve_no_watch() {
        let cli = Cli::try_parse_from(["meshresponder", "serve", "--no-watch"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Serve { no_watch: true })));
    }

    #[test]
    fn test_input_line_kinds() {
        let line: InputLine = serde_json::from_str(r#"{"text":"ping","from":16}"#).unwrap();
        match line {
            InputLine::Message(msg) => {
                assert_eq!(msg.text, "ping");
                assert_eq!(msg.from, NodeNum(16));
            }
            other => panic!("Expected Message, got {:?}", other),
        }

        let line: InputLine = serde_json::from_str(r#"{"nodeCount":12}"#).unwrap();
        assert!(matches!(line, InputLine::Status(MeshStatus { node_count: 12 })));

        assert!(serde_json::from_str::<InputLine>(r#"{"hello":1}"#).is_err());
    }

    #[test]
    fn test_cli_version_subcommand() {
        let cli = Cli::try_parse_from(["meshresponder", "version"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Version)));
    }

    #[test]
    fn test_cli_match_with_global_flags() {
        let cli = Cli::try_parse_from([
            "meshresponder",
            "match",
            "weather Austin",
            "--triggers",
            "t.json5",
        ])
        .unwrap();
        assert_eq!(cli.triggers, Some(PathBuf::from("t.json5")));
        match cli.command {
            Some(Command::Match { ref text }) => assert_eq!(text, "weather Austin"),
            other => panic!("Expected Match, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_exec_options() {
        let cli = Cli::try_parse_from([
            "meshresponder",
            "exec",
            "lorem",
            "--from",
            "!abcd1234",
            "--no-spacing",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Exec {
                ref text,
                ref from,
                no_spacing,
            }) => {
                assert_eq!(text, "lorem");
                assert_eq!(from, "!abcd1234");
                assert!(no_spacing);
            }
            other => panic!("Expected Exec, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_config_path() {
        let cli = Cli::try_parse_from(["meshresponder", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Config(ConfigCommand::Path))));
    }

    #[test]
    fn test_load_config_with_triggers_override() {
        let dir = tempfile::tempdir().unwrap();
        let triggers = dir.path().join("t.json5");
        std::fs::write(&triggers, r#"[{ id: "ping", pattern: "ping", response: "pong" }]"#).unwrap();

        let cli = Cli::try_parse_from([
            "meshresponder",
            "--config",
            dir.path().join("missing.json5").to_str().unwrap(),
            "--triggers",
            triggers.to_str().unwrap(),
            "check",
        ])
        .unwrap();
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.triggers.len(), 1);
        assert_eq!(cfg.triggers_file, Some(triggers));
    }
}
