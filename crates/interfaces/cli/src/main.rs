mod serve;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use conductor_config::{AppConfig, MASTER_MODEL_ID};
use conductor_llm::Provider;
use conductor_runtime::{Event, GatewayClient, GatewayMessage, registries};

#[derive(Debug, Parser)]
#[command(
    name = "conductor",
    version,
    about = "Event dispatcher that routes work through a master model or deterministic handlers"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the dispatcher behind the Unix socket gateway until interrupted.
    Serve {
        #[arg(long)]
        socket: Option<String>,
    },
    /// Send one event to a running gateway and print every reply line.
    Send {
        /// Event type, e.g. `chat:ask` or `function:execute`.
        #[arg(value_name = "TYPE")]
        event_type: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Ask for a response in addition to the acknowledgment.
        #[arg(long)]
        reply_to: Option<String>,
        /// JSON metadata, e.g. '{"requiresMaster": true}'.
        #[arg(long)]
        metadata: Option<String>,
        /// Reuse an event id (redelivery).
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the capability schemas offered to the model.
    Capabilities,
    /// Print the registered model configurations.
    Models,
    /// Validate the configuration and report what is missing.
    CheckConfig,
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{what} is not valid JSON"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)?;
    init_logging(&config);

    match cli.command {
        Commands::Serve { socket } => {
            if let Some(socket) = socket {
                config.gateway.socket_path = socket;
            }
            serve::run_gateway(config).await?;
        }
        Commands::Send {
            event_type,
            payload,
            reply_to,
            metadata,
            id,
        } => {
            let mut event = Event::new(event_type, parse_json(&payload, "payload")?);
            if let Some(target) = reply_to {
                event = event.with_reply_target(target);
            }
            if let Some(metadata) = metadata {
                event = event.with_metadata(parse_json(&metadata, "metadata")?);
            }
            if let Some(id) = id {
                event = event.with_id(id);
            }

            let client = GatewayClient::new(&config.gateway.socket_path);
            client
                .connect_with_backoff(3)
                .await
                .with_context(|| format!("no gateway at {}", config.gateway.socket_path))?;
            for message in client.send_event(&event).await? {
                println!("{}", serde_json::to_string(&message)?);
                if let GatewayMessage::Ack { ack } = &message {
                    if ack.status == conductor_runtime::AckStatus::Error {
                        bail!("event {} failed", ack.event_id);
                    }
                }
            }
        }
        Commands::Capabilities => {
            let (capabilities, _) = registries(&config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&capabilities.model_schemas())?
            );
        }
        Commands::Models => {
            let (_, models) = registries(&config)?;
            for id in models.list() {
                if let Some(model) = models.get(&id) {
                    println!("{id}: {}", serde_json::to_string(&model)?);
                }
            }
        }
        Commands::CheckConfig => check_config(&config)?,
    }

    Ok(())
}

fn check_config(config: &AppConfig) -> Result<()> {
    let (capabilities, models) = registries(config)?;
    let credentials = config.credential_store();
    let mut problems = Vec::new();

    for id in models.list() {
        let Some(model) = models.get(&id) else {
            continue;
        };
        if let Err(err) = model.provider.parse::<Provider>() {
            problems.push(format!("model {id}: {err}"));
        }
        if !model.credential_name.is_empty() && !credentials.has(&model.credential_name) {
            problems.push(format!(
                "model {id}: credential {} has no keys",
                model.credential_name
            ));
        }
    }
    for spec in capabilities.list_specs() {
        if let Some(credential) = &spec.required_credential {
            if !credentials.has(credential) {
                println!("note: capability {} needs credential {credential}", spec.name);
            }
        }
    }

    println!(
        "{} capabilities, {} models, master {}",
        capabilities.len(),
        models.list().len(),
        if config.master.enabled && models.has_master() {
            MASTER_MODEL_ID
        } else {
            "disabled"
        }
    );
    if problems.is_empty() {
        println!("configuration ok");
        return Ok(());
    }
    for problem in &problems {
        println!("problem: {problem}");
    }
    bail!("{} configuration problem(s)", problems.len())
}
