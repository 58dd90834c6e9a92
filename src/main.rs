//! Runner MQTT - command line front-end
//!
//! Connection settings come from the `MQTT_*` environment variables; the
//! global flags override them for one invocation.

use clap::{Parser, Subcommand};
use runner_mqtt::config::MqttConf;
use runner_mqtt::observability::init_default_logging;
use runner_mqtt::transport::mqtt::{build_options, ConnectionParameters};
use runner_mqtt::{Client, InboundMessage};
use serde::Serialize;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Minimal MQTT client driven by MQTT_* environment variables
#[derive(Parser)]
#[command(name = "runner-mqtt")]
#[command(about = "Minimal MQTT client driven by MQTT_* environment variables")]
#[command(version)]
struct Cli {
    /// A client Id for the connection (overrides MQTT_CLIENT_ID)
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// A username to authenticate to the MQTT server (overrides MQTT_USER)
    #[arg(long, global = true)]
    username: Option<String>,

    /// Password to match username (overrides MQTT_PWD)
    #[arg(long, global = true)]
    password: Option<String>,

    /// The full url of the MQTT server, e.g. tcp://127.0.0.1:1883 (overrides MQTT_URI)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to MQTT_TOPIC and print messages until SIGINT/SIGTERM
    Listen {
        /// Seconds to wait for the broker to accept the connection
        #[arg(long, env = "MQTT_CONNECT_TIMEOUT", default_value_t = 10)]
        timeout: u64,

        /// Print one JSON object per message
        #[arg(long)]
        json: bool,
    },
    /// Publish one message and disconnect
    Publish {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        message: String,

        /// Seconds to wait for the broker to accept the connection
        #[arg(long, env = "MQTT_CONNECT_TIMEOUT", default_value_t = 10)]
        timeout: u64,
    },
    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(long)]
        show: bool,
    },
}

/// Resolved settings as printed by `config --show`
#[derive(Serialize)]
struct ResolvedConfig {
    broker_uri: String,
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'static str>,
    insecure_skip_verify: bool,
    clean_session: bool,
    keep_alive_secs: u64,
    qos: i32,
    topic: String,
    shutdown_grace_period_ms: u64,
    debug: bool,
}

/// Printed by `listen --json`
#[derive(Serialize)]
struct PrintedMessage<'a> {
    topic: &'a str,
    qos: u8,
    retain: bool,
    payload: String,
    received_at: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let conf = MqttConf::from_env();
    if cli.server.is_none() && !conf.is_available() {
        error!("MQTT_URI is not set, messaging is disabled");
        process::exit(1);
    }

    let result = match &cli.command {
        Commands::Listen { timeout, json } => listen(&cli, conf, *timeout, *json).await,
        Commands::Publish {
            topic,
            message,
            timeout,
        } => publish(&cli, conf, topic, message, *timeout).await,
        Commands::Config { show } => handle_config_command(&cli, conf, *show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

/// Connection parameters from the environment with command-line overrides applied
fn resolve_parameters(
    cli: &Cli,
    conf: &MqttConf,
) -> Result<ConnectionParameters, Box<dyn std::error::Error>> {
    conf.validate()?;
    let mut params = build_options(conf)?;

    if let Some(client_id) = cli.client_id.as_deref().filter(|id| !id.is_empty()) {
        params.client_id = client_id.to_string();
    }
    if let Some(server) = &cli.server {
        params.broker_uri = server.clone();
    }
    if cli.username.is_some() || cli.password.is_some() {
        let username = cli.username.clone().unwrap_or_else(|| conf.user());
        let password = cli.password.clone().unwrap_or_else(|| conf.password());
        params.set_credentials(&username, &password);
    }

    Ok(params)
}

fn build_client(cli: &Cli, conf: MqttConf) -> Result<Client, Box<dyn std::error::Error>> {
    let params = resolve_parameters(cli, &conf)?;
    Ok(Client::with_parameters(conf, params)?)
}

fn print_message(msg: &InboundMessage, json: bool) {
    if json {
        let printed = PrintedMessage {
            topic: &msg.topic,
            qos: msg.qos as u8,
            retain: msg.retain,
            payload: msg.payload_str().into_owned(),
            received_at: chrono::Utc::now(),
        };
        match serde_json::to_string(&printed) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Failed to encode message on {}: {}", msg.topic, e),
        }
    } else {
        println!("[{}] {}", msg.topic, msg.payload_str());
    }
}

async fn listen(
    cli: &Cli,
    conf: MqttConf,
    timeout: u64,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(build_client(cli, conf)?);

    let runner = client.clone();
    let mut running = tokio::spawn(async move { runner.start(timeout).await });

    let mut state = client.watch_state();
    let connected = state
        .wait_for(|s| s.is_connected() || s.is_terminal())
        .await
        .map(|s| s.is_connected())
        .unwrap_or(false);

    if connected {
        client.subscribe(move |msg| print_message(&msg, json)).await?;
        info!("Listening on topic {}", client.conf().topic());
    }

    let lost = tokio::select! {
        result = &mut running => {
            result??;
            false
        }
        _ = monitor_connection_health(&client) => true,
    };

    if lost {
        error!("MQTT connection lost, shutting down...");
        running.abort();
        client.shutdown().await?;
        return Err("MQTT connection lost".into());
    }

    info!("Application shutdown complete");
    Ok(())
}

async fn publish(
    cli: &Cli,
    conf: MqttConf,
    topic: &str,
    message: &str,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(cli, conf)?;
    client.connect(Duration::from_secs(timeout)).await?;

    let published = client.publish(topic, message.to_string()).await;
    client.shutdown().await?;
    published?;

    info!("Published message to {}", topic);
    Ok(())
}

fn handle_config_command(
    cli: &Cli,
    conf: MqttConf,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = resolve_parameters(cli, &conf)?;

    if show {
        let resolved = ResolvedConfig {
            broker_uri: params.broker_uri.clone(),
            client_id: params.client_id.clone(),
            username: params.credentials.as_ref().map(|c| c.username.clone()),
            password: params.credentials.as_ref().map(|_| "***"),
            insecure_skip_verify: params.tls.insecure_skip_verify,
            clean_session: params.clean_session,
            keep_alive_secs: params.keep_alive.as_secs(),
            qos: conf.qos()?,
            topic: conf.topic(),
            shutdown_grace_period_ms: conf.shutdown_grace_period().as_millis() as u64,
            debug: conf.debug_enabled(),
        };
        println!("{}", toml::to_string_pretty(&resolved)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolves once the broker connection is gone after having been established
async fn monitor_connection_health(client: &Client) {
    let mut state = client.watch_state();
    if state.wait_for(|s| s.is_connected()).await.is_err() {
        std::future::pending::<()>().await;
    }
    loop {
        if !client.is_connected() && client.state().is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
