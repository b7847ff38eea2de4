use dotenvy::dotenv;
use matrix_agent_bridge::bridge::stdio::{spawn_stdin_reader, StdoutReplySink};
use matrix_agent_bridge::config::{Settings, EVENT_CHANNEL_CAPACITY};
use matrix_agent_bridge::ipc::{AgentClient, AgentResponse};
use matrix_agent_bridge::logging::{init_logging, RedactionPatterns};
use matrix_agent_bridge::Bridge;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    init_logging(patterns);

    info!("Starting Matrix agent bridge...");

    let settings = init_settings();

    let (agent, responses) = init_agent(&settings).await;

    let bridge = Arc::new(Bridge::new(
        &settings,
        agent,
        Arc::new(StdoutReplySink::stdout()),
    ));
    info!(
        window_ms = settings.aggregation_window_ms,
        "Bridge initialized."
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let reader = spawn_stdin_reader(events_tx);

    let shutdown = CancellationToken::new();
    let relay = {
        let bridge = Arc::clone(&bridge);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            bridge.relay_responses(responses).await;
            // Nothing left to answer with once the agent is gone
            shutdown.cancel();
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("Ctrl-C received, shutting down...");
            shutdown.cancel();
        });
    }

    info!("Bridge is running...");
    bridge.run(events_rx, shutdown).await;

    reader.abort();
    relay.abort();
    info!("Bridge stopped.");
    Ok(())
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_agent(settings: &Settings) -> (Arc<AgentClient>, mpsc::Receiver<AgentResponse>) {
    match AgentClient::connect(&settings.agent_socket_path, settings.max_frame_bytes).await {
        Ok((client, responses)) => {
            info!("Agent client initialized.");
            (Arc::new(client), responses)
        }
        Err(e) => {
            error!(
                "Failed to connect to agent at {}: {}",
                settings.agent_socket_path, e
            );
            std::process::exit(1);
        }
    }
}
