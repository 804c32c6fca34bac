//! meshgate-node: topology discovery for a mesh radio gateway.
//!
//! Reads mesh events and operator commands from stdin, writes probes,
//! forwarded probe traffic and command replies to stdout, one JSON document
//! per line. Logs go to stderr.

use anyhow::{anyhow, Context};
use meshgate_core::{logging, Config, OutboundMessage};
use meshgate_topology::{ChannelDispatcher, TopologyEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod protocol;

use protocol::{ControlCommand, ControlReply, InboundLine, NodeVersionHandshake};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        println!("{}", serde_json::to_string(&NodeVersionHandshake::current())?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    logging::init_with(config.node.log_format, &config.node.log_level);
    info!(
        node_id = %config.node.node_id,
        config = %config_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "meshgate-node starting"
    );

    let (dispatcher, outbound) = ChannelDispatcher::channel(config.node.outbound_buffer);
    let engine = TopologyEngine::new(config.topology.clone(), Arc::new(dispatcher))
        .context("building topology engine")?;
    engine.start().context("starting topology engine")?;

    let (replies, reply_rx) = mpsc::channel(config.node.outbound_buffer);
    let writer = tokio::spawn(write_output(outbound, reply_rx));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Signal handler failed, shutting down");
                }
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&engine, &replies, &line),
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            }
        }
    }

    engine.stop().await;
    // Dropping both senders ends the writer
    drop(engine);
    drop(replies);
    if let Err(e) = writer.await {
        warn!(error = %e, "Output writer ended abnormally");
    }

    info!("meshgate-node stopped");
    Ok(())
}

fn handle_line(engine: &TopologyEngine, replies: &mpsc::Sender<ControlReply>, line: &str) {
    match protocol::parse_line(line) {
        Ok(Some(InboundLine::Event(event))) => engine.handle_event(&event),
        Ok(Some(InboundLine::Command(command))) => {
            let reply = handle_command(engine, command);
            if let Err(e) = replies.try_send(reply) {
                warn!(error = %e, "Dropping command reply");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Ignoring unparsable input line"),
    }
}

fn handle_command(engine: &TopologyEngine, command: ControlCommand) -> ControlReply {
    let name = command.name();
    let result = match command {
        ControlCommand::Status => return ControlReply::Status(engine.status()),
        ControlCommand::Trace { node_id } => engine
            .request_trace(&node_id)
            .map(|outcome| info!(node_id = %node_id, ?outcome, "Manual trace requested")),
        ControlCommand::ResetEmergencyStop => {
            engine.reset_emergency_stop();
            info!("Emergency stop reset by operator");
            Ok(())
        }
        ControlCommand::Save => engine.save(),
    };

    match result {
        Ok(()) => ControlReply::Ok { command: name },
        Err(e) => {
            warn!(command = name, error = %e, "Command failed");
            ControlReply::Error {
                command: name,
                message: e.to_string(),
            }
        }
    }
}

async fn write_output(
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut replies: mpsc::Receiver<ControlReply>,
) {
    let mut stdout = tokio::io::stdout();
    loop {
        let encoded = tokio::select! {
            Some(message) = outbound.recv() => protocol::encode_line(&message),
            Some(reply) = replies.recv() => protocol::encode_line(&reply),
            else => break,
        };
        let line = match encoded {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Cannot encode outbound message");
                continue;
            }
        };
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!(error = %e, "Output closed, dropping outbound messages");
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!(error = %e, "Failed to flush output");
        }
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow!("--config was provided without a path"));
        }
    }

    Err(anyhow!("missing required --config <path> argument"))
}
