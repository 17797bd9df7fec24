//! TaskMatch agent
//!
//! Runs a worker or requester session against a live server. Operator
//! commands are read from stdin, one per line.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod command;
mod config;
mod json_output;

use command::Command;
use taskmatch_client::HttpClient;
use taskmatch_core::{GeoPoint, TaskId, WorkerId};
use taskmatch_realtime::{
    ChannelManager, Credential, RealtimeError, RequesterSession, SessionEvent,
    StaticLocationSource, WebSocketTransport, WorkerSession,
};

/// Headless TaskMatch worker or requester
#[derive(Parser)]
#[command(name = "taskmatch-agent")]
#[command(about = "Drive a TaskMatch worker or requester from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Real-time channel URL
    #[arg(long, default_value = "ws://localhost:4000/socket")]
    ws_url: String,

    /// REST API base URL
    #[arg(long, default_value = "http://localhost:4000/api")]
    api_url: String,

    /// Bearer token
    #[arg(long, env = "TASKMATCH_TOKEN")]
    token: String,

    /// TOML file with timing overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Act as a worker receiving offers
    Worker {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Worker ID
        #[arg(long)]
        worker_id: String,

        /// Current latitude
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Current longitude
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,

        /// Go online right after connecting
        #[arg(long)]
        online: bool,
    },

    /// Follow one task as its requester
    Requester {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Task ID
        #[arg(long)]
        task_id: String,
    },
}

enum Input {
    Line(Option<String>),
    Event(Option<SessionEvent>),
    Interrupt,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskmatch=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Worker {
            connection,
            worker_id,
            lat,
            lng,
            online,
        } => {
            let position = GeoPoint::new(lat, lng);
            run_worker(connection, WorkerId::new(worker_id), position, online).await
        }
        Commands::Requester {
            connection,
            task_id,
        } => run_requester(connection, TaskId::new(task_id)).await,
    }
}

fn connect(
    args: &ConnectionArgs,
    config: &taskmatch_realtime::RealtimeConfig,
) -> (ChannelManager, Arc<HttpClient>) {
    if args.json {
        json_output::enable_json_mode();
    }
    let transport = WebSocketTransport::new(args.ws_url.clone());
    let channel = ChannelManager::new(transport, config.channel.clone());
    channel.connect(Credential::bearer(args.token.clone()));
    let http = Arc::new(HttpClient::new(&args.api_url, args.token.clone()));
    info!(ws_url = %args.ws_url, api_url = %args.api_url, "Connecting");
    (channel, http)
}

async fn run_worker(
    args: ConnectionArgs,
    worker_id: WorkerId,
    position: GeoPoint,
    online: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !position.is_valid() {
        return Err(format!("invalid position {},{}", position.lat, position.lng).into());
    }
    let config = config::load(args.config.as_deref())?;
    let (channel, http) = connect(&args, &config);
    let source = Arc::new(StaticLocationSource::new(position));
    let mut session =
        WorkerSession::new(worker_id, config, channel.clone(), http.clone(), http, source);
    info!(worker_id = %session.worker_id(), "Starting TaskMatch worker");

    if online {
        if let Err(e) = session.go_online() {
            report_rejection("online", &e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            event = session.next_event() => Input::Event(event),
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };
        match input {
            Input::Line(Some(line)) => match Command::parse(&line) {
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => {
                    if let Err(e) = apply_worker(&mut session, &command) {
                        report_rejection(line.trim(), &e);
                    }
                }
                Ok(None) => {}
                Err(e) => report_error(&e.to_string()),
            },
            Input::Event(Some(event)) => report_event(&event),
            Input::Line(None) | Input::Event(None) | Input::Interrupt => break,
        }
    }

    info!("Shutting down worker");
    session.shutdown();
    channel.disconnect();
    Ok(())
}

fn apply_worker(session: &mut WorkerSession, command: &Command) -> Result<(), RealtimeError> {
    match command {
        Command::Online => session.go_online(),
        Command::Offline => session.go_offline(),
        Command::Accept => session.accept(),
        Command::Decline { reason } => session.decline(reason.clone()),
        Command::Dismiss => session.dismiss(),
        Command::Arrive => session.confirm_arrival(),
        Command::Start => session.start(),
        Command::Complete { otp } => session.complete(otp.clone()),
        Command::Cancel { .. } | Command::Quit => Err(unsupported("worker")),
    }
}

async fn run_requester(
    args: ConnectionArgs,
    task_id: TaskId,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load(args.config.as_deref())?;
    let (channel, http) = connect(&args, &config);
    let mut session = RequesterSession::new(task_id, config, channel.clone(), http);
    info!(task_id = %session.task_id(), "Starting TaskMatch requester");
    if let Err(e) = session.start_search() {
        report_rejection("start", &e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            event = session.next_event() => Input::Event(event),
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };
        match input {
            Input::Line(Some(line)) => match Command::parse(&line) {
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => {
                    let result = match command {
                        Command::Cancel { reason } => session.cancel(reason),
                        Command::Start => session.start_search(),
                        _ => Err(unsupported("requester")),
                    };
                    if let Err(e) = result {
                        report_rejection(line.trim(), &e);
                    }
                }
                Ok(None) => {}
                Err(e) => report_error(&e.to_string()),
            },
            Input::Event(Some(event)) => {
                report_event(&event);
                if session.is_done() {
                    info!("Task finished");
                    break;
                }
            }
            Input::Line(None) | Input::Event(None) | Input::Interrupt => break,
        }
    }

    info!("Shutting down requester");
    session.shutdown();
    channel.disconnect();
    Ok(())
}

fn unsupported(role: &str) -> RealtimeError {
    taskmatch_core::CoreError::InvalidInput(format!("not available to a {}", role)).into()
}

fn report_event(event: &SessionEvent) {
    if json_output::is_json_mode() {
        json_output::emit_session_event(event);
    } else {
        match serde_json::to_string(event) {
            Ok(data) => info!(event = event.name(), data = %data, "Session event"),
            Err(e) => warn!(event = event.name(), error = %e, "Unprintable session event"),
        }
    }
}

fn report_rejection(command: &str, error: &RealtimeError) {
    warn!(command, error = %error, "Command rejected");
    json_output::emit_command_rejected(command, &error.to_string());
}

fn report_error(message: &str) {
    warn!(message, "Invalid input");
    json_output::emit_error(message);
}
