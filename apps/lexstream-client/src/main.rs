use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lexstream_protocol::{CaseId, EventType, QueryRequest, StreamEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

mod render;

use crate::render::{Tally, describe};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Parser)]
#[command(name = "lexstream-client")]
#[command(about = "Send queries to a lexstream server and print the event stream")]
struct Cli {
    #[arg(long, env = "LEXSTREAM_URL", default_value = "ws://127.0.0.1:8000/ws/query")]
    url: String,
    #[arg(long)]
    case_id: Option<CaseId>,
    /// Ask the server to leave out thinking events.
    #[arg(long)]
    no_thinking: bool,
    /// Give up on a query after this many seconds without its terminal event.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    /// Print raw JSON frames instead of rendered events.
    #[arg(long)]
    json: bool,
    /// Queries to send, one after another on the same connection.
    #[arg(required = true)]
    queries: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    let (mut socket, _) = connect_async(cli.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))?;
    let greeting = next_event(&mut socket, Duration::from_secs(5)).await?;
    if greeting.event_type != EventType::ConnectionEstablished {
        bail!("expected connection_established, got {}", greeting.event_type);
    }
    info!(
        url = %cli.url,
        connection_id = ?greeting.connection_id.as_ref().map(|id| id.as_str()),
        "connected"
    );

    let mut tally = Tally::default();
    for query in &cli.queries {
        let mut request = QueryRequest::new(query.as_str()).with_stream_thinking(!cli.no_thinking);
        request.case_id = cli.case_id;
        run_query(&mut socket, &request, timeout, cli.json, &mut tally).await?;
    }

    if let Err(error) = socket.close(None).await {
        warn!(%error, "close handshake failed");
    }

    println!("{}", "=".repeat(60));
    for line in tally.summary() {
        println!("{line}");
    }
    Ok(())
}

/// Send one query and print events until the server is ready for the next.
async fn run_query(
    socket: &mut Socket,
    request: &QueryRequest,
    timeout: Duration,
    raw: bool,
    tally: &mut Tally,
) -> Result<()> {
    info!(query = %request.query, case_id = ?request.case_id, "sending query");
    socket
        .send(Message::Text(serde_json::to_string(request)?.into()))
        .await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = next_event(socket, remaining)
            .await
            .with_context(|| format!("no result for query within {}s", timeout.as_secs()))?;
        tally.record(&event);
        print_event(&event, raw)?;

        match event.event_type {
            EventType::ReadyForNextQuery | EventType::QueryRejected | EventType::Error => {
                return Ok(());
            }
            EventType::AgentExecutionComplete | EventType::AgentExecutionError => {
                debug!("terminal event received");
            }
            _ => {}
        }
    }
}

fn print_event(event: &StreamEvent, raw: bool) -> Result<()> {
    if raw {
        println!("{}", serde_json::to_string(event)?);
    } else {
        for line in describe(event) {
            println!("{line}");
        }
        println!();
    }
    Ok(())
}

async fn next_event(socket: &mut Socket, timeout: Duration) -> Result<StreamEvent> {
    loop {
        let message = tokio::time::timeout(timeout, socket.next())
            .await
            .context("timed out waiting for the server")?
            .context("server closed the connection")??;
        match message {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(frame) => bail!("server closed the connection: {frame:?}"),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            Message::Binary(bytes) => debug!(bytes = bytes.len(), "ignoring binary frame"),
        }
    }
}
