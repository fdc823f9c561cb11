use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use agentdeck_stream_client::config::{ENV_TOKEN, default_session_path};
use agentdeck_stream_client::{
    CredentialProvider, Envelope, EventKind, Frame, Scope, StaticToken, StreamClient, StreamConfig,
    StreamEvent, Subscription, TokenStore,
};

/// Tails agentdeck event streams, one JSON line per envelope.
#[derive(Debug, Parser)]
#[command(name = "agentdeck-stream-tail", version)]
struct Args {
    /// Configuration file (defaults to the per-user agentdeck config).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Tail the global stream. Implied when no agent is given.
    #[arg(long)]
    global: bool,

    /// Tail an agent's stream; repeatable.
    #[arg(long = "agent", value_name = "ID")]
    agents: Vec<String>,

    /// Only print envelopes of this type (e.g. `log`, `chat`); repeatable.
    #[arg(long = "kind", value_name = "TYPE", value_parser = parse_kind)]
    kinds: Vec<EventKind>,

    /// Frame to send on every tailed scope, e.g. `{"type":"chat","data":{"text":"hi"}}`.
    #[arg(long, value_name = "JSON")]
    send_json: Option<String>,
}

impl Args {
    fn scopes(&self) -> Vec<Scope> {
        let mut scopes = Vec::new();
        if self.global || self.agents.is_empty() {
            scopes.push(Scope::Global);
        }
        scopes.extend(self.agents.iter().map(Scope::agent));
        scopes
    }
}

fn parse_kind(raw: &str) -> Result<EventKind, std::convert::Infallible> {
    Ok(EventKind::from(raw))
}

/// An empty filter lets every kind through.
fn wanted(kinds: &[EventKind], kind: &str) -> bool {
    kinds.is_empty() || kinds.contains(&EventKind::from(kind))
}

#[derive(Serialize)]
struct Line<'a> {
    scope: &'a Scope,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

/// Parses `--send-json` into an outbound frame.
fn parse_outbound(raw: &str) -> anyhow::Result<Frame> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--send-json is not JSON")?;
    let Some(object) = value.as_object() else {
        bail!("--send-json must be a JSON object");
    };
    let Some(kind) = object.get("type").and_then(|t| t.as_str()) else {
        bail!("--send-json needs a string \"type\" field");
    };
    let data = object.get("data").cloned().unwrap_or(serde_json::Value::Null);
    Ok(Frame::new(kind, &data)?)
}

fn credentials() -> anyhow::Result<Arc<dyn CredentialProvider>> {
    if let Ok(token) = std::env::var(ENV_TOKEN)
        && !token.is_empty()
    {
        return Ok(Arc::new(StaticToken::new(token)));
    }
    let path = default_session_path().context("no config directory for the session file")?;
    let store = TokenStore::new(path).context("failed to load session")?;
    Ok(Arc::new(store))
}

fn print_event(scope: &Scope, kinds: &[EventKind], event: &StreamEvent) {
    match event {
        StreamEvent::Envelope(envelope) if !wanted(kinds, &envelope.kind) => {}
        StreamEvent::Envelope(envelope) => match serde_json::to_string(&Line { scope, envelope }) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("[{scope}] unprintable envelope {}: {e}", envelope.sequence),
        },
        StreamEvent::StateChanged(state) => eprintln!("[{scope}] {state:?}"),
        StreamEvent::DecodeError(e) => eprintln!("[{scope}] dropped frame: {e}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = StreamConfig::load(args.config.as_deref()).context("invalid configuration")?;
    let outbound = args.send_json.as_deref().map(parse_outbound).transpose()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.base_url,
        "starting stream tail"
    );

    let client = StreamClient::with_connector(
        config,
        credentials()?,
        Arc::new(agentdeck_stream_client::WsConnector::new()),
    )
    .context("invalid configuration")?;

    let mut subscriptions: Vec<Subscription> = Vec::new();
    for scope in args.scopes() {
        let printed = scope.clone();
        let kinds = args.kinds.clone();
        subscriptions.push(
            client.subscribe(&scope, move |event| print_event(&printed, &kinds, event)),
        );
        client
            .connect(&scope)
            .with_context(|| format!("cannot connect {scope}"))?;
        if let Some(frame) = &outbound {
            let receipt = client.send(&scope, frame.clone())?;
            tracing::debug!(scope = %scope, ?receipt, "frame submitted");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    drop(subscriptions);
    client.shutdown();
    Ok(())
}
