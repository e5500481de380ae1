use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use call_session::telemetry::logging::{self, LogConfig, LogLevel};
use call_session::telemetry::payload_preview;
use call_session::{CallConfig, CallController, CallEvent};
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use transport_webrtc::{WebRtcConfig, WebRtcPeerTransport};

#[derive(Parser, Debug)]
#[command(
    name = "call-loopback",
    about = "Place a data call between two in-process peers"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, env = "CALL_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, short = 'c', help = "TOML file with call settings")]
    config: Option<PathBuf>,

    #[arg(long, env = "CALL_TIMEOUT_SECONDS")]
    call_timeout: Option<f32>,

    #[arg(long, help = "Fail the call on non-fatal connect errors")]
    strict: bool,

    #[arg(long, value_delimiter = ',', env = "CALL_RELIABLE_CHANNELS")]
    reliable: Vec<String>,

    #[arg(long, value_delimiter = ',', env = "CALL_UNRELIABLE_CHANNELS")]
    unreliable: Vec<String>,

    #[arg(long, short = 'n', default_value_t = 3, help = "Messages to send per channel")]
    messages: usize,

    #[arg(long, default_value_t = 20, help = "Seconds to wait for each step")]
    wait: u64,
}

impl Cli {
    fn call_config(&self) -> anyhow::Result<CallConfig> {
        let mut config = match &self.config {
            Some(path) => CallConfig::load(path)
                .with_context(|| format!("loading call config from {}", path.display()))?
                .with_env_overrides(),
            None => CallConfig::from_env(),
        };
        if let Some(seconds) = self.call_timeout {
            config.call_timeout_seconds = seconds;
        }
        if self.strict {
            config.ignore_non_fatal_connect_errors = false;
        }
        if !self.reliable.is_empty() {
            config.default_reliable_channel_labels = self.reliable.clone();
        }
        if !self.unreliable.is_empty() {
            config.default_unreliable_channel_labels = self.unreliable.clone();
        }
        Ok(config)
    }
}

#[derive(Serialize)]
struct Ping<'a> {
    seq: usize,
    channel: &'a str,
}

fn log_events(side: &'static str, mut events: broadcast::Receiver<CallEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::MessageReceived { label, payload }) => info!(
                    side,
                    label = %label,
                    payload = %payload_preview(&payload, 120),
                    "message received"
                ),
                Ok(CallEvent::DataChannelAdded(handle)) => {
                    info!(side, label = %handle.label(), "data channel added")
                }
                Ok(event) => info!(side, event = event.name(), "call notification"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(side, skipped, "event log lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    limit: Duration,
    mut matches: impl FnMut(&CallEvent) -> bool,
) -> anyhow::Result<CallEvent> {
    timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    })
    .await
    .context("timed out waiting for call notification")?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = cli.call_config()?;
    let channels = config.default_channels();
    let step = Duration::from_secs(cli.wait);
    info!(
        call_timeout = ?config.call_timeout(),
        channels = ?channels.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(),
        "starting loopback call"
    );

    let (caller_transport, callee_transport) =
        WebRtcPeerTransport::local_pair(WebRtcConfig::localhost())
            .await
            .context("building peer transports")?;

    let caller = CallController::builder(caller_transport)
        .config(config.clone())
        .spawn();
    let callee = CallController::builder(callee_transport)
        .config(config)
        .spawn();
    let caller_log = log_events("caller", caller.subscribe());
    let callee_log = log_events("callee", callee.subscribe());

    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    caller.toggle_call().await;
    let outcome = wait_for(&mut caller_events, step, |event| {
        matches!(event, CallEvent::CallStarted | CallEvent::CallFailed)
    })
    .await?;
    if outcome == CallEvent::CallFailed {
        caller.shutdown().await;
        callee.shutdown().await;
        bail!("call failed to connect");
    }

    let mut expected = 0;
    for spec in &channels {
        for seq in 0..cli.messages {
            let ping = Ping {
                seq,
                channel: &spec.label,
            };
            match caller.send_json(&ping, spec.label.as_str()).await {
                Ok(delivery) => {
                    expected += 1;
                    info!(label = %spec.label, seq, ?delivery, "message handed off");
                }
                Err(err) => warn!(label = %spec.label, seq, error = %err, "message rejected"),
            }
        }
    }

    let mut received = 0;
    while received < expected {
        match wait_for(&mut callee_events, step, |event| {
            matches!(event, CallEvent::MessageReceived { .. })
        })
        .await
        {
            Ok(_) => received += 1,
            Err(err) => {
                warn!(received, expected, error = %err, "stopped waiting for messages");
                break;
            }
        }
    }
    info!(received, expected, "message exchange finished");

    caller.toggle_call().await;
    wait_for(&mut caller_events, step, |event| *event == CallEvent::CallEnded).await?;
    // let the settle notification and remote close reach the logs
    sleep(Duration::from_millis(500)).await;

    let status = caller.status().await?;
    info!(
        phase = ?status.phase,
        channels = status.channels.len(),
        pending = status.pending_messages,
        "caller idle"
    );

    caller.shutdown().await;
    callee.shutdown().await;
    drop(caller);
    drop(callee);
    for log in [caller_log, callee_log] {
        if timeout(Duration::from_secs(1), log).await.is_err() {
            warn!("event log did not drain");
        }
    }
    Ok(())
}
