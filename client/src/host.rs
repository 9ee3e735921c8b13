use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const MAX_REPLY_LEN: usize = 1024;

#[derive(Debug, Parser)]
#[command(name = "volcano-client")]
#[command(about = "Sends one command to a running volcano-bridge and prints the reply")]
#[command(version)]
struct Args {
    /// Command to send, e.g. HeatOn, Temp=190, FanOffTimer=30
    message: String,

    /// Host the bridge listens on
    #[arg(long, default_value = "127.0.0.1", env = "VOLCANO_HOST")]
    host: String,

    /// Port the bridge listens on
    #[arg(short, long, default_value_t = 65432, env = "VOLCANO_PORT")]
    port: u16,

    /// Terminate the message with a newline (bridge running with lines framing)
    #[arg(long)]
    newline: bool,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);
    let reply = send(
        &addr,
        &args.message,
        args.newline,
        Duration::from_secs(args.timeout),
    )
    .await?;

    match reply {
        Some(reply) => println!("Received: {reply}"),
        None => println!("Connection closed by the bridge"),
    }
    Ok(())
}

/// Sends `message` and waits for one reply. `None` when the bridge closes the
/// connection without answering, as it does for `Disconnect`.
async fn send(
    addr: &str,
    message: &str,
    newline: bool,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to bridge at {addr}"))?;
    info!("connected to {addr}");

    let mut payload = message.as_bytes().to_vec();
    if newline {
        payload.push(b'\n');
    }
    stream
        .write_all(&payload)
        .await
        .context("failed to send message")?;
    debug!("sent {message:?}");

    let mut buffer = vec![0; MAX_REPLY_LEN];
    let read = tokio::time::timeout(timeout, stream.read(&mut buffer))
        .await
        .context("timed out waiting for a reply")?
        .context("failed to read reply")?;
    if read == 0 {
        return Ok(None);
    }

    let reply = String::from_utf8_lossy(&buffer[..read]);
    Ok(Some(reply.trim_end_matches(['\r', '\n']).to_string()))
}
