// Tunnel demo: stands up the in-process bus, a proxy, and a local echo
// server, then round-trips a payload through a bus stream.
use anyhow::{Context, Result};
use clap::Parser;
use culvert_bus::{Bus, BusConfig, InProcessBus};
use culvert_pool::{StreamPool, default_dial, trace};
use culvert_proxy::{Proxy, ProxyConfig};
use culvert_stream::BusStream;
use culvert_wire::{Endpoint, Family};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-demo")]
#[command(about = "Round-trip a payload through the bus tunnel")]
struct Args {
    /// Subject prefix shared by the adapter and the proxy
    #[arg(long, default_value = "px")]
    subject: String,

    /// Payload to tunnel
    #[arg(long, default_value = "PING\r\n")]
    payload: String,

    /// Target host:port; a local echo server is spawned when omitted
    #[arg(long)]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let target = match &args.target {
        Some(addr) => addr.clone(),
        None => test_harness::echo_server()
            .await
            .context("start echo server")?
            .to_string(),
    };
    info!(%target, subject = %args.subject, "tunnel target");

    let bus = Arc::new(InProcessBus::new(BusConfig::from_env()));
    // Trace dialed streams so RUST_LOG=trace shows the proxied bytes.
    let pool = Arc::new(StreamPool::with_dial(trace::traced(default_dial())));
    let proxy = Proxy::with_pool(
        Arc::clone(&bus) as Arc<dyn Bus>,
        &args.subject,
        Arc::clone(&pool),
    )
    .with_config(ProxyConfig::from_env_or_yaml(None).context("proxy config")?);
    let handle = proxy.start().await.context("start proxy")?;
    info!("proxy started");

    let endpoint = Endpoint::new(Family::Tcp, target).context("target endpoint")?;
    let stream = BusStream::new(Arc::clone(&bus) as Arc<dyn Bus>, &args.subject, endpoint)
        .context("build stream")?;

    tokio::select! {
        result = round_trip(&stream, args.payload.as_bytes()) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    stream.close().await.context("close stream")?;
    handle.shutdown().await.context("stop proxy")?;
    pool.close_all().await.context("close pool")?;
    info!("tunnel stopped");
    Ok(())
}

async fn round_trip(stream: &BusStream, payload: &[u8]) -> Result<()> {
    let written = stream.write(payload).await.context("tunnel write")?;
    info!(written, "payload sent");

    let mut collected = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; payload.len().max(64)];
    while collected.len() < payload.len() {
        let n = stream.read(&mut buf).await.context("tunnel read")?;
        anyhow::ensure!(n > 0, "target ended the stream early");
        collected.extend_from_slice(&buf[..n]);
    }
    info!(
        echoed = %String::from_utf8_lossy(&collected),
        "payload echoed back"
    );
    anyhow::ensure!(collected == payload, "echo mismatch");
    Ok(())
}
