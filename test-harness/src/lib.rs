// Shared fixtures for tunnel integration tests and demos: local TCP targets
// plus bus/proxy wiring.
use anyhow::Result;
use culvert_bus::{Bus, BusConfig, InProcessBus};
use culvert_pool::{DialFn, StreamPool, default_dial};
use culvert_proxy::{Proxy, ProxyHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

/// Per-connection TCP echo listener. Returns the bound address; the accept
/// loop runs until the process exits.
pub async fn echo_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, peer)) = listener.accept().await else {
                break;
            };
            debug!(%peer, "echo connection accepted");
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(addr)
}

/// Per-connection TCP sink listener: reads and discards whatever arrives.
/// Returns the bound address; useful for write-only tunnel tests.
pub async fn sink_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, peer)) = listener.accept().await else {
                break;
            };
            debug!(%peer, "sink connection accepted");
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    Ok(addr)
}

/// Everything a tunnel test needs on the serving side: the bus both halves
/// share, the proxy's pool (for entry assertions), and the running proxy.
pub struct TunnelFixture {
    pub bus: Arc<InProcessBus>,
    pub pool: Arc<StreamPool>,
    pub handle: ProxyHandle,
    pub subject: String,
}

/// Bus + proxy on `subject` with the standard outbound dial.
pub async fn start_tunnel(subject: &str) -> Result<TunnelFixture> {
    start_tunnel_with_dial(subject, default_dial()).await
}

pub async fn start_tunnel_with_dial(subject: &str, dial: DialFn) -> Result<TunnelFixture> {
    let bus = Arc::new(InProcessBus::new(BusConfig::default()));
    let pool = Arc::new(StreamPool::with_dial(dial));
    let proxy = Proxy::with_pool(
        Arc::clone(&bus) as Arc<dyn Bus>,
        subject,
        Arc::clone(&pool),
    );
    let handle = proxy.start().await?;
    Ok(TunnelFixture {
        bus,
        pool,
        handle,
        subject: subject.to_string(),
    })
}
