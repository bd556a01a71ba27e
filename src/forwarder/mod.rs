//! Front-door TCP forwarder.
//!
//! Sniffs the first chunk of each connection and splices WebSocket-upgrade
//! traffic for the proxy endpoints to the proxy port; everything else goes
//! to the HTTP application. A raw TCP sniff sidesteps runtimes whose HTTP
//! servers do not reliably surface upgrade events.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};

/// Bytes inspected from the first chunk.
const SNIFF_LIMIT: usize = 512;

/// Request paths that belong to the proxy.
const PROXY_PREFIXES: &[&str] = &["/terminal/", "/presence/", "/sessions/"];

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Where proxy-bound connections are spliced to.
    pub proxy_addr: String,
    /// Where everything else is spliced to.
    pub http_addr: String,
}

/// Decide from the first chunk whether a connection belongs to the proxy.
pub fn is_proxy_bound(first_chunk: &[u8]) -> bool {
    let text = String::from_utf8_lossy(&first_chunk[..first_chunk.len().min(SNIFF_LIMIT)]);

    if !text.contains("Upgrade: websocket") {
        return false;
    }

    PROXY_PREFIXES
        .iter()
        .any(|prefix| text.starts_with(&format!("GET {prefix}")))
}

/// Accept loop: sniff each connection and splice to its target.
pub async fn serve(listener: TcpListener, config: ForwarderConfig) -> Result<()> {
    info!("front door listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        let config = config.clone();

        tokio::spawn(async move {
            if let Err(err) = forward(stream, &config).await {
                debug!("forwarding for {} ended: {:#}", peer, err);
            }
        });
    }
}

async fn forward(mut inbound: TcpStream, config: &ForwarderConfig) -> Result<()> {
    let mut first_chunk = vec![0u8; SNIFF_LIMIT];
    let read = inbound
        .read(&mut first_chunk)
        .await
        .context("reading first chunk")?;
    if read == 0 {
        return Ok(());
    }
    first_chunk.truncate(read);

    let target = if is_proxy_bound(&first_chunk) {
        &config.proxy_addr
    } else {
        &config.http_addr
    };

    let mut outbound = TcpStream::connect(target)
        .await
        .with_context(|| format!("connecting to {target}"))?;

    // The sniffed bytes must reach the target before any further piping.
    outbound
        .write_all(&first_chunk)
        .await
        .context("replaying first chunk")?;

    match copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!("splice to {} broke: {}", target, err);
            Ok(())
        }
    }
}
