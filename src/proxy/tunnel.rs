//! Exec tunnel: loopback TCP bridge into a container.
//!
//! On hosts where the container network is not routable (typical desktop
//! engines) the daemon's `exec` API is the transport of last resort. The
//! tunnel binds an ephemeral loopback listener, accepts exactly one
//! connection, and splices it to `exec -i <name> nc localhost <port>`
//! inside the target container.

use std::process::Stdio;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::io::{AsyncWriteExt, copy};
use tokio::net::TcpListener;
use tokio::process::Command;

/// A single-shot loopback bridge into a container.
pub struct ExecTunnel {
    port: u16,
}

impl ExecTunnel {
    /// Open the tunnel. Returns once the listener is bound; the splice is
    /// armed for exactly one accept and the listener closes afterwards.
    pub async fn open(engine_binary: &str, container_name: &str, container_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding tunnel listener")?;
        let port = listener.local_addr().context("tunnel local addr")?.port();

        let engine = engine_binary.to_string();
        let name = container_name.to_string();

        tokio::spawn(async move {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("tunnel accept failed: {}", err);
                    return;
                }
            };
            // Single-shot: no further accepts.
            drop(listener);
            debug!("tunnel accepted {} for {}", peer, name);

            if let Err(err) = splice(&engine, &name, container_port, stream).await {
                warn!("tunnel to {} ended with error: {:#}", name, err);
            }
        });

        Ok(Self { port })
    }

    /// Loopback port to connect to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Pipe a TCP stream through `exec -i <name> nc localhost <port>`.
async fn splice(
    engine: &str,
    container_name: &str,
    container_port: u16,
    stream: tokio::net::TcpStream,
) -> Result<()> {
    let mut child = Command::new(engine)
        .args([
            "exec",
            "-i",
            container_name,
            "nc",
            "localhost",
            &container_port.to_string(),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("spawning exec nc")?;

    let mut child_stdin = child.stdin.take().context("child stdin")?;
    let mut child_stdout = child.stdout.take().context("child stdout")?;

    let (mut sock_read, mut sock_write) = stream.into_split();

    let to_child = async {
        let result = copy(&mut sock_read, &mut child_stdin).await;
        let _ = child_stdin.shutdown().await;
        result
    };
    let from_child = async {
        let result = copy(&mut child_stdout, &mut sock_write).await;
        let _ = sock_write.shutdown().await;
        result
    };

    // Either side closing tears the whole bridge down.
    tokio::select! {
        result = to_child => {
            result.context("socket to exec")?;
        }
        result = from_child => {
            result.context("exec to socket")?;
        }
    }

    let _ = child.kill().await;
    Ok(())
}
