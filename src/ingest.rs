//! Frame-source listener: accepts TCP connections from local and remote
//! trackers and decodes their delimited frame streams into one shared
//! inbound queue.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::wire::codec;
use crate::wire::FrameRecord;

/// TCP listener feeding the merger's inbound queue.
///
/// Binding happens at construction so a busy port surfaces as a startup
/// error before the experiment begins.
pub struct FrameListener {
    listener: TcpListener,
    grace: Duration,
    outbound: mpsc::Sender<FrameRecord>,
}

impl FrameListener {
    pub async fn bind(
        port: u16,
        grace: Duration,
        outbound: mpsc::Sender<FrameRecord>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding frame listener on :{port}"))?;
        info!(addr = %listener.local_addr()?, "listening for incoming frames");

        Ok(Self {
            listener,
            grace,
            outbound,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until cancelled, then waits `grace` for
    /// in-flight connections before force-closing them. Consumes the
    /// listener so the outbound queue closes exactly once on return.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted.context("accepting frame source")?;
                    let outbound = self.outbound.clone();
                    let conn_cancel = cancel.clone();
                    connections.spawn(async move {
                        read_connection(stream, addr, outbound, conn_cancel).await;
                    });
                }
            }
        }

        drop(self.listener);

        let drained = tokio::time::timeout(self.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(grace = ?self.grace, "grace expired, force closing remaining connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        Ok(())
    }
}

async fn read_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    outbound: mpsc::Sender<FrameRecord>,
    cancel: CancellationToken,
) {
    info!(%addr, "start reading incoming frames");
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            read = codec::read_delimited::<_, FrameRecord>(&mut stream, &mut buf) => {
                match read {
                    Ok(Some(frame)) => {
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(%addr, error = %e, "frame reading error");
                        break;
                    }
                }
            }
        }
    }

    info!(%addr, "stop reading incoming frames");
}
