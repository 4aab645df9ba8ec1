//! Fan-out broadcaster: serves the merged frame sequence to any number of
//! TCP subscribers, each behind a small bounded queue so one slow reader
//! only loses its own records.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::wire::codec;
use crate::wire::{FrameRecord, Header, HeaderType, NETWORK_VERSION};

/// Per-subscriber queue depth before records get dropped.
const SUBSCRIBER_QUEUE: usize = 10;

pub struct Broadcaster {
    listener: TcpListener,
    idle: Duration,
    grace: Duration,
    subscribers: Arc<DashMap<u64, mpsc::Sender<Bytes>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// Binds the broadcast port; `idle` is the per-write deadline applied
    /// to every subscriber socket.
    pub async fn bind(port: u16, idle: Duration, grace: Duration) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding broadcaster on :{port}"))?;
        info!(addr = %listener.local_addr()?, "broadcasting merged frames");

        Ok(Self {
            listener,
            idle,
            grace,
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves subscribers until the incoming queue closes or the scope is
    /// cancelled, then lets them drain within the grace period.
    pub async fn run(
        self,
        cancel: CancellationToken,
        mut incoming: mpsc::Receiver<FrameRecord>,
    ) -> Result<()> {
        let mut serving = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                record = incoming.recv() => {
                    let Some(record) = record else { break };
                    let data = codec::encode_delimited(&record);
                    for sub in self.subscribers.iter() {
                        // Slow subscribers miss this record.
                        let _ = sub.value().try_send(data.clone());
                    }
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted.context("accepting subscriber")?;
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
                    self.subscribers.insert(id, tx);
                    serving.spawn(serve_subscriber(
                        id,
                        stream,
                        addr,
                        rx,
                        self.idle,
                        Arc::clone(&self.subscribers),
                    ));
                }
            }
        }

        drop(self.listener);
        // Closing every queue lets subscribers drain and exit.
        self.subscribers.clear();

        let drained = tokio::time::timeout(self.grace, async {
            while serving.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(grace = ?self.grace, "force closing remaining subscribers");
            serving.abort_all();
            while serving.join_next().await.is_some() {}
        }

        Ok(())
    }
}

async fn serve_subscriber(
    id: u64,
    mut stream: TcpStream,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    idle: Duration,
    subscribers: Arc<DashMap<u64, mpsc::Sender<Bytes>>>,
) {
    info!(%addr, "started data stream");

    let header = Header {
        kind: HeaderType::Network as i32,
        version: Some(NETWORK_VERSION),
        ..Default::default()
    };

    let result: Result<()> = async {
        let encoded = codec::encode_delimited(&header);
        tokio::time::timeout(idle, stream.write_all(&encoded))
            .await
            .context("header write deadline")?
            .context("writing header")?;

        while let Some(data) = rx.recv().await {
            tokio::time::timeout(idle, stream.write_all(&data))
                .await
                .context("write deadline")?
                .context("writing record")?;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => info!(%addr, "stopping stream"),
        Err(e) => warn!(%addr, error = %e, "stopping stream early"),
    }
    subscribers.remove(&id);
}
