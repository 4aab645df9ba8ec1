//! Best-effort client for the central monitoring service.
//!
//! The client keeps one streaming connection alive for the duration of an
//! experiment: a declaration on connect, then one upstream message per
//! disk status / alarm push, each acknowledged by the service. Connection
//! failures trigger a jittered reconnect; pushes are fire-and-forget for
//! callers and only ever logged on error.

use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmLevel, AlarmStatus, AlarmUpdate};
use crate::wire::codec;
use crate::wire::Timestamp;

/// Identification of the experiment-failure alarm.
pub const FAILURE_ALARM: &str = "tracking.failure";

/// Announces this node's experiment to the monitoring service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TrackingDeclaration {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, tag = "2")]
    pub experiment_name: String,
    #[prost(string, tag = "3")]
    pub stream_server: String,
    #[prost(message, optional, tag = "4")]
    pub since: Option<Timestamp>,
}

/// Disk headroom snapshot pushed alongside alarms.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DiskStatus {
    #[prost(int64, tag = "1")]
    pub free_bytes: i64,
    #[prost(int64, tag = "2")]
    pub total_bytes: i64,
    #[prost(int64, tag = "3")]
    pub bytes_per_second: i64,
}

/// One upstream message of the monitor protocol.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MonitorUpstream {
    #[prost(message, optional, tag = "1")]
    pub declaration: Option<TrackingDeclaration>,
    #[prost(message, optional, tag = "2")]
    pub disk_status: Option<DiskStatus>,
    #[prost(message, repeated, tag = "3")]
    pub alarms: Vec<AlarmUpdate>,
}

/// Acknowledgement for one upstream message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MonitorAck {
    #[prost(string, tag = "1")]
    pub error: String,
}

enum Push {
    Status {
        status: DiskStatus,
        alarm: Option<AlarmUpdate>,
    },
    Fatal(String),
}

/// Fire-and-forget sender handed to the disk watcher and the orchestrator.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Push>,
}

impl MonitorHandle {
    /// Queues a disk status and optional alarm update. Drops the push when
    /// the client is backed up or gone.
    pub fn push_disk_status(&self, status: DiskStatus, alarm: Option<AlarmUpdate>) {
        if self.tx.try_send(Push::Status { status, alarm }).is_err() {
            debug!("monitor push dropped");
        }
    }

    /// Reports an experiment failure.
    pub fn fatal(&self, error: &anyhow::Error) {
        if self.tx.try_send(Push::Fatal(error.to_string())).is_err() {
            warn!("monitor failure push dropped");
        }
    }
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn send(&mut self, msg: &MonitorUpstream) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.stream
            .write_all(&codec::encode_delimited(msg))
            .await
            .context("sending monitor update")?;

        let ack: MonitorAck = codec::read_delimited(&mut self.stream, &mut self.buf)
            .await
            .context("reading monitor acknowledgement")?
            .context("monitor closed the stream")?;
        if !ack.error.is_empty() {
            bail!("monitor rejected update: {}", ack.error);
        }
        Ok(())
    }
}

/// The reconnecting monitor task.
pub struct MonitorClient {
    address: String,
    declaration: TrackingDeclaration,
    rx: mpsc::Receiver<Push>,
}

impl MonitorClient {
    pub fn new(address: String, declaration: TrackingDeclaration) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::channel(10);
        (
            Self {
                address,
                declaration,
                rx,
            },
            MonitorHandle { tx },
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut conn: Option<Connection> = None;

        loop {
            if conn.is_none() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    attempt = self.connect() => match attempt {
                        Ok(c) => conn = Some(c),
                        Err(e) => {
                            warn!(address = %self.address, error = %e,
                                  "monitor connection failure");
                            let backoff = jittered_backoff();
                            tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(backoff) => continue,
                            }
                        }
                    },
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                push = self.rx.recv() => {
                    let Some(push) = push else { return Ok(()) };
                    let Some(c) = conn.as_mut() else { continue };

                    let (msg, close_after) = match push {
                        Push::Status { status, alarm } => (
                            MonitorUpstream {
                                declaration: None,
                                disk_status: Some(status),
                                alarms: alarm.into_iter().collect(),
                            },
                            false,
                        ),
                        Push::Fatal(description) => (
                            MonitorUpstream {
                                declaration: None,
                                disk_status: None,
                                alarms: vec![failure_alarm(AlarmStatus::On, description)],
                            },
                            true,
                        ),
                    };

                    let outcome = c.send(&msg).await;
                    if let Err(e) = &outcome {
                        warn!(error = %e, "monitor stream failure");
                    }
                    if close_after || outcome.is_err() {
                        conn = None;
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("dialing monitor at {}", self.address))?;
        let mut conn = Connection {
            stream,
            buf: BytesMut::with_capacity(1024),
        };

        conn.send(&MonitorUpstream {
            declaration: Some(self.declaration.clone()),
            disk_status: None,
            alarms: Vec::new(),
        })
        .await?;

        // A fresh registration starts with the failure alarm cleared.
        conn.send(&MonitorUpstream {
            declaration: None,
            disk_status: None,
            alarms: vec![failure_alarm(AlarmStatus::Off, String::new())],
        })
        .await?;

        info!(address = %self.address, "declared experiment to monitor");
        Ok(conn)
    }
}

fn failure_alarm(status: AlarmStatus, description: String) -> AlarmUpdate {
    AlarmUpdate {
        identification: FAILURE_ALARM.into(),
        level: AlarmLevel::Failure as i32,
        status: status as i32,
        description,
        time: Some(Timestamp::from_system_time(SystemTime::now())),
    }
}

fn jittered_backoff() -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..=2.0);
    Duration::from_secs_f64(factor)
}
