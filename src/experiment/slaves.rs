//! Slave driver: issues start/stop to the slave supervisors around the
//! local tracker's lifetime. Failures here are logged, never fatal; a
//! slave that never starts simply leaves its residue class to the
//! merger's timeout fabrication.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::wire::codec;

use super::env::ExperimentEnv;

/// Asks a slave supervisor to start tracking with the given
/// configuration.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StartRequest {
    #[prost(string, tag = "1")]
    pub yaml_configuration: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct StopRequest {}

/// One command sent to a slave supervisor.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SlaveRequest {
    #[prost(message, optional, tag = "1")]
    pub start: Option<StartRequest>,
    #[prost(message, optional, tag = "2")]
    pub stop: Option<StopRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SlaveResponse {
    #[prost(string, tag = "1")]
    pub error: String,
}

fn slave_address(name: &str, command_port: u16) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:{command_port}")
    }
}

async fn send_request(address: &str, request: &SlaveRequest) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("dialing slave {address}"))?;
    stream
        .write_all(&codec::encode_delimited(request))
        .await
        .context("sending slave request")?;

    let mut buf = BytesMut::with_capacity(256);
    let response: SlaveResponse = codec::read_delimited(&mut stream, &mut buf)
        .await
        .context("reading slave response")?
        .context("slave closed the connection")?;
    if !response.error.is_empty() {
        bail!("slave refused: {}", response.error);
    }
    Ok(())
}

/// The master configuration rewritten for one slave: same contract, the
/// slave's own producer identifier.
fn slave_configuration(env: &ExperimentEnv, name: &str) -> Result<String> {
    let mut config = env.config.clone();
    let loads = config
        .loads
        .as_mut()
        .context("configuration carries no load balancing")?;
    loads.self_id = loads
        .producers
        .get(name)
        .with_context(|| format!("no producer id assigned to {name}"))?
        .clone();
    config.to_yaml()
}

pub async fn start_slaves(env: &ExperimentEnv) {
    for name in &env.node.slaves {
        if let Err(e) = start_slave(env, name).await {
            warn!(slave = %name, error = %e, "could not start slave");
        } else {
            info!(slave = %name, "slave started");
        }
    }
}

async fn start_slave(env: &ExperimentEnv, name: &str) -> Result<()> {
    let yaml = slave_configuration(env, name)?;
    let request = SlaveRequest {
        start: Some(StartRequest {
            yaml_configuration: yaml,
        }),
        stop: None,
    };
    send_request(&slave_address(name, env.daemon.ports.command), &request).await
}

pub async fn stop_slaves(env: &ExperimentEnv) {
    for name in &env.node.slaves {
        let request = SlaveRequest {
            start: None,
            stop: Some(StopRequest {}),
        };
        let address = slave_address(name, env.daemon.ports.command);
        if let Err(e) = send_request(&address, &request).await {
            warn!(slave = %name, error = %e, "could not stop slave");
        } else {
            info!(slave = %name, "slave stopped");
        }
    }
}
