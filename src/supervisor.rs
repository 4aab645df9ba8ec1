//! Node-level supervision: one experiment at a time, membership changes
//! rejected while it runs, and the last experiment log kept for later
//! retrieval. This is the surface the remote-command layer drives.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::experiment::{run_experiment, ExperimentConfig, ExperimentEnv, ExperimentLog};
use crate::experiment::config::NodeConfiguration;
use crate::export::health::HealthMetrics;

/// User-visible failures of the supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid experiment configuration: {0}")]
    InvalidConfiguration(String),
    #[error("an experiment is already running")]
    AlreadyRunning,
    #[error("no experiment is running")]
    NotRunning,
    #[error("no experiment has completed yet")]
    NoExperimentLog,
    #[error("node {0} is already linked")]
    AlreadyLinked(String),
    #[error("node {0} is not linked")]
    NotLinked(String),
    #[error(transparent)]
    Startup(#[from] anyhow::Error),
}

/// Point-in-time view of the node.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub master: bool,
    pub master_node: String,
    pub slaves: Vec<String>,
    /// Name and start time of the running experiment, if any.
    pub experiment: Option<(String, SystemTime)>,
}

struct RunningExperiment {
    name: String,
    since: SystemTime,
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<()>>,
}

struct NodeState {
    node: NodeConfiguration,
    running: Option<RunningExperiment>,
    last_log: Option<ExperimentLog>,
}

pub struct Supervisor {
    config: Arc<Config>,
    health: Option<Arc<HealthMetrics>>,
    state: Arc<Mutex<NodeState>>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, health: Option<Arc<HealthMetrics>>) -> Self {
        let node = NodeConfiguration {
            master: config.master.clone(),
            slaves: config.slaves.clone(),
        };
        Self {
            config,
            health,
            state: Arc::new(Mutex::new(NodeState {
                node,
                running: None,
                last_log: None,
            })),
        }
    }

    /// Verifies the tracker and encoder binaries before any experiment.
    pub async fn check_binaries(&self) -> Result<()> {
        let version = tracker_version(&self.config.tracker.command).await?;
        check_version(&version, &self.config.tracker.min_version)?;

        let encoder = &self.config.encoder.command;
        let output = tokio::process::Command::new(encoder)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("could not find encoder {encoder}"))?;
        if !output.status.success() {
            bail!("encoder {encoder} -version exited with {}", output.status);
        }
        Ok(())
    }

    /// Starts an experiment from its YAML configuration.
    pub async fn start_experiment(&self, yaml: &str) -> Result<(), SupervisorError> {
        let user = ExperimentConfig::from_yaml(yaml)
            .map_err(|e| SupervisorError::InvalidConfiguration(format!("{e:#}")))?;

        self.check_binaries().await?;

        let mut state = self.state.lock();
        if state.running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut env = ExperimentEnv::new(
            Arc::clone(&self.config),
            state.node.clone(),
            user,
        )?;
        env.setup()?;

        let name = env.config.experiment_name.clone();
        let since = env.start;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let shared_state = Arc::clone(&self.state);
        let health = self.health.clone();
        let experiment_cancel = cancel.clone();
        tokio::spawn(async move {
            let log = run_experiment(env, health, experiment_cancel).await;
            {
                let mut state = shared_state.lock();
                state.last_log = Some(log);
                state.running = None;
            }
            let _ = done_tx.send(());
        });

        info!(experiment = %name, "experiment started");
        state.running = Some(RunningExperiment {
            name,
            since,
            cancel,
            done: Some(done_rx),
        });
        Ok(())
    }

    /// Stops the running experiment and waits for its teardown.
    pub async fn stop_experiment(&self) -> Result<(), SupervisorError> {
        let (cancel, done) = {
            let mut state = self.state.lock();
            let Some(running) = state.running.as_mut() else {
                return Err(SupervisorError::NotRunning);
            };
            (running.cancel.clone(), running.done.take())
        };

        cancel.cancel();
        if let Some(done) = done {
            let _ = done.await;
        }
        info!("experiment stopped");
        Ok(())
    }

    /// Adds a slave node; rejected while an experiment runs.
    pub fn link_slave(&self, name: &str) -> Result<(), SupervisorError> {
        let mut state = self.state.lock();
        if state.running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if state.node.slaves.iter().any(|s| s == name) {
            return Err(SupervisorError::AlreadyLinked(name.to_string()));
        }
        state.node.slaves.push(name.to_string());
        info!(slave = %name, "slave linked");
        Ok(())
    }

    /// Removes a slave node; rejected while an experiment runs.
    pub fn unlink_slave(&self, name: &str) -> Result<(), SupervisorError> {
        let mut state = self.state.lock();
        if state.running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let before = state.node.slaves.len();
        state.node.slaves.retain(|s| s != name);
        if state.node.slaves.len() == before {
            return Err(SupervisorError::NotLinked(name.to_string()));
        }
        info!(slave = %name, "slave unlinked");
        Ok(())
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock();
        NodeStatus {
            master: state.node.is_master(),
            master_node: state.node.master.clone(),
            slaves: state.node.slaves.clone(),
            experiment: state
                .running
                .as_ref()
                .map(|r| (r.name.clone(), r.since)),
        }
    }

    pub fn last_experiment_log(&self) -> Result<ExperimentLog, SupervisorError> {
        self.state
            .lock()
            .last_log
            .clone()
            .ok_or(SupervisorError::NoExperimentLog)
    }
}

/// Reports the tracker's version string, e.g. "v0.4.2".
async fn tracker_version(command: &str) -> Result<String> {
    let output = tokio::process::Command::new(command)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("could not get {command} version"))?;
    if !output.status.success() {
        bail!("{command} --version exited with {}", output.status);
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let text = text.trim();
    // The tracker prints "<name> vX.Y.Z".
    Ok(text
        .rsplit(' ')
        .next()
        .unwrap_or(text)
        .to_string())
}

fn parse_version(version: &str) -> Result<(u64, u64, u64)> {
    let stripped = version.trim().trim_start_matches('v');
    // Drop pre-release / build suffixes.
    let numeric = stripped
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or(stripped);

    let mut parts = numeric.split('.');
    let mut next = || -> Result<u64> {
        parts
            .next()
            .with_context(|| format!("invalid version '{version}'"))?
            .parse()
            .with_context(|| format!("invalid version '{version}'"))
    };
    Ok((next()?, next()?, next()?))
}

/// Accepts `version` when its major matches the minimum's and it is not
/// older than the minimum.
fn check_version(version: &str, minimum: &str) -> Result<()> {
    let actual = parse_version(version)?;
    let min = parse_version(minimum)?;

    if actual.0 != min.0 {
        bail!("tracker version {version} is incompatible with required {minimum}");
    }
    if (actual.1, actual.2) < (min.1, min.2) {
        bail!("tracker version {version} is older than required {minimum}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_variants() {
        assert_eq!(parse_version("v0.4.2").expect("parse"), (0, 4, 2));
        assert_eq!(parse_version("1.12.0").expect("parse"), (1, 12, 0));
        assert_eq!(parse_version("v0.5.0-dev").expect("parse"), (0, 5, 0));
        assert!(parse_version("nightly").is_err());
    }

    #[test]
    fn test_check_version_bounds() {
        assert!(check_version("v0.4.0", "v0.4.0").is_ok());
        assert!(check_version("v0.5.2", "v0.4.0").is_ok());
        assert!(check_version("v0.3.9", "v0.4.0").is_err());
        assert!(check_version("v1.0.0", "v0.4.0").is_err(), "major must match");
    }

    fn supervisor() -> Arc<Supervisor> {
        Arc::new(Supervisor::new(Arc::new(Config::default()), None))
    }

    #[test]
    fn test_link_unlink_mutate_membership() {
        let sup = supervisor();
        sup.link_slave("node-b").expect("link");
        assert!(matches!(
            sup.link_slave("node-b"),
            Err(SupervisorError::AlreadyLinked(_)),
        ));
        assert_eq!(sup.status().slaves, vec!["node-b".to_string()]);

        sup.unlink_slave("node-b").expect("unlink");
        assert!(matches!(
            sup.unlink_slave("node-b"),
            Err(SupervisorError::NotLinked(_)),
        ));
        assert!(sup.status().slaves.is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_experiment_is_a_precondition_failure() {
        let sup = supervisor();
        assert!(matches!(
            sup.stop_experiment().await,
            Err(SupervisorError::NotRunning),
        ));
    }

    #[test]
    fn test_last_log_requires_a_completed_experiment() {
        let sup = supervisor();
        assert!(matches!(
            sup.last_experiment_log(),
            Err(SupervisorError::NoExperimentLog),
        ));
    }

    #[tokio::test]
    async fn test_bad_yaml_is_invalid_configuration() {
        let sup = supervisor();
        let err = sup
            .start_experiment(": not yaml: [")
            .await
            .expect_err("bad yaml");
        assert!(matches!(err, SupervisorError::InvalidConfiguration(_)));
    }
}
