//! Per-experiment environment: directory layout, tracker command
//! construction and the final experiment log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::Config;
use crate::disk::{disk_size, ByteRateEstimator};
use crate::fsutil::filename_without_overwrite;
use crate::units::byte_size;
use crate::video::VideoConfig;

use super::config::{finalize, ExperimentConfig, NodeConfiguration, TEST_MODE_NAME};

/// Name of the frozen configuration written into the experiment
/// directory.
const FINAL_CONFIG_NAME: &str = "final-config.yaml";

/// Produced when an experiment tears down.
#[derive(Clone, Debug)]
pub struct ExperimentLog {
    pub has_error: bool,
    pub error: String,
    pub experiment_dir: String,
    pub start: SystemTime,
    pub end: SystemTime,
    pub yaml_configuration: String,
    pub log: String,
    pub stderr: String,
}

/// All state of one running experiment on this node.
pub struct ExperimentEnv {
    pub daemon: Arc<Config>,
    pub node: NodeConfiguration,
    pub config: ExperimentConfig,
    pub test_mode: bool,
    pub experiment_dir: PathBuf,
    pub start: SystemTime,
    pub free_start_bytes: i64,
}

impl ExperimentEnv {
    pub fn new(
        daemon: Arc<Config>,
        node: NodeConfiguration,
        user: ExperimentConfig,
    ) -> Result<Self> {
        let mut config = finalize(user, &node)?;

        let test_mode =
            config.experiment_name.is_empty() || config.experiment_name == TEST_MODE_NAME;
        if test_mode {
            config.experiment_name = TEST_MODE_NAME.to_string();
        }

        let destination = if test_mode {
            std::env::temp_dir().join("trackd-tests")
        } else {
            daemon.data_dir.clone()
        };
        std::fs::create_dir_all(&destination)
            .with_context(|| format!("creating {}", destination.display()))?;
        let (experiment_dir, _) =
            filename_without_overwrite(&destination.join(&config.experiment_name))
                .context("instantiating experiment directory")?;

        Ok(Self {
            daemon,
            node,
            config,
            test_mode,
            experiment_dir,
            start: SystemTime::UNIX_EPOCH,
            free_start_bytes: 0,
        })
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.experiment_dir.join(name)
    }

    fn tracker_basename(&self) -> String {
        Path::new(&self.daemon.tracker.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.daemon.tracker.command.clone())
    }

    pub fn tracker_info_path(&self) -> PathBuf {
        self.path(format!("{}.INFO", self.tracker_basename()))
    }

    pub fn tracker_stderr_path(&self) -> PathBuf {
        self.path(format!("{}.stderr", self.tracker_basename()))
    }

    fn new_detections_dir(&self) -> PathBuf {
        self.path("detections")
    }

    /// SIGINT → SIGKILL latency for supervised children.
    pub fn killing_grace(&self) -> Duration {
        let from_fps = Duration::from_secs_f64(2.0 / self.config.fps());
        from_fps.max(Duration::from_millis(500))
    }

    /// The tracker's command line for this node's role.
    pub fn tracker_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        let target_host = if self.node.is_master() {
            "localhost".to_string()
        } else {
            self.node.master.clone()
        };

        if let Some(stubs) = &self.config.camera.stub_paths {
            if !stubs.is_empty() {
                args.push("--stub-image-paths".into());
                args.push(stubs.join(","));
            }
        }

        if self.test_mode {
            args.push("--test-mode".into());
        }

        args.push("--host".into());
        args.push(target_host);
        args.push("--port".into());
        args.push(self.daemon.ports.frames.to_string());

        let loads = self.config.loads.as_ref();
        if let Some(loads) = loads {
            args.push("--uuid".into());
            args.push(loads.self_id.clone());
        }

        if let Some(threads) = self.config.threads {
            if threads > 0 {
                args.push("--number-threads".into());
                args.push(threads.to_string());
            }
        }

        args.push("--camera-fps".into());
        args.push(format!("{:.6}", self.config.fps()));

        let quad = &self.config.detection.quad;
        if let Some(family) = &self.config.detection.family {
            args.push("--at-family".into());
            args.push(family.clone());
        }
        if let Some(decimate) = quad.decimate {
            args.push("--at-quad-decimate".into());
            args.push(format!("{decimate:.6}"));
        }
        if let Some(sigma) = quad.sigma {
            args.push("--at-quad-sigma".into());
            args.push(format!("{sigma:.6}"));
        }
        if quad.refine_edges == Some(true) {
            args.push("--at-refine-edges".into());
        }
        if let Some(min_cluster) = quad.min_cluster_pixel {
            args.push("--at-quad-min-cluster".into());
            args.push(min_cluster.to_string());
        }
        if let Some(max_n_maxima) = quad.max_n_maxima {
            args.push("--at-quad-max-n-maxima".into());
            args.push(max_n_maxima.to_string());
        }
        if let Some(critical) = quad.critical_radian {
            args.push("--at-quad-critical-radian".into());
            args.push(format!("{critical:.6}"));
        }
        if let Some(mse) = quad.max_line_mse {
            args.push("--at-quad-max-line-mse".into());
            args.push(format!("{mse:.6}"));
        }
        if let Some(diff) = quad.min_bw_diff {
            args.push("--at-quad-min-bw-diff".into());
            args.push(diff.to_string());
        }
        if quad.deglitch == Some(true) {
            args.push("--at-quad-deglitch".into());
        }

        if self.node.is_master() {
            args.push("--video-output-to-stdout".into());
            args.push("--video-output-height".into());
            args.push("1080".into());
            args.push("--video-output-add-header".into());
            args.push("--new-ant-output-dir".into());
            args.push(self.new_detections_dir().to_string_lossy().into_owned());
        } else if let Some(loads) = loads {
            args.push("--camera-slave-width".into());
            args.push(loads.width.to_string());
            args.push("--camera-slave-height".into());
            args.push(loads.height.to_string());
        }

        args.push("--log-output-dir".into());
        args.push(self.experiment_dir.to_string_lossy().into_owned());

        if let Some(loads) = loads {
            if loads.producers.len() > 1 {
                let stride = loads.assignments.len();
                args.push("--frame-stride".into());
                args.push(stride.to_string());

                let mut ids: Vec<String> = loads
                    .assignments
                    .iter()
                    .filter(|(_, producer)| **producer == loads.self_id)
                    .map(|(residue, _)| residue.to_string())
                    .collect();
                ids.sort();
                args.push("--frame-ids".into());
                args.push(ids.join(","));
            }
        }

        args
    }

    /// The video pipeline configuration for this experiment.
    pub fn video_config(&self) -> VideoConfig {
        let stream = &self.config.stream;
        let bitrate = stream.bitrate_kb.unwrap_or(2000);
        let ratio = stream.bitrate_max_ratio.unwrap_or(1.5);
        let destination = stream.host.clone().filter(|h| !h.is_empty());

        VideoConfig {
            encoder_command: self.daemon.encoder.command.clone(),
            base_dir: self.experiment_dir.clone(),
            hostname: hostname(),
            fps: self.config.fps(),
            period: Duration::from_secs(2 * 3600),
            bitrate_kb: bitrate,
            max_bitrate_kb: (bitrate as f64 * ratio) as u32,
            destination,
            channel: stream.channel.clone().unwrap_or_else(|| "olympus".into()),
            preset: stream.quality.clone().unwrap_or_else(|| "fast".into()),
            tune: stream.tune.clone().unwrap_or_else(|| "film".into()),
        }
    }

    /// Address of the monitoring service, when a stream host is set.
    pub fn monitor_address(&self) -> Option<String> {
        let host = self.config.stream.host.as_deref().filter(|h| !h.is_empty())?;
        Some(format!("{host}:{}", self.daemon.ports.monitor))
    }

    /// Creates the experiment directory tree, freezes the configuration
    /// on disk and seeds disk accounting. Fails before the tracker ever
    /// starts when the disk is already under the limit.
    pub fn setup(&mut self) -> Result<()> {
        let target = if self.node.is_master() {
            self.new_detections_dir()
        } else {
            self.experiment_dir.clone()
        };
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating {}", target.display()))?;

        let yaml = self.config.to_yaml()?;
        std::fs::write(self.path(FINAL_CONFIG_NAME), &yaml)
            .context("saving final configuration")?;

        let command_line = std::iter::once(self.daemon.tracker.command.clone())
            .chain(self.tracker_args())
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(
            self.path(format!("{}.cmd", self.tracker_basename())),
            command_line + "\n",
        )
        .context("saving tracker command")?;

        let (free, _) = disk_size(&self.experiment_dir)?;
        if free < self.daemon.disk.limit_bytes {
            bail!(
                "insufficient disk space: available: {} minimum: {}",
                byte_size(free),
                byte_size(self.daemon.disk.limit_bytes),
            );
        }

        self.free_start_bytes = free;
        self.start = SystemTime::now();
        info!(dir = %self.experiment_dir.display(), "experiment directory ready");
        Ok(())
    }

    /// The write-rate estimator seeded at setup time.
    pub fn rate_estimator(&self) -> ByteRateEstimator {
        ByteRateEstimator::new(self.free_start_bytes, self.start)
    }

    /// Builds the experiment log and removes test-run data.
    pub fn teardown(&self, error: Option<&anyhow::Error>) -> ExperimentLog {
        let log = self.build_log(error);
        if self.test_mode {
            let _ = std::fs::remove_dir_all(&self.experiment_dir);
        }
        log
    }

    fn build_log(&self, error: Option<&anyhow::Error>) -> ExperimentLog {
        let read_or_note = |path: PathBuf| -> String {
            match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => format!("\ncould not read {}: {e}", path.display()),
            }
        };

        let yaml = self
            .config
            .to_yaml()
            .unwrap_or_else(|e| format!("could not generate yaml config: {e}"));

        ExperimentLog {
            has_error: error.is_some(),
            error: error.map(|e| format!("{e:#}")).unwrap_or_default(),
            experiment_dir: self
                .experiment_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            start: self.start,
            end: SystemTime::now(),
            yaml_configuration: yaml,
            log: read_or_note(self.tracker_info_path()),
            stderr: read_or_note(self.tracker_stderr_path()),
        }
    }
}

/// This node's hostname, for stream URLs and monitor declarations.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes at most buf.len() bytes and
    // NUL-terminates within that bound on Linux.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "unknown".into();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::config::DetectionConfig;

    fn daemon_config(dir: &Path) -> Arc<Config> {
        Arc::new(Config {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    fn user_config(name: &str) -> ExperimentConfig {
        ExperimentConfig {
            experiment_name: name.into(),
            detection: DetectionConfig {
                family: Some("36h11".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_name_enables_test_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration::default(),
            user_config(""),
        )
        .expect("env");

        assert!(env.test_mode);
        assert_eq!(env.config.experiment_name, TEST_MODE_NAME);
        assert!(!env.experiment_dir.starts_with(dir.path()));
    }

    #[test]
    fn test_setup_freezes_config_and_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration::default(),
            user_config("colony-12"),
        )
        .expect("env");

        env.setup().expect("setup");

        assert!(env.path(FINAL_CONFIG_NAME).exists());
        let cmd = std::fs::read_to_string(env.path("artemis.cmd")).expect("command file");
        assert!(cmd.starts_with("artemis "), "{cmd}");
        assert!(cmd.contains("--video-output-to-stdout"), "{cmd}");
        assert!(env.free_start_bytes > 0);
    }

    #[test]
    fn test_experiment_dirs_never_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = daemon_config(dir.path());

        let mut first = ExperimentEnv::new(
            Arc::clone(&daemon),
            NodeConfiguration::default(),
            user_config("colony-12"),
        )
        .expect("env");
        first.setup().expect("setup");

        let second = ExperimentEnv::new(
            daemon,
            NodeConfiguration::default(),
            user_config("colony-12"),
        )
        .expect("env");

        assert_ne!(first.experiment_dir, second.experiment_dir);
        assert!(second
            .experiment_dir
            .to_string_lossy()
            .contains("colony-12.0001"));
    }

    #[test]
    fn test_slave_args_differ_from_master_args() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut user = user_config("colony-12");
        user.loads = Some(crate::experiment::config::generate_load_balancing(
            &NodeConfiguration {
                master: String::new(),
                slaves: vec!["node-b".into()],
            },
        ));

        let master_env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration {
                master: String::new(),
                slaves: vec!["node-b".into()],
            },
            user.clone(),
        )
        .expect("env");
        let master_args = master_env.tracker_args();
        assert!(master_args.contains(&"--video-output-to-stdout".to_string()));
        assert!(master_args.contains(&"--frame-stride".to_string()));

        let slave_env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration {
                master: "node-a".into(),
                slaves: Vec::new(),
            },
            user,
        )
        .expect("env");
        let slave_args = slave_env.tracker_args();
        assert!(!slave_args.contains(&"--video-output-to-stdout".to_string()));
        assert!(slave_args.contains(&"--camera-slave-width".to_string()));
        let host_at = slave_args
            .iter()
            .position(|a| a == "--host")
            .expect("--host");
        assert_eq!(slave_args[host_at + 1], "node-a");
    }

    #[test]
    fn test_teardown_reports_error_and_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration::default(),
            user_config("colony-12"),
        )
        .expect("env");
        env.setup().expect("setup");

        std::fs::write(env.tracker_info_path(), "I0001 tracking started\n").expect("info");
        std::fs::write(env.tracker_stderr_path(), "").expect("stderr");

        let failure = anyhow::anyhow!("tracker exited with status 1");
        let log = env.teardown(Some(&failure));
        assert!(log.has_error);
        assert!(log.error.contains("status 1"));
        assert_eq!(log.experiment_dir, "colony-12.0000");
        assert!(log.log.contains("tracking started"));
        assert!(log.yaml_configuration.contains("colony-12"));
    }

    #[test]
    fn test_killing_grace_scales_with_slow_cameras() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut user = user_config("x");
        user.camera.fps = Some(1.0);
        let env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration::default(),
            user,
        )
        .expect("env");
        assert_eq!(env.killing_grace(), Duration::from_secs(2));

        let mut user = user_config("y");
        user.camera.fps = Some(100.0);
        let env = ExperimentEnv::new(
            daemon_config(dir.path()),
            NodeConfiguration::default(),
            user,
        )
        .expect("env");
        assert_eq!(env.killing_grace(), Duration::from_millis(500));
    }
}
