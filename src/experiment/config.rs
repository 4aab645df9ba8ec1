//! Per-experiment configuration: the YAML document a start request
//! carries, merged over node defaults and frozen for the duration of the
//! experiment.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::merge::WorkloadBalance;

/// Experiment name marking a test run whose data is discarded.
pub const TEST_MODE_NAME: &str = "TEST-MODE";

/// This node's tracking role: master when no master node is named.
#[derive(Clone, Debug, Default)]
pub struct NodeConfiguration {
    /// Name of the master node; empty on the master itself.
    pub master: String,
    /// Slave node addresses, in residue order.
    pub slaves: Vec<String>,
}

impl NodeConfiguration {
    pub fn is_master(&self) -> bool {
        self.master.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Experiment name; empty or "TEST-MODE" marks a discardable test run.
    #[serde(default)]
    pub experiment_name: String,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    /// Worker threads for the tracker; 0 lets the tracker decide.
    #[serde(default)]
    pub threads: Option<u32>,

    /// Workload distribution; generated on the master, received verbatim
    /// on slaves.
    #[serde(default)]
    pub loads: Option<LoadBalancing>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub fps: Option<f64>,
    /// Still images standing in for a live camera, for test rigs.
    #[serde(default)]
    pub stub_paths: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Monitoring / streaming destination host; empty disables both.
    pub host: Option<String>,
    pub bitrate_kb: Option<u32>,
    pub bitrate_max_ratio: Option<f64>,
    pub quality: Option<String>,
    pub tune: Option<String>,
    pub channel: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    pub family: Option<String>,
    #[serde(default)]
    pub quad: QuadConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QuadConfig {
    pub decimate: Option<f64>,
    pub sigma: Option<f64>,
    pub refine_edges: Option<bool>,
    pub min_cluster_pixel: Option<i64>,
    pub max_n_maxima: Option<i64>,
    pub critical_radian: Option<f64>,
    pub max_line_mse: Option<f64>,
    pub min_bw_diff: Option<i64>,
    pub deglitch: Option<bool>,
}

/// The frame-id partition contract distributed with the configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancing {
    /// Producer identifier of the receiving node.
    pub self_id: String,
    /// Producer identifier per node name ("localhost" for the master).
    pub producers: HashMap<String, String>,
    /// Owning producer per residue.
    pub assignments: HashMap<usize, String>,
    /// Camera resolution shared with slaves, when known.
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
}

impl ExperimentConfig {
    /// The built-in defaults a user configuration is merged over.
    pub fn defaults() -> Self {
        Self {
            experiment_name: String::new(),
            camera: CameraConfig {
                fps: Some(8.0),
                stub_paths: Some(Vec::new()),
            },
            stream: StreamConfig {
                host: Some(String::new()),
                bitrate_kb: Some(2000),
                bitrate_max_ratio: Some(1.5),
                quality: Some("fast".into()),
                tune: Some("film".into()),
                channel: Some("olympus".into()),
            },
            detection: DetectionConfig {
                family: None,
                quad: QuadConfig {
                    decimate: Some(1.0),
                    sigma: Some(0.0),
                    refine_edges: Some(false),
                    min_cluster_pixel: Some(25),
                    max_n_maxima: Some(10),
                    critical_radian: Some(0.17453),
                    max_line_mse: Some(10.0),
                    min_bw_diff: Some(50),
                    deglitch: Some(false),
                },
            },
            threads: Some(0),
            loads: None,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing experiment configuration")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing experiment configuration")
    }

    /// Overlays every set field of `user` onto `self`.
    pub fn merge(&mut self, user: ExperimentConfig) {
        if !user.experiment_name.is_empty() {
            self.experiment_name = user.experiment_name;
        }
        merge_opt(&mut self.camera.fps, user.camera.fps);
        merge_opt(&mut self.camera.stub_paths, user.camera.stub_paths);
        merge_opt(&mut self.stream.host, user.stream.host);
        merge_opt(&mut self.stream.bitrate_kb, user.stream.bitrate_kb);
        merge_opt(
            &mut self.stream.bitrate_max_ratio,
            user.stream.bitrate_max_ratio,
        );
        merge_opt(&mut self.stream.quality, user.stream.quality);
        merge_opt(&mut self.stream.tune, user.stream.tune);
        merge_opt(&mut self.stream.channel, user.stream.channel);
        merge_opt(&mut self.detection.family, user.detection.family);
        merge_opt(&mut self.detection.quad.decimate, user.detection.quad.decimate);
        merge_opt(&mut self.detection.quad.sigma, user.detection.quad.sigma);
        merge_opt(
            &mut self.detection.quad.refine_edges,
            user.detection.quad.refine_edges,
        );
        merge_opt(
            &mut self.detection.quad.min_cluster_pixel,
            user.detection.quad.min_cluster_pixel,
        );
        merge_opt(
            &mut self.detection.quad.max_n_maxima,
            user.detection.quad.max_n_maxima,
        );
        merge_opt(
            &mut self.detection.quad.critical_radian,
            user.detection.quad.critical_radian,
        );
        merge_opt(
            &mut self.detection.quad.max_line_mse,
            user.detection.quad.max_line_mse,
        );
        merge_opt(
            &mut self.detection.quad.min_bw_diff,
            user.detection.quad.min_bw_diff,
        );
        merge_opt(&mut self.detection.quad.deglitch, user.detection.quad.deglitch);
        merge_opt(&mut self.threads, user.threads);
        merge_opt(&mut self.loads, user.loads);
    }

    /// Verifies that merging left no field unset.
    pub fn check_all_fields_set(&self) -> Result<()> {
        fn require<T>(field: &Option<T>, name: &str) -> Result<()> {
            if field.is_none() {
                bail!("incomplete tracking configuration: {name} is not set");
            }
            Ok(())
        }

        require(&self.camera.fps, "camera.fps")?;
        require(&self.stream.bitrate_kb, "stream.bitrate_kb")?;
        require(&self.stream.bitrate_max_ratio, "stream.bitrate_max_ratio")?;
        require(&self.stream.quality, "stream.quality")?;
        require(&self.stream.tune, "stream.tune")?;
        require(&self.detection.family, "detection.family")?;
        require(&self.loads, "loads")?;

        let fps = self.camera.fps.expect("checked above");
        if fps <= 0.0 {
            bail!("camera.fps must be positive, got {fps}");
        }
        Ok(())
    }

    pub fn fps(&self) -> f64 {
        self.camera.fps.unwrap_or(8.0)
    }

    /// The experiment's workload contract, from the distributed loads.
    pub fn workload_balance(&self) -> Result<WorkloadBalance> {
        let loads = self
            .loads
            .as_ref()
            .context("configuration carries no load balancing")?;

        let master_id = loads
            .producers
            .get("localhost")
            .context("load balancing names no localhost producer")?
            .clone();

        let stride = loads.assignments.len();
        let mut residues: HashMap<String, Vec<bool>> = HashMap::new();
        for (&residue, producer) in &loads.assignments {
            if residue >= stride {
                bail!("residue {residue} outside of stride {stride}");
            }
            residues
                .entry(producer.clone())
                .or_insert_with(|| vec![false; stride])[residue] = true;
        }

        let mut balance = WorkloadBalance::new(self.fps(), stride, master_id, residues);
        balance.check()?;
        Ok(balance)
    }
}

fn merge_opt<T>(target: &mut Option<T>, user: Option<T>) {
    if user.is_some() {
        *target = user;
    }
}

fn new_producer_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32],
    )
}

/// Builds the workload distribution for this node's producers: residue 0
/// belongs to the master, residue i+1 to slave i.
pub fn generate_load_balancing(node: &NodeConfiguration) -> LoadBalancing {
    if node.slaves.is_empty() {
        let mut producers = HashMap::new();
        producers.insert("localhost".to_string(), "single-node".to_string());
        let mut assignments = HashMap::new();
        assignments.insert(0, "single-node".to_string());
        return LoadBalancing {
            self_id: "single-node".into(),
            producers,
            assignments,
            width: 0,
            height: 0,
        };
    }

    let self_id = new_producer_id();
    let mut producers = HashMap::new();
    let mut assignments = HashMap::new();
    producers.insert("localhost".to_string(), self_id.clone());
    assignments.insert(0, self_id.clone());

    for (i, slave) in node.slaves.iter().enumerate() {
        let id = new_producer_id();
        producers.insert(slave.clone(), id.clone());
        assignments.insert(i + 1, id);
    }

    LoadBalancing {
        self_id,
        producers,
        assignments,
        width: 0,
        height: 0,
    }
}

/// Finalizes a user configuration for this node: defaults merged in,
/// load balancing generated on the master, completeness verified.
pub fn finalize(user: ExperimentConfig, node: &NodeConfiguration) -> Result<ExperimentConfig> {
    let mut config = ExperimentConfig::defaults();
    config.merge(user);

    if node.is_master() {
        let mut loads = generate_load_balancing(node);
        if let Some(user_loads) = &config.loads {
            loads.width = user_loads.width;
            loads.height = user_loads.height;
        }
        config.loads = Some(loads);
    }

    config.check_all_fields_set()?;
    Ok(config)
}
