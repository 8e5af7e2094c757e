use serde::{de, Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::detector::DetectorKind;
use super::error::ConfigError;

/// How the dataset reaches the integrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Every image is already on disk
    TotalOnDisk,
    /// Images are still being collected
    Incremental,
    /// Every image has been copied to RAM disks on the compute nodes
    RamDistributed,
}

/// Image and run metadata for one rotation series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub detector: DetectorKind,
    /// Beam center in mm, as reported by the beamline
    pub beam_center_x: f64,
    pub beam_center_y: f64,
    pub distance: f64,
    pub wavelength: f64,
    pub osc_range: f64,
    #[serde(default)]
    pub two_theta: f64,
    pub start: u32,
    pub total: u32,
    /// Exposure time per image in seconds
    pub exposure_time: f64,
    pub directory: PathBuf,
    pub image_prefix: String,
    pub run_number: u32,
    /// Overrides the detector's default naming, e.g. `lyso_1_????.cbf`
    #[serde(default)]
    pub image_template: Option<String>,
}

/// One compute node holding a contiguous slice of the images in RAM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamNode {
    pub name: String,
    pub first: u32,
    pub last: u32,
}

impl RamNode {
    pub fn image_count(&self) -> u32 {
        self.last - self.first + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RamStaging {
    pub nodes: Vec<RamNode>,
    /// Remove the staged copies from every node once finished
    #[serde(default, deserialize_with = "flexible_bool")]
    pub cleanup: bool,
}

/// What the user asked for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub spacegroup: Option<String>,
    #[serde(default)]
    pub resolution_low: Option<f64>,
    #[serde(default)]
    pub resolution_high: Option<f64>,
    #[serde(default = "default_signal_to_noise")]
    pub target_signal_to_noise: f64,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub use_cluster: bool,
    #[serde(default)]
    pub ram: Option<RamStaging>,
    #[serde(default = "default_true", deserialize_with = "flexible_bool")]
    pub cleanup: bool,
    /// Index from two short spot ranges instead of the whole sweep
    #[serde(default, deserialize_with = "flexible_bool")]
    pub restricted_spot_search: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            spacegroup: None,
            resolution_low: None,
            resolution_high: None,
            target_signal_to_noise: default_signal_to_noise(),
            use_cluster: false,
            ram: None,
            cleanup: true,
            restricted_spot_search: false,
        }
    }
}

/// Site values describing how and where the tools run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub xds_program: String,
    pub local_jobs: u32,
    pub local_processors: u32,
    pub cluster_jobs: u32,
    pub cluster_processors: u32,
    /// Blocking submission command the tool command line is appended to.
    /// `{log}` is replaced by the path of the tool's log file.
    pub cluster_submit: Vec<String>,
    /// Replaces the detector's slack when waiting for the next image
    #[serde(default)]
    pub image_wait_slack: Option<f64>,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            xds_program: String::from("xds_par"),
            local_jobs: 4,
            local_processors: 4,
            cluster_jobs: 20,
            cluster_processors: 8,
            cluster_submit: vec![
                String::from("qsub"),
                String::from("-sync"),
                String::from("y"),
                String::from("-cwd"),
                String::from("-j"),
                String::from("y"),
                String::from("-o"),
                String::from("{log}"),
                String::from("-q"),
                String::from("phase2.q"),
                String::from("-b"),
                String::from("y"),
            ],
            image_wait_slack: None,
            poll_interval_ms: default_poll_ms(),
        }
    }
}

/// Structure representing one integration request. Contains pathing, run and processing information.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub command: CommandKind,
    pub work_directory: PathBuf,
    pub detector_defaults_directory: PathBuf,
    pub run: RunInfo,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub execution: Execution,
}

impl Default for Config {
    /// Generate a new Config object. Paths will be empty/invalid
    fn default() -> Self {
        Self {
            command: CommandKind::Incremental,
            work_directory: PathBuf::from("None"),
            detector_defaults_directory: PathBuf::from("None"),
            run: RunInfo {
                detector: DetectorKind::Pilatus,
                beam_center_x: 0.0,
                beam_center_y: 0.0,
                distance: 0.0,
                wavelength: 1.0,
                osc_range: 0.1,
                two_theta: 0.0,
                start: 1,
                total: 0,
                exposure_time: 1.0,
                directory: PathBuf::from("None"),
                image_prefix: String::from(""),
                run_number: 1,
                image_template: None,
            },
            preferences: Preferences::default(),
            execution: Execution::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Reject requests that can never be processed
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.total == 0 {
            return Err(ConfigError::Invalid(String::from("total image count is zero")));
        }
        if self.run.wavelength <= 0.0 || self.run.distance <= 0.0 {
            return Err(ConfigError::Invalid(String::from(
                "wavelength and distance must be positive",
            )));
        }
        if self.preferences.target_signal_to_noise <= 0.0 {
            return Err(ConfigError::Invalid(String::from(
                "target signal/noise must be positive",
            )));
        }
        if self.command == CommandKind::RamDistributed {
            let staging = self.preferences.ram.as_ref().ok_or_else(|| {
                ConfigError::Invalid(String::from("ram_distributed requires a node assignment"))
            })?;
            if staging.nodes.is_empty() {
                return Err(ConfigError::Invalid(String::from("RAM node list is empty")));
            }
            let mut previous_last: Option<u32> = None;
            for node in staging.nodes.iter() {
                if node.last < node.first {
                    return Err(ConfigError::Invalid(format!(
                        "node {} has an inverted image range",
                        node.name
                    )));
                }
                if previous_last.is_some_and(|last| node.first <= last) {
                    return Err(ConfigError::Invalid(format!(
                        "node {} overlaps the previous node",
                        node.name
                    )));
                }
                previous_last = Some(node.last);
            }
        }
        Ok(())
    }

    /// Is the data staged in RAM on the compute nodes
    pub fn uses_ram(&self) -> bool {
        self.command == CommandKind::RamDistributed && self.preferences.ram.is_some()
    }

    pub fn ram_nodes(&self) -> &[RamNode] {
        match &self.preferences.ram {
            Some(staging) if self.uses_ram() => &staging.nodes,
            _ => &[],
        }
    }

    pub fn ram_cleanup(&self) -> bool {
        self.uses_ram() && self.preferences.ram.as_ref().is_some_and(|r| r.cleanup)
    }

    /// Number of parallel jobs XDS may start
    pub fn xds_jobs(&self) -> u32 {
        if self.uses_ram() {
            self.ram_nodes().len() as u32
        } else if self.preferences.use_cluster {
            self.execution.cluster_jobs
        } else {
            self.execution.local_jobs
        }
    }

    /// Number of processors each XDS job may use
    pub fn xds_processors(&self) -> u32 {
        if self.uses_ram() || self.preferences.use_cluster {
            self.execution.cluster_processors
        } else {
            self.execution.local_processors
        }
    }

    /// Longest wait for the next image before the collection is considered aborted
    pub fn image_wait_timeout(&self) -> Duration {
        let slack = self
            .execution
            .image_wait_slack
            .unwrap_or(self.run.detector.wait_slack_seconds() as f64);
        Duration::from_secs_f64(self.run.exposure_time.max(0.0).ceil() + slack.max(0.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.execution.poll_interval_ms)
    }

    /// Directory holding the deliverables, named after the run
    pub fn results_name(&self) -> String {
        format!("{}_{}", self.run.image_prefix, self.run.run_number)
    }
}

fn default_signal_to_noise() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_poll_ms() -> u64 {
    super::constants::IMAGE_POLL_INTERVAL_MS
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrText {
    Bool(bool),
    Text(String),
}

/// Accept real booleans as well as the "True"/"False" strings some control layers send
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BoolOrText::deserialize(deserializer)? {
        BoolOrText::Bool(b) => Ok(b),
        BoolOrText::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            other => Err(de::Error::custom(format!("not a boolean: {other}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
command: ram_distributed
work_directory: /tmp/work
detector_defaults_directory: /tmp/defaults
run:
  detector: PILATUS
  beam_center_x: 215.1
  beam_center_y: 211.2
  distance: 380.0
  wavelength: 0.9999
  osc_range: 0.1
  start: 1
  total: 900
  exposure_time: 1.0
  directory: /data/lyso
  image_prefix: lysozym-1
  run_number: 1
preferences:
  spacegroup: P41212
  use_cluster: "True"
  cleanup: "False"
  ram:
    cleanup: "True"
    nodes:
      - { name: compute-0-1, first: 1, last: 450 }
      - { name: compute-0-2, first: 451, last: 900 }
"#;

    #[test]
    fn test_string_booleans_are_normalized() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert!(config.preferences.use_cluster);
        assert!(!config.preferences.cleanup);
        assert!(config.ram_cleanup());
        assert_eq!(config.xds_jobs(), 2);
        assert_eq!(config.xds_processors(), 8);
        assert_eq!(config.preferences.target_signal_to_noise, 1.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_boolean_is_rejected() {
        let text = EXAMPLE.replace("\"True\"\n  cleanup", "\"maybe\"\n  cleanup");
        assert!(serde_yaml::from_str::<Config>(&text).is_err());
    }

    #[test]
    fn test_overlapping_nodes_fail_validation() {
        let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        if let Some(ram) = config.preferences.ram.as_mut() {
            ram.nodes[1].first = 400;
        }
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_wait_timeout_uses_detector_slack() {
        let mut config = Config::default();
        config.run.exposure_time = 0.4;
        assert_eq!(config.image_wait_timeout(), Duration::from_secs(16));
        config.run.detector = DetectorKind::Adsc;
        assert_eq!(config.image_wait_timeout(), Duration::from_secs(61));
        config.execution.image_wait_slack = Some(0.5);
        assert_eq!(config.image_wait_timeout(), Duration::from_secs_f64(1.5));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::read_config_file(Path::new("/definitely/not/here.yml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }
}
