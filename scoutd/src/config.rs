use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/planscout/scoutd.toml";
const ENV_CONFIG_PATH: &str = "SCOUTD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

impl Config {
    /// Load configuration. An explicit path wins, then the `SCOUTD_CONFIG`
    /// environment variable, then the default location. A missing or
    /// unparsable file yields defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(
                std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
            ),
        };
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            outdir: default_outdir(),
        }
    }
}

fn default_outdir() -> PathBuf {
    PathBuf::from("/var/lib/planscout")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Explicit collector object path; otherwise the install/build
    /// candidates are searched.
    #[serde(default)]
    pub bpf_object: Option<PathBuf>,
    /// Override for the OU catalog header; otherwise the shipped catalog.
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
    #[serde(default = "default_metrics_log_secs")]
    pub metrics_log_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bpf_object: None,
            schema_path: None,
            metrics_log_secs: default_metrics_log_secs(),
        }
    }
}

fn default_metrics_log_secs() -> u64 {
    10
}
