use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::bail;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/planscout/planscout.toml";
const ENV_CONFIG_PATH: &str = "PLANSCOUT_CONFIG";

/// Sampling rate is stored in parts-per-million so the hot path reads a
/// single relaxed atomic.
const PPM: u32 = 1_000_000;

/// Process-wide capture gates. All are runtime-settable before a statement
/// begins; a running statement keeps the values it started with.
pub struct Settings {
    sampling_rate_ppm: AtomicU32,
    capture_enabled: AtomicBool,
    capture_exec_stats: AtomicBool,
    capture_query_runtime: AtomicBool,
    capture_nested: AtomicBool,
    output_noisepage: AtomicBool,
}

impl Settings {
    pub fn new() -> Self {
        Self {
            sampling_rate_ppm: AtomicU32::new(0),
            capture_enabled: AtomicBool::new(false),
            capture_exec_stats: AtomicBool::new(false),
            capture_query_runtime: AtomicBool::new(false),
            capture_nested: AtomicBool::new(false),
            output_noisepage: AtomicBool::new(true),
        }
    }

    /// Per-statement probability of arming the sampling gate. Rejected at
    /// the boundary when outside [0, 1].
    pub fn set_sampling_rate(&self, rate: f64) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
            bail!("executor_sampling_rate {rate} outside [0,1]");
        }
        self.sampling_rate_ppm
            .store((rate * PPM as f64).round() as u32, Ordering::Relaxed);
        Ok(())
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate_ppm.load(Ordering::Relaxed) as f64 / PPM as f64
    }

    pub fn set_capture_enabled(&self, on: bool) {
        self.capture_enabled.store(on, Ordering::Relaxed);
    }

    /// Master gate; when false the whole pipeline is a no-op.
    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::Relaxed)
    }

    pub fn set_capture_exec_stats(&self, on: bool) {
        self.capture_exec_stats.store(on, Ordering::Relaxed);
    }

    /// Enables counter allocation and per-node persistence.
    pub fn capture_exec_stats(&self) -> bool {
        self.capture_exec_stats.load(Ordering::Relaxed)
    }

    pub fn set_capture_query_runtime(&self, on: bool) {
        self.capture_query_runtime.store(on, Ordering::Relaxed);
    }

    /// Enables whole-query elapsed-time capture.
    pub fn capture_query_runtime(&self) -> bool {
        self.capture_query_runtime.load(Ordering::Relaxed)
    }

    pub fn set_capture_nested(&self, on: bool) {
        self.capture_nested.store(on, Ordering::Relaxed);
    }

    /// When false, only the outermost executor frame persists.
    pub fn capture_nested(&self) -> bool {
        self.capture_nested.load(Ordering::Relaxed)
    }

    pub fn set_output_noisepage(&self, on: bool) {
        self.output_noisepage.store(on, Ordering::Relaxed);
    }

    /// Internal-table output versus JSON-to-log output.
    pub fn output_noisepage(&self) -> bool {
        self.output_noisepage.load(Ordering::Relaxed)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// File-level capture configuration. The path can be overridden with the
/// `PLANSCOUT_CONFIG` environment variable; a missing or unparsable file
/// yields defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default)]
    pub executor_sampling_rate: f64,
    #[serde(default)]
    pub capture_enabled: bool,
    #[serde(default)]
    pub capture_exec_stats: bool,
    #[serde(default)]
    pub capture_query_runtime: bool,
    #[serde(default)]
    pub capture_nested: bool,
    #[serde(default = "default_output_noisepage")]
    pub output_noisepage: bool,
}

fn default_output_noisepage() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            executor_sampling_rate: 0.0,
            capture_enabled: false,
            capture_exec_stats: false,
            capture_query_runtime: false,
            capture_nested: false,
            output_noisepage: default_output_noisepage(),
        }
    }
}

impl CaptureConfig {
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => CaptureConfig::default(),
        }
    }

    /// Push the file values into the live gates. The sampling rate is
    /// validated here so a bad file cannot poison the hot path.
    pub fn apply(&self, settings: &Settings) -> anyhow::Result<()> {
        settings.set_sampling_rate(self.executor_sampling_rate)?;
        settings.set_capture_enabled(self.capture_enabled);
        settings.set_capture_exec_stats(self.capture_exec_stats);
        settings.set_capture_query_runtime(self.capture_query_runtime);
        settings.set_capture_nested(self.capture_nested);
        settings.set_output_noisepage(self.output_noisepage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_rate_is_validated_at_the_boundary() {
        let settings = Settings::new();
        assert!(settings.set_sampling_rate(-0.1).is_err());
        assert!(settings.set_sampling_rate(1.1).is_err());
        assert!(settings.set_sampling_rate(f64::NAN).is_err());
        settings.set_sampling_rate(0.25).unwrap();
        assert!((settings.sampling_rate() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn bad_config_file_rejected_via_apply() {
        let settings = Settings::new();
        let config = CaptureConfig {
            executor_sampling_rate: 2.0,
            ..Default::default()
        };
        assert!(config.apply(&settings).is_err());
    }

    #[test]
    fn toml_roundtrip_with_defaults() {
        let parsed: CaptureConfig =
            toml::from_str("capture_enabled = true\nexecutor_sampling_rate = 1.0\n").unwrap();
        assert!(parsed.capture_enabled);
        assert!(!parsed.capture_exec_stats);
        assert!(parsed.output_noisepage);
        let settings = Settings::new();
        parsed.apply(&settings).unwrap();
        assert!(settings.capture_enabled());
        assert_eq!(settings.sampling_rate(), 1.0);
    }
}
