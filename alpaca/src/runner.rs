//! Conformance runner
//!
//! Loads the runner configuration, opens the device under test and drives one
//! conformance run, connecting before and disconnecting after.

use crate::{AlpacaDevice, AlpacaError, AlpacaTelescope, RetryConfig, TimeoutConfig, ALPACA_DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use telescope_conform::{
    ConformError, ConformanceTester, Reporter, RunSummary, SimulatedTelescope, SimulatorConfig, Telescope,
    TelescopeSettings,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Alpaca(#[from] AlpacaError),

    #[error(transparent)]
    Conform(#[from] ConformError),
}

/// Which device the run talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeviceTarget {
    Alpaca {
        base_url: String,
        #[serde(default)]
        device_number: u32,
    },
    Simulator {
        #[serde(default)]
        simulator: SimulatorConfig,
    },
}

impl Default for DeviceTarget {
    fn default() -> Self {
        DeviceTarget::Alpaca {
            base_url: format!("http://localhost:{}", ALPACA_DEFAULT_PORT),
            device_number: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub device: DeviceTarget,
    /// Directory for daily rolling log files; console only when absent
    pub log_dir: Option<PathBuf>,
    pub settings: TelescopeSettings,
}

impl RunnerConfig {
    pub fn from_json(json: &str) -> Result<Self, RunnerError> {
        let config: RunnerConfig = serde_json::from_str(json).map_err(|e| RunnerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if let DeviceTarget::Alpaca { base_url, .. } = &self.device {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(RunnerError::Config(format!(
                    "base_url must start with http:// or https://, got '{}'",
                    base_url
                )));
            }
        }
        self.settings.validate()?;
        Ok(())
    }

    /// Build the device described by the configuration
    pub fn open_device(&self) -> Result<Box<dyn Telescope>, RunnerError> {
        match &self.device {
            DeviceTarget::Alpaca { base_url, device_number } => {
                let device = AlpacaDevice::new(base_url.clone(), *device_number);
                tracing::info!("Testing {}", device);
                let timeouts = TimeoutConfig::for_slew_budget(self.settings.maximum_slew_time_secs.ceil() as u64);
                Ok(Box::new(AlpacaTelescope::with_config(
                    device,
                    timeouts,
                    RetryConfig::default(),
                )?))
            }
            DeviceTarget::Simulator { simulator } => {
                tracing::info!("Testing the built-in simulator");
                Ok(Box::new(SimulatedTelescope::new(simulator.clone())))
            }
        }
    }
}

/// Connect, run every phase and disconnect.
///
/// `shutdown` resolving cancels the run; the post-run safety steps still execute.
pub async fn run_conformance<F>(
    device: &dyn Telescope,
    settings: &TelescopeSettings,
    reporter: &dyn Reporter,
    shutdown: F,
) -> Result<RunSummary, RunnerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    device
        .set_connected(true)
        .await
        .map_err(|source| ConformError::Device {
            member: "Connected".to_string(),
            source,
        })?;

    let tester = ConformanceTester::new(device, settings, reporter);
    let cancel = tester.cancellation_token();
    let watcher = tokio::spawn(async move {
        shutdown.await;
        tracing::warn!("Cancellation requested");
        cancel.store(true, Ordering::Relaxed);
    });

    let summary = tester.run().await;
    watcher.abort();

    if let Err(e) = device.set_connected(false).await {
        tracing::warn!("Failed to disconnect: {}", e);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telescope_conform::{Outcome, RecordingReporter};

    const FAST_SIMULATOR_RUN: &str = r#"{
        "device": { "mode": "simulator", "simulator": { "slew_duration_ms": 50 } },
        "settings": {
            "maximum_slew_time_secs": 5.0,
            "slew_minimum_duration_secs": 0.0,
            "time_for_slewing_to_become_false_secs": 1.0,
            "poll_interval_ms": 10,
            "pulse_guide_duration_ms": 200
        }
    }"#;

    #[test]
    fn test_default_config_targets_local_alpaca_server() {
        let config = RunnerConfig::from_json("{}").unwrap();
        assert_eq!(
            config.device,
            DeviceTarget::Alpaca {
                base_url: "http://localhost:11111".to_string(),
                device_number: 0
            }
        );
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_alpaca_target_parses() {
        let json = r#"{
            "device": {"mode": "alpaca", "base_url": "http://10.0.0.5:32323", "device_number": 1},
            "log_dir": "logs"
        }"#;
        let config = RunnerConfig::from_json(json).unwrap();
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        assert!(matches!(config.device, DeviceTarget::Alpaca { device_number: 1, .. }));
        assert!(config.open_device().is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = RunnerConfig::from_json(r#"{"device": {"mode": "alpaca", "base_url": "localhost"}}"#).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));

        let err = RunnerConfig::from_json(r#"{"settings": {"poll_interval_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, RunnerError::Conform(ConformError::Settings(_))));
    }

    #[tokio::test]
    async fn test_simulator_run_is_conformant() {
        let config = RunnerConfig::from_json(FAST_SIMULATOR_RUN).unwrap();
        let device = config.open_device().unwrap();
        let reporter = RecordingReporter::new();

        let summary = run_conformance(device.as_ref(), &config.settings, &reporter, std::future::pending())
            .await
            .unwrap();

        assert!(summary.is_conformant(), "{:?}", reporter.defects());
        assert!(!device.connected().await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_run() {
        let config = RunnerConfig::from_json(FAST_SIMULATOR_RUN).unwrap();
        let device = config.open_device().unwrap();
        let reporter = RecordingReporter::new();

        let summary = run_conformance(device.as_ref(), &config.settings, &reporter, async {})
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(reporter.has("Post-run Tracking", Outcome::Ok));
    }
}
