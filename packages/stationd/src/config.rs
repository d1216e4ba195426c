use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stationd_protocol::MasterOptions;

use crate::{process::ProcessOptions, remote_check::CheckOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Where input/output artifacts are written.
    pub work_dir: PathBuf,
    pub serial: SerialConfig,
    pub programmer: ProgrammerConfig,
    pub remote: RemoteConfig,
    pub check: CheckConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub address: u8,
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            address: 0x01,
            timeout_ms: 200,
        }
    }
}

impl SerialConfig {
    pub fn master_options(&self) -> MasterOptions {
        MasterOptions {
            address: self.address,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramMethod {
    /// Run the vendor programmer executable.
    #[default]
    External,
    /// Write the parameters over the serial line ourselves.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgrammerConfig {
    pub method: ProgramMethod,
    pub executable: PathBuf,
    /// Text the programmer prints once the driver is written.
    pub success_marker: Option<String>,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            method: ProgramMethod::External,
            executable: PathBuf::from("programmer"),
            success_marker: Some("Programming completed successfully".to_string()),
        }
    }
}

impl ProgrammerConfig {
    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            success_marker: self.success_marker.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub cooldown_ms: u64,
    pub timeout_ms: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        let defaults = CheckOptions::default();
        Self {
            cooldown_ms: defaults.cooldown.as_millis() as u64,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

impl CheckConfig {
    pub fn options(&self) -> CheckOptions {
        CheckOptions {
            cooldown: Duration::from_millis(self.cooldown_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Directory the verification station drops its files into.
    /// Verification is skipped when unset.
    pub dir: Option<PathBuf>,
    pub timeout_ms: u64,
    pub poll_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            dir: None,
            timeout_ms: 60_000,
            poll_ms: 250,
        }
    }
}

impl StationConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let config = serde_json::from_str(&raw).context("parsing station config")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "work_dir": "/var/lib/stationd",
                "serial": {{ "port": "/dev/ttyS3", "address": 7 }},
                "programmer": {{ "method": "direct" }}
            }}"#
        )
        .unwrap();

        let config = StationConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/stationd"));
        assert_eq!(config.serial.port, "/dev/ttyS3");
        assert_eq!(config.serial.baud, 9600);
        assert_eq!(config.serial.master_options().address, 7);
        assert_eq!(
            config.serial.master_options().timeout,
            Duration::from_millis(200)
        );
        assert_eq!(config.programmer.method, ProgramMethod::Direct);
        assert!(config.programmer.success_marker.is_some());
        assert_eq!(config.check.options().cooldown, Duration::from_secs(1));
        assert!(config.watcher.dir.is_none());
    }

    #[test]
    fn config_missing_file() {
        assert!(StationConfig::from_file("/nonexistent/stationd.json").is_err());
    }

    #[test]
    fn config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        assert!(StationConfig::from_file(file.path().to_str().unwrap()).is_err());
    }
}
