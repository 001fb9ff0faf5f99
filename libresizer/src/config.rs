//! Controller configuration.
//!
//! Every optional behaviour is an explicit field here and is handed to the
//! controller constructors; nothing reads process-global state after
//! startup.  A config is built from [`ControllerConfig::default`], a YAML
//! document ([`ControllerConfig::from_yaml`]), and/or environment overrides
//! ([`ControllerConfig::with_env_overrides`]).
//!
//! Environment variables:
//! - `RESIZER_WORKERS`: resize worker count.
//! - `RESIZER_MODIFY_WORKERS`: modify worker count.
//! - `RESIZER_DRIVER_TIMEOUT_SECS`: timeout applied to every driver call.
//! - `RESIZER_RECOVER_FROM_FAILURE`: set to `0` to use legacy expansion.
//! - `RESIZER_HANDLE_IN_USE_ERROR`: set to `0` to disable in-use tracking.
//! - `RESIZER_EXTRA_MODIFY_METADATA`: set to `1` to send claim/volume
//!   identity with modify calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Settings shared by both controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub resize_workers: usize,
    pub modify_workers: usize,
    /// First requeue delay after a failed reconcile.
    #[serde(with = "secs")]
    pub retry_interval_start: Duration,
    /// Cap on the exponential requeue delay.
    #[serde(with = "secs")]
    pub retry_interval_max: Duration,
    #[serde(with = "secs")]
    pub driver_timeout: Duration,
    #[serde(with = "secs")]
    pub resync_period: Duration,
    /// How long an infeasible modification suppresses retries.
    #[serde(with = "secs")]
    pub slow_set_retention: Duration,
    #[serde(with = "secs")]
    pub slow_set_sweep_interval: Duration,
    /// Drive expansion through the claim's resize status rather than
    /// conditions only.
    pub recover_from_failure: bool,
    pub handle_volume_in_use_error: bool,
    /// Add claim and volume identity to modify parameters.
    pub extra_modify_metadata: bool,
    /// Attribute-class support; the modify controller refuses to start
    /// without it.
    pub volume_attributes_class: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resize_workers: 10,
            modify_workers: 10,
            retry_interval_start: Duration::from_secs(1),
            retry_interval_max: Duration::from_secs(5 * 60),
            driver_timeout: Duration::from_secs(10),
            resync_period: Duration::from_secs(10 * 60),
            slow_set_retention: Duration::from_secs(5 * 60),
            slow_set_sweep_interval: Duration::from_secs(30),
            recover_from_failure: true,
            handle_volume_in_use_error: true,
            extra_modify_metadata: false,
            volume_attributes_class: true,
        }
    }
}

impl ControllerConfig {
    /// Parse a YAML document; missing fields keep their defaults.
    pub fn from_yaml(doc: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(doc)
            .map_err(|e| Error::invalid("config", format!("malformed YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML config file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid("config", format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&doc)
    }

    /// Apply `RESIZER_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, Error> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        if let Some(v) = var("RESIZER_WORKERS") {
            self.resize_workers = parse_number("RESIZER_WORKERS", &v)?;
        }
        if let Some(v) = var("RESIZER_MODIFY_WORKERS") {
            self.modify_workers = parse_number("RESIZER_MODIFY_WORKERS", &v)?;
        }
        if let Some(v) = var("RESIZER_DRIVER_TIMEOUT_SECS") {
            self.driver_timeout =
                Duration::from_secs(parse_number("RESIZER_DRIVER_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("RESIZER_RECOVER_FROM_FAILURE") {
            self.recover_from_failure = v != "0";
        }
        if let Some(v) = var("RESIZER_HANDLE_IN_USE_ERROR") {
            self.handle_volume_in_use_error = v != "0";
        }
        if let Some(v) = var("RESIZER_EXTRA_MODIFY_METADATA") {
            self.extra_modify_metadata = v == "1";
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the controllers cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.resize_workers == 0 || self.modify_workers == 0 {
            return Err(Error::invalid("config", "worker counts must be positive"));
        }
        if self.retry_interval_start > self.retry_interval_max {
            return Err(Error::invalid(
                "config",
                "retry_interval_start exceeds retry_interval_max",
            ));
        }
        if self.driver_timeout.is_zero()
            || self.resync_period.is_zero()
            || self.slow_set_sweep_interval.is_zero()
        {
            return Err(Error::invalid(
                "config",
                "driver_timeout, resync_period and slow_set_sweep_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid("config", format!("{name}={value} is not a number")))
}

/// Durations are written as seconds; fractions keep sub-second values.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_nanos() == 0 {
            s.serialize_u64(d.as_secs())
        } else {
            s.serialize_f64(d.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        assert!(config.recover_from_failure);
        assert!(!config.extra_modify_metadata);
    }

    #[test]
    fn yaml_keeps_defaults_for_missing_fields() {
        let config = ControllerConfig::from_yaml(
            "resize_workers: 3\ndriver_timeout: 30\nextra_modify_metadata: true\n",
        )
        .unwrap();
        assert_eq!(config.resize_workers, 3);
        assert_eq!(config.driver_timeout, Duration::from_secs(30));
        assert!(config.extra_modify_metadata);
        assert_eq!(config.modify_workers, 10);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resizer.yaml");
        std::fs::write(&path, "slow_set_retention: 60\n").unwrap();
        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.slow_set_retention, Duration::from_secs(60));
    }

    #[test]
    fn sub_second_intervals_survive_yaml() {
        let config = ControllerConfig {
            retry_interval_start: Duration::from_millis(10),
            retry_interval_max: Duration::from_millis(100),
            ..Default::default()
        };
        let doc = serde_yaml::to_string(&config).unwrap();
        assert_eq!(ControllerConfig::from_yaml(&doc).unwrap(), config);

        let config = ControllerConfig::from_yaml("retry_interval_start: 0.25\n").unwrap();
        assert_eq!(config.retry_interval_start, Duration::from_millis(250));
        assert!(ControllerConfig::from_yaml("driver_timeout: -1\n").is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(ControllerConfig::from_yaml("modify_workers: 0\n").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RESIZER_WORKERS", "4"),
            ("RESIZER_RECOVER_FROM_FAILURE", "0"),
            ("RESIZER_EXTRA_MODIFY_METADATA", "1"),
        ]);
        let config = ControllerConfig::default()
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.resize_workers, 4);
        assert!(!config.recover_from_failure);
        assert!(config.extra_modify_metadata);
        assert!(config.handle_volume_in_use_error);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let result = ControllerConfig::default()
            .with_overrides(|name| (name == "RESIZER_WORKERS").then(|| "many".to_owned()));
        assert!(result.is_err());
    }
}
