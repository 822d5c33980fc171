use crate::detector::OnnxDetectorConfig;
use anyhow::{Context, Result};
use common::recognition::AnalysisParameters;
use common::validation::validate_analysis_parameters;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Node ID for this recognition service instance
    pub node_id: String,

    /// SQLite gallery (in-memory gallery when unset)
    pub gallery_database_url: Option<String>,

    /// Where appearance crops are written (crops disabled when unset)
    pub crop_dir: Option<PathBuf>,

    /// Where enrollment images are kept (not kept when unset)
    pub reference_dir: Option<PathBuf>,

    /// Finished analyses kept for polling before the oldest are dropped
    pub task_retention_limit: usize,

    /// Used for any tunable a submission leaves out
    pub defaults: AnalysisParameters,

    pub max_consecutive_read_failures: u32,

    /// Concurrent detector calls allowed
    pub detector_instances: usize,

    pub detector: OnnxDetectorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8086".to_string(),
            node_id: "recognition-service".to_string(),
            gallery_database_url: None,
            crop_dir: None,
            reference_dir: None,
            task_retention_limit: 1000,
            defaults: AnalysisParameters {
                threshold: 0.3,
                base_interval_secs: 3.0,
                speed_up_factor: 1.5,
                exit_delay_secs: 10.0,
            },
            max_consecutive_read_failures: 5,
            detector_instances: 1,
            detector: OnnxDetectorConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("RECOGNITION_SERVICE_ADDR") {
            config.bind_addr = addr;
        }

        config.node_id = lookup("NODE_ID").unwrap_or_else(|| {
            format!(
                "recognition-service-{}",
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
            )
        });

        config.gallery_database_url = lookup("GALLERY_DATABASE_URL").filter(|s| !s.is_empty());
        config.crop_dir = lookup("CROP_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        config.reference_dir = lookup("REFERENCE_IMAGE_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let defaults = &mut config.defaults;
        if let Some(v) = parse_var(&lookup, "DEFAULT_SIMILARITY_THRESHOLD")? {
            defaults.threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "DEFAULT_BASE_INTERVAL_SECS")? {
            defaults.base_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "DEFAULT_SPEED_UP_FACTOR")? {
            defaults.speed_up_factor = v;
        }
        if let Some(v) = parse_var(&lookup, "DEFAULT_EXIT_DELAY_SECS")? {
            defaults.exit_delay_secs = v;
        }
        validate_analysis_parameters(&config.defaults)
            .context("Invalid default analysis parameters")?;

        if let Some(v) = parse_var::<u32, _>(&lookup, "MAX_CONSECUTIVE_READ_FAILURES")? {
            anyhow::ensure!(v > 0, "MAX_CONSECUTIVE_READ_FAILURES must be at least 1");
            config.max_consecutive_read_failures = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "DETECTOR_INSTANCES")? {
            anyhow::ensure!(v > 0, "DETECTOR_INSTANCES must be at least 1");
            config.detector_instances = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "TASK_RETENTION_LIMIT")? {
            anyhow::ensure!(v > 0, "TASK_RETENTION_LIMIT must be at least 1");
            config.task_retention_limit = v;
        }

        if let Some(path) = lookup("FACE_DETECTION_MODEL") {
            config.detector.detection_model_path = path;
        }
        if let Some(path) = lookup("FACE_EMBEDDING_MODEL") {
            config.detector.embedding_model_path = path;
        }
        if let Some(provider) = lookup("FACE_RECOGNITION_EXECUTION_PROVIDER") {
            config.detector.execution_provider = provider;
        }
        if let Some(device_id) = parse_var(&lookup, "FACE_RECOGNITION_DEVICE_ID")? {
            config.detector.device_id = device_id;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}: '{}'", key, raw))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_lookup(lookup(&[("NODE_ID", "node-a")])).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.bind_addr, "0.0.0.0:8086");
        assert_eq!(config.defaults.threshold, 0.3);
        assert_eq!(config.defaults.base_interval_secs, 3.0);
        assert_eq!(config.defaults.speed_up_factor, 1.5);
        assert_eq!(config.defaults.exit_delay_secs, 10.0);
        assert_eq!(config.max_consecutive_read_failures, 5);
        assert_eq!(config.detector_instances, 1);
        assert!(config.gallery_database_url.is_none());
        assert!(config.crop_dir.is_none());
        assert!(config.reference_dir.is_none());
        assert_eq!(config.task_retention_limit, 1000);
    }

    #[test]
    fn test_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("RECOGNITION_SERVICE_ADDR", "127.0.0.1:9000"),
            ("GALLERY_DATABASE_URL", "sqlite://gallery.db"),
            ("CROP_DIR", "/var/lib/crops"),
            ("REFERENCE_IMAGE_DIR", "/var/lib/references"),
            ("TASK_RETENTION_LIMIT", "50"),
            ("DEFAULT_SIMILARITY_THRESHOLD", "0.55"),
            ("DEFAULT_EXIT_DELAY_SECS", "0"),
            ("DETECTOR_INSTANCES", "2"),
            ("FACE_RECOGNITION_EXECUTION_PROVIDER", "CPU"),
            ("FACE_RECOGNITION_DEVICE_ID", "1"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.gallery_database_url.as_deref(), Some("sqlite://gallery.db"));
        assert_eq!(config.crop_dir, Some(PathBuf::from("/var/lib/crops")));
        assert_eq!(config.reference_dir, Some(PathBuf::from("/var/lib/references")));
        assert_eq!(config.task_retention_limit, 50);
        assert_eq!(config.defaults.threshold, 0.55);
        assert_eq!(config.defaults.exit_delay_secs, 0.0);
        assert_eq!(config.detector_instances, 2);
        assert_eq!(config.detector.execution_provider, "CPU");
        assert_eq!(config.detector.device_id, 1);
        assert!(config.node_id.starts_with("recognition-service-"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[("DEFAULT_SPEED_UP_FACTOR", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("DEFAULT_SPEED_UP_FACTOR"));

        assert!(
            ServiceConfig::from_lookup(lookup(&[("DEFAULT_SIMILARITY_THRESHOLD", "1.5")])).is_err()
        );
        assert!(ServiceConfig::from_lookup(lookup(&[("DETECTOR_INSTANCES", "0")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("TASK_RETENTION_LIMIT", "0")])).is_err());
        assert!(
            ServiceConfig::from_lookup(lookup(&[("MAX_CONSECUTIVE_READ_FAILURES", "-1")])).is_err()
        );
    }
}
