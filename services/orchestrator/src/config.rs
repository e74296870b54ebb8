use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;

use crate::cleanup::CleanupWorkerConfig;
use crate::lifecycle::LifecycleConfig;
use crate::storage::StorageBackend;

#[derive(Debug, Clone)]
pub struct KubeSettings {
    pub api_url: String,
    pub token_file: String,
    pub ca_file: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub redis_url: String,
    pub kube: KubeSettings,
    pub platform: String,
    pub storage: StorageBackend,
    pub diagnostics_container: String,
    pub inactivity_threshold: TimeDelta,
    pub cleanup_interval: Duration,
    pub stream_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let log_level = get("CALCBRIDGE_LOG_LEVEL", "info");

        let dev_mode = var("CALCBRIDGE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let kube = KubeSettings {
            api_url: get("CALCBRIDGE_KUBE_API_URL", "https://kubernetes.default.svc"),
            token_file: get(
                "CALCBRIDGE_KUBE_TOKEN_FILE",
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            ),
            ca_file: get(
                "CALCBRIDGE_KUBE_CA_FILE",
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            ),
        };

        let storage = match get("CALCBRIDGE_STORAGE_BACKEND", "local").as_str() {
            "local" => StorageBackend::Local {
                root: PathBuf::from(get("CALCBRIDGE_STORAGE_ROOT", "/var/lib/calcbridge/blobs")),
            },
            "azure" => StorageBackend::Azure,
            "memory" => StorageBackend::Memory,
            other => bail!("unknown CALCBRIDGE_STORAGE_BACKEND '{other}'"),
        };

        let inactivity_hours: i64 = get("CALCBRIDGE_INACTIVITY_THRESHOLD_HOURS", "24")
            .parse()
            .context("CALCBRIDGE_INACTIVITY_THRESHOLD_HOURS must be an integer")?;
        let inactivity_threshold = TimeDelta::try_hours(inactivity_hours)
            .context("CALCBRIDGE_INACTIVITY_THRESHOLD_HOURS out of range")?;

        let cleanup_secs: u64 = get("CALCBRIDGE_CLEANUP_INTERVAL_SECS", "300")
            .parse()
            .context("CALCBRIDGE_CLEANUP_INTERVAL_SECS must be an integer")?;

        Ok(Self {
            log_level,
            dev_mode,
            redis_url: get("CALCBRIDGE_REDIS_URL", "redis://127.0.0.1:6379/"),
            kube,
            platform: get("CALCBRIDGE_PLATFORM", "calcbridge"),
            storage,
            diagnostics_container: get("CALCBRIDGE_DIAGNOSTICS_CONTAINER", "diagnostics"),
            inactivity_threshold,
            cleanup_interval: Duration::from_secs(cleanup_secs),
            stream_base_url: get("CALCBRIDGE_STREAM_BASE_URL", "http://127.0.0.1:8080"),
        })
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            platform: self.platform.clone(),
            inactivity_threshold: self.inactivity_threshold,
            diagnostics_container: self.diagnostics_container.clone(),
            ..Default::default()
        }
    }

    pub fn cleanup(&self) -> CleanupWorkerConfig {
        CleanupWorkerConfig {
            check_interval: self.cleanup_interval,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.log_level, "info");
        assert!(!config.dev_mode);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379/");
        assert_eq!(config.kube.api_url, "https://kubernetes.default.svc");
        assert_eq!(
            config.storage,
            StorageBackend::Local {
                root: PathBuf::from("/var/lib/calcbridge/blobs")
            }
        );
        assert_eq!(config.inactivity_threshold, TimeDelta::hours(24));
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));

        let lifecycle = config.lifecycle();
        assert_eq!(lifecycle.platform, "calcbridge");
        assert_eq!(lifecycle.diagnostics_container, "diagnostics");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CALCBRIDGE_DEV", "TRUE"),
            ("CALCBRIDGE_STORAGE_BACKEND", "memory"),
            ("CALCBRIDGE_INACTIVITY_THRESHOLD_HOURS", "6"),
            ("CALCBRIDGE_CLEANUP_INTERVAL_SECS", "30"),
        ])
        .unwrap();

        assert!(config.dev_mode);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.lifecycle().inactivity_threshold, TimeDelta::hours(6));
        assert_eq!(config.cleanup().check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(load(&[("CALCBRIDGE_STORAGE_BACKEND", "s3")]).is_err());
        assert!(load(&[("CALCBRIDGE_CLEANUP_INTERVAL_SECS", "soon")]).is_err());
    }
}
