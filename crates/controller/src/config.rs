//! Controller manager configuration, loaded from a mounted YAML file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ControllerConfig {
    /// Work loop timing
    #[serde(default)]
    pub controller: LoopConfig,

    /// Remote task execution
    #[serde(default, rename = "podTask")]
    pub pod_task: PodTaskConfig,

    /// Orphan collection
    #[serde(default)]
    pub orphans: OrphanConfig,

    /// The per-Sitepod manager container
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Aggregated passwd/shadow/group ConfigMap
    #[serde(default)]
    pub etc: EtcConfig,

    /// Health endpoint
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopConfig {
    /// Delay before a retryable failure is reprocessed
    #[serde(rename = "retryDelayMs", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Interval for polling dependency caches before starting
    #[serde(rename = "syncPollIntervalMs", default = "default_sync_poll_ms")]
    pub sync_poll_interval_ms: u64,

    /// Workers per controller
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodTaskConfig {
    #[serde(rename = "retryDelaySecs", default = "default_podtask_retry_secs")]
    pub retry_delay_secs: u64,

    /// `maxAttempts` for tasks created by reconcilers
    #[serde(rename = "maxAttempts", default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrphanConfig {
    #[serde(rename = "graceSecs", default = "default_orphan_grace_secs")]
    pub grace_secs: u64,
}

/// Image configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    pub repository: String,
    pub tag: String,
}

impl ImageConfig {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.repository.trim().is_empty() && !self.tag.trim().is_empty()
    }

    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    #[serde(default = "default_manager_image")]
    pub image: ImageConfig,

    /// Where the home volume is mounted in the manager container
    #[serde(rename = "mountPath", default = "default_manager_mount")]
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EtcConfig {
    #[serde(rename = "configMapName", default = "default_etc_configmap")]
    pub config_map_name: String,

    /// Mount path advertised on the ConfigMap
    #[serde(rename = "mountPath", default = "default_etc_mount")]
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_sync_poll_ms() -> u64 {
    200
}

fn default_workers() -> usize {
    1
}

fn default_podtask_retry_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_orphan_grace_secs() -> u64 {
    15
}

fn default_manager_image() -> ImageConfig {
    ImageConfig {
        repository: "sitepod/manager".to_string(),
        tag: "latest".to_string(),
    }
}

fn default_manager_mount() -> String {
    "/sitepod".to_string()
}

fn default_etc_configmap() -> String {
    "user-etcs".to_string()
}

fn default_etc_mount() -> String {
    "/etc/sitepod/users".to_string()
}

fn default_health_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            sync_poll_interval_ms: default_sync_poll_ms(),
            workers: default_workers(),
        }
    }
}

impl Default for PodTaskConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_podtask_retry_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_orphan_grace_secs(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            image: default_manager_image(),
            mount_path: default_manager_mount(),
        }
    }
}

impl Default for EtcConfig {
    fn default() -> Self {
        Self {
            config_map_name: default_etc_configmap(),
            mount_path: default_etc_mount(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.controller.workers == 0 {
            return Err(anyhow::anyhow!("controller.workers must be at least 1"));
        }
        if self.controller.sync_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "controller.syncPollIntervalMs must be greater than zero"
            ));
        }
        if self.pod_task.max_attempts == 0 {
            return Err(anyhow::anyhow!("podTask.maxAttempts must be at least 1"));
        }
        if !self.manager.image.is_configured() {
            return Err(anyhow::anyhow!(
                "Manager image is not configured. Provide manager.image.repository and manager.image.tag."
            ));
        }
        if self.etc.config_map_name.trim().is_empty() {
            return Err(anyhow::anyhow!("etc.configMapName must not be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.controller.retry_delay_ms)
    }

    #[must_use]
    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.controller.sync_poll_interval_ms)
    }

    #[must_use]
    pub fn pod_task_retry_delay(&self) -> Duration {
        Duration::from_secs(self.pod_task.retry_delay_secs)
    }

    #[must_use]
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphans.grace_secs)
    }
}
