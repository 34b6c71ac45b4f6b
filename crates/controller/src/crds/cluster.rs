//! `Cluster` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the one Cluster object.
pub const CLUSTER_NAME: &str = "singlenode";
/// First value of the file uid counter; allocated uids start above it.
pub const INITIAL_FILE_UID_COUNT: i64 = 2001;

/// Cluster-wide settings and the file uid counter.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "stable.sitepod.io", version = "v1", kind = "Cluster")]
#[kube(namespaced)]
pub struct ClusterSpec {
    #[serde(default, rename = "displayName")]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Last allocated file uid
    #[serde(rename = "fileUIDCount")]
    pub file_uid_count: i64,

    /// Expose services through a LoadBalancer
    #[serde(default, rename = "useLoadBalancer")]
    pub use_load_balancer: bool,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            display_name: "Single Node Cluster".to_string(),
            description: String::new(),
            file_uid_count: INITIAL_FILE_UID_COUNT,
            use_load_balancer: false,
        }
    }
}

impl Cluster {
    /// Advance the counter and return the new value. The caller must persist
    /// the Cluster before handing the value out.
    pub fn next_file_uid(&mut self) -> i64 {
        self.spec.file_uid_count += 1;
        self.spec.file_uid_count
    }
}
