//! `Sitepod` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::HasCondition;

/// Condition set by the storage setup task.
pub const STORAGE_READY_CONDITION: &str = "StorageReady";

/// A single-node site: one Deployment bound to one persistent volume claim.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "stable.sitepod.io", version = "v1", kind = "Sitepod")]
#[kube(namespaced)]
#[kube(status = "SitepodStatus")]
#[kube(printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.displayName"}"#)]
#[kube(printcolumn = r#"{"name":"Storage","type":"boolean","jsonPath":".status.storageSetup"}"#)]
pub struct SitepodSpec {
    #[serde(default, rename = "displayName")]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Claims backing the site. The first one holds home directories.
    #[serde(default, rename = "volumeClaims")]
    pub volume_claims: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SitepodStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,

    #[serde(default, rename = "localStorage", skip_serializing_if = "Vec::is_empty")]
    pub local_storage: Vec<String>,

    /// Home storage layout has been created on the volume.
    #[serde(default, rename = "storageSetup")]
    pub storage_setup: bool,
}

impl Sitepod {
    #[must_use]
    pub fn storage_setup(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.storage_setup)
    }

    /// Claim mounted as the home volume.
    #[must_use]
    pub fn root_claim(&self) -> Option<&str> {
        self.spec.volume_claims.first().map(String::as_str)
    }
}

impl HasCondition for Sitepod {
    fn set_condition(&mut self, name: &str, value: bool) -> bool {
        match name {
            STORAGE_READY_CONDITION => {
                self.status.get_or_insert_with(Default::default).storage_setup = value;
                true
            }
            _ => false,
        }
    }
}
