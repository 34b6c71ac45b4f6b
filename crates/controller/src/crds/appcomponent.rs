//! `AppComponent` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A file rendered into a generated ConfigMap and mounted into the container.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ConfigFile {
    /// ConfigMap data key
    pub name: String,

    /// Directory the file is mounted in
    #[serde(default)]
    pub directory: String,

    /// File name on disk, defaults to `name`
    #[serde(default)]
    pub filename: String,

    #[serde(default)]
    pub content: String,

    /// Octal file mode, e.g. "0644"
    #[serde(default, rename = "fileMode")]
    pub file_mode: String,

    #[serde(default)]
    pub uid: i64,

    #[serde(default)]
    pub gid: i64,
}

impl ConfigFile {
    #[must_use]
    pub fn file_name(&self) -> &str {
        if self.filename.is_empty() {
            &self.name
        } else {
            &self.filename
        }
    }

    /// Parsed octal mode, if one was given.
    #[must_use]
    pub fn mode(&self) -> Option<i32> {
        let trimmed = self.file_mode.trim_start_matches("0o");
        if trimmed.is_empty() {
            return None;
        }
        i32::from_str_radix(trimmed, 8).ok()
    }
}

/// One container of a Sitepod's pod, named after the AppComponent.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "stable.sitepod.io", version = "v1", kind = "AppComponent")]
#[kube(namespaced)]
#[kube(status = "AppComponentStatus")]
#[kube(printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#)]
#[kube(printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.imageVersion"}"#)]
pub struct AppComponentSpec {
    #[serde(default, rename = "type")]
    pub component_type: String,

    #[serde(default, rename = "displayName")]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub image: String,

    #[serde(default, rename = "imageVersion")]
    pub image_version: String,

    /// Publish `exposePort` through a Service
    #[serde(default)]
    pub expose: bool,

    #[serde(default, rename = "exposePort")]
    pub expose_port: i32,

    /// Use a NodePort Service when the cluster has no load balancer
    #[serde(default, rename = "exposeExternally")]
    pub expose_externally: bool,

    /// Mount the Sitepod's home volume at /home
    #[serde(default, rename = "mountHome")]
    pub mount_home: bool,

    /// Mount every ConfigMap labeled `config-type=etc`
    #[serde(default, rename = "mountEtcs")]
    pub mount_etcs: bool,

    /// Mount a memory-backed scratch volume at /tmp
    #[serde(default, rename = "mountTemp")]
    pub mount_temp: bool,

    #[serde(default, rename = "configFiles")]
    pub config_files: Vec<ConfigFile>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AppComponentStatus {}

impl AppComponentSpec {
    /// `image:imageVersion`, or just the image when no version is set.
    #[must_use]
    pub fn image_ref(&self) -> String {
        if self.image_version.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.image_version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_defaults_to_key() {
        let mut f = ConfigFile {
            name: "default.conf".into(),
            ..Default::default()
        };
        assert_eq!(f.file_name(), "default.conf");
        f.filename = "site.conf".into();
        assert_eq!(f.file_name(), "site.conf");
    }

    #[test]
    fn test_octal_mode() {
        let f = ConfigFile {
            file_mode: "0644".into(),
            ..Default::default()
        };
        assert_eq!(f.mode(), Some(0o644));
        assert_eq!(ConfigFile::default().mode(), None);
    }

    #[test]
    fn test_image_ref() {
        let spec = AppComponentSpec {
            image: "nginx".into(),
            image_version: "1.25".into(),
            ..Default::default()
        };
        assert_eq!(spec.image_ref(), "nginx:1.25");
    }
}
