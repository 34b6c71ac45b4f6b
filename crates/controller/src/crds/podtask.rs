//! `PodTask` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}

/// A one-shot command run in a pod container, with bounded retries and an
/// optional condition set on another resource when it succeeds.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "stable.sitepod.io", version = "v1", kind = "PodTask")]
#[kube(namespaced)]
#[kube(status = "PodTaskStatus")]
#[kube(printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.podName"}"#)]
#[kube(printcolumn = r#"{"name":"Completed","type":"boolean","jsonPath":".status.completed"}"#)]
#[kube(printcolumn = r#"{"name":"Attempts","type":"integer","jsonPath":".status.attempts"}"#)]
pub struct PodTaskSpec {
    #[serde(rename = "podName")]
    pub pod_name: String,

    #[serde(default, rename = "containerName")]
    pub container_name: String,

    pub command: Vec<String>,

    #[serde(default = "default_max_attempts", rename = "maxAttempts")]
    pub max_attempts: u32,

    /// Kind of the resource to signal, e.g. "Sitepod"
    #[serde(default, rename = "behalfType")]
    pub behalf_type: String,

    /// Name of the resource to signal
    #[serde(default, rename = "behalfOf")]
    pub behalf_of: String,

    /// Condition set to true on the resource after success
    #[serde(default, rename = "behalfCondition")]
    pub behalf_condition: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodTaskStatus {
    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default, rename = "exitCode")]
    pub exit_code: i32,

    #[serde(default, rename = "stdOut")]
    pub std_out: String,

    #[serde(default, rename = "stdErr")]
    pub std_err: String,

    /// The behalf-of condition has been written
    #[serde(default, rename = "behalfSignaled")]
    pub behalf_signaled: bool,
}

impl PodTask {
    #[must_use]
    pub fn status_or_default(&self) -> PodTaskStatus {
        self.status.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed)
    }

    #[must_use]
    pub fn has_behalf(&self) -> bool {
        !self.spec.behalf_of.is_empty()
    }

    /// Nothing left to do: signaled (or nobody to signal), or out of attempts.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let status = self.status.as_ref();
        let attempts = status.map_or(0, |s| s.attempts);
        if status.is_some_and(|s| s.completed) {
            return !self.has_behalf() || status.is_some_and(|s| s.behalf_signaled);
        }
        attempts >= self.spec.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(max_attempts: u32, behalf: bool) -> PodTask {
        PodTask::new(
            "t",
            PodTaskSpec {
                pod_name: "p".into(),
                command: vec!["true".into()],
                max_attempts,
                behalf_of: if behalf { "site".into() } else { String::new() },
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_exhausted_attempts_are_terminal() {
        let mut t = task(2, false);
        assert!(!t.is_finished());
        t.status = Some(PodTaskStatus {
            attempts: 1,
            ..Default::default()
        });
        assert!(!t.is_finished());
        t.status.as_mut().unwrap().attempts = 2;
        assert!(t.is_finished());
    }

    #[test]
    fn test_completed_task_waits_for_signal() {
        let mut t = task(3, true);
        t.status = Some(PodTaskStatus {
            completed: true,
            attempts: 1,
            ..Default::default()
        });
        assert!(!t.is_finished());
        t.status.as_mut().unwrap().behalf_signaled = true;
        assert!(t.is_finished());

        let mut plain = task(3, false);
        plain.status = Some(PodTaskStatus {
            completed: true,
            ..Default::default()
        });
        assert!(plain.is_finished());
    }

    #[test]
    fn test_max_attempts_default() {
        let t: PodTaskSpec = serde_json::from_value(serde_json::json!({
            "podName": "p",
            "command": ["ls"]
        }))
        .unwrap();
        assert_eq!(t.max_attempts, 3);
    }
}
