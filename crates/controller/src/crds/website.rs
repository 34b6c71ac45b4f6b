//! `Website` Custom Resource Definition

use std::collections::HashSet;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Defaultable, HasCondition};

pub const DIRECTORY_CREATED_CONDITION: &str = "DirectoryCreated";
pub const SKELETON_SETUP_CONDITION: &str = "SkeletonSetup";
pub const SERVER_SETUP_CONDITION: &str = "ServerSetup";
pub const LOAD_BALANCER_SETUP_CONDITION: &str = "LoadBalancerSetup";

/// A virtual host served from a Sitepod.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "stable.sitepod.io", version = "v1", kind = "Website")]
#[kube(namespaced)]
#[kube(status = "WebsiteStatus")]
#[kube(printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.primaryDomain"}"#)]
pub struct WebsiteSpec {
    #[serde(default, rename = "primaryDomain")]
    pub primary_domain: String,

    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Setup checklist, completed strictly in field order.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct WebsiteStatus {
    #[serde(default, rename = "directoryCreated")]
    pub directory_created: bool,

    #[serde(default, rename = "skeletonSetup")]
    pub skeleton_setup: bool,

    #[serde(default, rename = "serverSetup")]
    pub server_setup: bool,

    #[serde(default, rename = "loadBalancerSetup")]
    pub load_balancer_setup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebsiteStep {
    DirectoryCreated,
    SkeletonSetup,
    ServerSetup,
    LoadBalancerSetup,
}

impl WebsiteStep {
    #[must_use]
    pub fn condition(self) -> &'static str {
        match self {
            WebsiteStep::DirectoryCreated => DIRECTORY_CREATED_CONDITION,
            WebsiteStep::SkeletonSetup => SKELETON_SETUP_CONDITION,
            WebsiteStep::ServerSetup => SERVER_SETUP_CONDITION,
            WebsiteStep::LoadBalancerSetup => LOAD_BALANCER_SETUP_CONDITION,
        }
    }
}

impl WebsiteStatus {
    /// First unfinished step.
    #[must_use]
    pub fn next_step(&self) -> Option<WebsiteStep> {
        [
            (self.directory_created, WebsiteStep::DirectoryCreated),
            (self.skeleton_setup, WebsiteStep::SkeletonSetup),
            (self.server_setup, WebsiteStep::ServerSetup),
            (self.load_balancer_setup, WebsiteStep::LoadBalancerSetup),
        ]
        .into_iter()
        .find(|(done, _)| !done)
        .map(|(_, step)| step)
    }
}

impl Website {
    #[must_use]
    pub fn status_or_default(&self) -> WebsiteStatus {
        self.status.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn primary_domain(&self) -> String {
        if self.spec.primary_domain.is_empty() {
            self.name_any()
        } else {
            self.spec.primary_domain.clone()
        }
    }

    /// Primary domain followed by aliases, for `server_name`.
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        let mut names = vec![self.primary_domain()];
        for alias in &self.spec.aliases {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }
        names
    }
}

impl HasCondition for Website {
    fn set_condition(&mut self, name: &str, value: bool) -> bool {
        let status = self.status.get_or_insert_with(Default::default);
        let flag = match name {
            DIRECTORY_CREATED_CONDITION => &mut status.directory_created,
            SKELETON_SETUP_CONDITION => &mut status.skeleton_setup,
            SERVER_SETUP_CONDITION => &mut status.server_setup,
            LOAD_BALANCER_SETUP_CONDITION => &mut status.load_balancer_setup,
            _ => return false,
        };
        *flag = value;
        true
    }
}

impl Defaultable for Website {
    fn apply_defaults(&mut self) {
        if self.spec.primary_domain.is_empty() {
            self.spec.primary_domain = self.name_any();
        }
        let primary = self.spec.primary_domain.clone();
        let mut seen = HashSet::new();
        self.spec
            .aliases
            .retain(|a| *a != primary && seen.insert(a.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_advance_in_order() {
        let mut site = Website::new("example.com", WebsiteSpec::default());
        assert_eq!(
            site.status_or_default().next_step(),
            Some(WebsiteStep::DirectoryCreated)
        );
        // Setting a later step does not skip an earlier one.
        site.set_condition(SERVER_SETUP_CONDITION, true);
        assert_eq!(
            site.status_or_default().next_step(),
            Some(WebsiteStep::DirectoryCreated)
        );
        site.set_condition(DIRECTORY_CREATED_CONDITION, true);
        site.set_condition(SKELETON_SETUP_CONDITION, true);
        assert_eq!(
            site.status_or_default().next_step(),
            Some(WebsiteStep::LoadBalancerSetup)
        );
        site.set_condition(LOAD_BALANCER_SETUP_CONDITION, true);
        assert_eq!(site.status_or_default().next_step(), None);
    }

    #[test]
    fn test_defaults_fill_domain_and_dedup_aliases() {
        let mut site = Website::new(
            "example.com",
            WebsiteSpec {
                primary_domain: String::new(),
                aliases: vec![
                    "www.example.com".into(),
                    "example.com".into(),
                    "www.example.com".into(),
                ],
            },
        );
        site.apply_defaults();
        assert_eq!(site.spec.primary_domain, "example.com");
        assert_eq!(site.server_names(), vec!["example.com", "www.example.com"]);
    }
}
