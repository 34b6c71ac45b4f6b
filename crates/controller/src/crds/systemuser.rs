//! `SystemUser` Custom Resource Definition

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::labels::PLAINTEXT_PASSWORD_ANNOTATION;
use super::{Defaultable, HasCondition};
use crate::password::{random_salt, sha512_crypt, DEFAULT_ROUNDS, SCHEME_SHA512_CRYPT};

/// Condition set by the home directory task.
pub const HOME_PROVISIONED_CONDITION: &str = "HomeProvisioned";
pub const DEFAULT_SHELL: &str = "/bin/bash";
const NAME_PREFIX: &str = "systemuser-";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct HashedPassword {
    #[serde(default)]
    pub scheme: String,

    #[serde(default)]
    pub salt: String,

    /// Encoded hash without the `$6$salt$` prefix
    #[serde(default, rename = "combinedHash")]
    pub combined_hash: String,

    #[serde(default)]
    pub rounds: u32,
}

impl HashedPassword {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.combined_hash.is_empty() && self.crypt_id().is_some()
    }

    fn crypt_id(&self) -> Option<&'static str> {
        match self.scheme.as_str() {
            SCHEME_SHA512_CRYPT | "6" => Some("6"),
            _ => None,
        }
    }

    /// The hash as it appears in `/etc/shadow`.
    #[must_use]
    pub fn crypt_string(&self) -> Option<String> {
        let id = self.crypt_id()?;
        if self.combined_hash.is_empty() {
            return None;
        }
        let rounds = if self.rounds == 0 || self.rounds == DEFAULT_ROUNDS {
            String::new()
        } else {
            format!("rounds={}$", self.rounds)
        };
        Some(format!("${id}${rounds}{}${}", self.salt, self.combined_hash))
    }
}

/// A login account inside a Sitepod.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "stable.sitepod.io", version = "v1", kind = "SystemUser")]
#[kube(namespaced)]
#[kube(status = "SystemUserStatus")]
#[kube(printcolumn = r#"{"name":"UID","type":"integer","jsonPath":".status.assignedFileUID"}"#)]
pub struct SystemUserSpec {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub shell: String,

    #[serde(default, rename = "hashedPassword")]
    pub hashed_password: HashedPassword,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SystemUserStatus {
    /// File uid allocated from the Cluster counter; never reassigned
    #[serde(default, rename = "assignedFileUID")]
    pub assigned_file_uid: i64,

    #[serde(default, rename = "homeProvisioned")]
    pub home_provisioned: bool,
}

impl SystemUser {
    /// Login name: `spec.username`, else the object name without `systemuser-`.
    #[must_use]
    pub fn username(&self) -> String {
        if self.spec.username.is_empty() {
            let name = self.name_any();
            name.strip_prefix(NAME_PREFIX).unwrap_or(&name).to_string()
        } else {
            self.spec.username.clone()
        }
    }

    #[must_use]
    pub fn home_directory(&self) -> String {
        format!("/home/{}", self.username())
    }

    #[must_use]
    pub fn shell(&self) -> &str {
        if self.spec.shell.is_empty() {
            DEFAULT_SHELL
        } else {
            &self.spec.shell
        }
    }

    #[must_use]
    pub fn assigned_file_uid(&self) -> i64 {
        self.status.as_ref().map_or(0, |s| s.assigned_file_uid)
    }

    #[must_use]
    pub fn home_provisioned(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.home_provisioned)
    }
}

impl HasCondition for SystemUser {
    fn set_condition(&mut self, name: &str, value: bool) -> bool {
        match name {
            HOME_PROVISIONED_CONDITION => {
                self.status.get_or_insert_with(Default::default).home_provisioned = value;
                true
            }
            _ => false,
        }
    }
}

impl Defaultable for SystemUser {
    /// Fill the shell and replace a plaintext password annotation with its hash.
    fn apply_defaults(&mut self) {
        if self.spec.shell.is_empty() {
            self.spec.shell = DEFAULT_SHELL.to_string();
        }
        let plaintext = self
            .annotations_mut()
            .remove(PLAINTEXT_PASSWORD_ANNOTATION)
            .filter(|p| !p.is_empty());
        let Some(plaintext) = plaintext else {
            return;
        };
        let salt = random_salt(16);
        match sha512_crypt(&plaintext, &salt, DEFAULT_ROUNDS) {
            Ok(hash) => {
                self.spec.hashed_password = HashedPassword {
                    scheme: SCHEME_SHA512_CRYPT.to_string(),
                    salt,
                    combined_hash: hash,
                    rounds: DEFAULT_ROUNDS,
                };
            }
            Err(e) => warn!(user = %self.name_any(), error = %e, "Failed to hash password"),
        }
    }
}
