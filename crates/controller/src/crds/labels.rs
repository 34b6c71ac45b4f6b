//! Well-known labels and annotations.

/// Owning Sitepod uid on every derived object.
pub const SITEPOD_LABEL: &str = "sitepod";
/// Owning AppComponent name on generated ConfigMaps.
pub const APPCOMPONENT_LABEL: &str = "appcomponent";
/// Kind of generated ConfigMap (`appcomponent`, `webserver-sites`).
pub const CONFIGTYPE_LABEL: &str = "configtype";
pub const CONFIGTYPE_APPCOMPONENT: &str = "appcomponent";
pub const CONFIGTYPE_WEBSERVER_SITES: &str = "webserver-sites";
/// Marks ConfigMaps holding system files to mount into every `mountEtcs` container.
pub const ETC_CONFIG_LABEL: &str = "config-type";
pub const ETC_CONFIG_VALUE: &str = "etc";

/// Directory a generated ConfigMap is mounted at.
pub const MOUNT_PATH_ANNOTATION: &str = "sitepod.io/mount-path";
/// Node a host-local volume lives on.
pub const PINNED_HOST_ANNOTATION: &str = "sitepod.io/pinned-host";
/// Comma separated spec generators applied once to an AppComponent.
pub const SPECGEN_ANNOTATION: &str = "sitepod.io/specgen-onetime";
/// Plaintext password hashed into a SystemUser on creation.
pub const PLAINTEXT_PASSWORD_ANNOTATION: &str = "sitepod.io/plain-text-password";

#[must_use]
pub fn sitepod_selector(uid: &str) -> String {
    format!("{SITEPOD_LABEL}={uid}")
}
