//! One-shot AppComponent spec generators, selected by the
//! `sitepod.io/specgen-onetime` annotation.

use std::collections::BTreeMap;

use handlebars::Handlebars;
use serde_json::json;

use crate::crds::{AppComponentSpec, ConfigFile};
use crate::error::{Error, Result};

pub type SpecGenFn = fn(&mut AppComponentSpec) -> Result<()>;

const SSHD_CONFIG_TEMPLATE: &str = r"Port {{port}}
HostKey {{key_dir}}/ssh_host_rsa_key
PermitRootLogin no
PasswordAuthentication yes
ChallengeResponseAuthentication no
AuthorizedKeysFile .ssh/authorized_keys
Subsystem sftp internal-sftp
";

const SSH_CONFIG_DIR: &str = "/etc/sitepod/ssh";
/// Writable; the config directory is a read-only ConfigMap mount.
const HOST_KEY_DIR: &str = "/var/lib/sitepod/ssh";

/// Named generators. Unknown names are configuration errors.
pub struct SpecGenRegistry {
    generators: BTreeMap<&'static str, SpecGenFn>,
}

impl Default for SpecGenRegistry {
    fn default() -> Self {
        let mut registry = Self {
            generators: BTreeMap::new(),
        };
        registry.register("ssh-server", ssh_server);
        registry.register("web-server", web_server);
        registry.register("php-fpm", php_fpm);
        registry
    }
}

impl SpecGenRegistry {
    pub fn register(&mut self, name: &'static str, f: SpecGenFn) {
        self.generators.insert(name, f);
    }

    /// Apply every generator named in the comma separated `names`, in order.
    pub fn apply(&self, names: &str, spec: &mut AppComponentSpec) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let generator = self
                .generators
                .get(name)
                .ok_or_else(|| Error::invalid(format!("unknown spec generator {name}")))?;
            generator(spec)?;
            applied.push(name.to_string());
        }
        Ok(applied)
    }
}

fn describe(spec: &mut AppComponentSpec, component_type: &str, display: &str, image: &str) {
    spec.component_type = component_type.to_string();
    spec.display_name = display.to_string();
    spec.description = display.to_string();
    spec.image = image.to_string();
    spec.image_version = "latest".to_string();
}

/// SSH/SFTP server with the home and etc volumes. Host keys are created by
/// the image on first start.
pub fn ssh_server(spec: &mut AppComponentSpec) -> Result<()> {
    describe(spec, "ssh", "SSH Server", "sitepod/sshdftp");
    spec.mount_home = true;
    spec.mount_etcs = true;

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string("sshd_config", SSHD_CONFIG_TEMPLATE)
        .map_err(|e| Error::Config(format!("sshd_config template: {e}")))?;
    let content = handlebars
        .render(
            "sshd_config",
            &json!({ "port": 22, "key_dir": HOST_KEY_DIR }),
        )
        .map_err(|e| Error::Config(format!("sshd_config render: {e}")))?;

    spec.config_files.retain(|f| f.name != "sshdconfig");
    spec.config_files.push(ConfigFile {
        name: "sshdconfig".to_string(),
        directory: SSH_CONFIG_DIR.to_string(),
        filename: "sshd_config".to_string(),
        content,
        file_mode: "0600".to_string(),
        uid: 0,
        gid: 0,
    });
    Ok(())
}

pub fn web_server(spec: &mut AppComponentSpec) -> Result<()> {
    describe(spec, "webserver", "Nginx Web Server", "sitepod/nginx");
    spec.mount_home = true;
    spec.mount_etcs = true;
    spec.expose = true;
    spec.expose_port = 80;
    spec.expose_externally = true;
    Ok(())
}

pub fn php_fpm(spec: &mut AppComponentSpec) -> Result<()> {
    describe(spec, "phpfpm", "PHP FPM Server", "sitepod/phpfpm");
    spec.mount_home = true;
    spec.mount_etcs = true;
    spec.mount_temp = true;
    spec.expose = true;
    spec.expose_port = 9090;
    spec.expose_externally = true;
    Ok(())
}
