//! Host adapter driven by shell command templates from the settings file.
//!
//! ```yaml
//! machines:
//!   default:
//!     guest: ubuntu
//!     forwarded_ports:
//!       - { guest: 80, host: 8080 }
//!     ssh: { host: 127.0.0.1, port: 2222, username: vagrant }
//!     insert_key_command: "vagrant ssh default -c {key_script}"
//! proxy:
//!   up: "vagrant-proxy up {name} --ip {ip} --forward {guest_port}:{host_port}"
//!   exec: "vagrant-proxy ssh {id} -- sudo sh -c {command}"
//!   destroy: "vagrant-proxy destroy -f {id}"
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Capability, ForwardedPort, Machine, ProxyHandle, ProxyHostSpec, ProxyHosts, SshInfo};
use crate::error::{Result, ShareError};

fn default_guest() -> String {
    "linux".to_string()
}

/// A shareable machine as described in the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_guest")]
    pub guest: String,
    #[serde(default)]
    pub forwarded_ports: Vec<ForwardedPort>,
    /// Authoritative host-to-guest map, when the provider can report one.
    #[serde(default)]
    pub provider_forwarded_ports: Option<BTreeMap<u16, u16>>,
    #[serde(default)]
    pub ssh: Option<SshInfo>,
    #[serde(default)]
    pub public_address: Option<String>,
    /// Runs with `{key}` and `{key_script}` substituted.
    #[serde(default)]
    pub insert_key_command: Option<String>,
}

/// Proxy host command templates.
///
/// `up` sees `{name}`, `{ip}`, `{guest_port}` and `{host_port}` and must
/// print the new host's identifier on its last stdout line. `exec` and
/// `destroy` see `{id}`; `exec` also gets `{command}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyCommands {
    #[serde(default)]
    pub up: Option<String>,
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub destroy: Option<String>,
}

pub struct CommandHost {
    name: String,
    machine: MachineConfig,
    proxy: ProxyCommands,
}

impl CommandHost {
    pub fn new(name: impl Into<String>, machine: MachineConfig, proxy: ProxyCommands) -> Self {
        Self {
            name: name.into(),
            machine,
            proxy,
        }
    }

    fn template<'a>(&self, template: &'a Option<String>, what: &str) -> Result<&'a str> {
        template.as_deref().ok_or_else(|| {
            ShareError::Host(format!(
                "no `proxy.{what}` command is configured for machine `{}`",
                self.name
            ))
        })
    }
}

#[async_trait]
impl Machine for CommandHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn guest_name(&self) -> &str {
        &self.machine.guest
    }

    fn forwarded_port_rules(&self) -> Vec<ForwardedPort> {
        self.machine.forwarded_ports.clone()
    }

    fn provider_forwarded_ports(&self) -> Option<BTreeMap<u16, u16>> {
        self.machine.provider_forwarded_ports.clone()
    }

    fn ssh_info(&self) -> Option<SshInfo> {
        self.machine.ssh.clone()
    }

    fn public_address(&self) -> Option<String> {
        self.machine.public_address.clone()
    }

    fn can_insert_public_key(&self) -> bool {
        self.machine.insert_key_command.is_some()
    }

    async fn insert_public_key(&self, openssh_key: &str) -> Result<()> {
        let Some(template) = &self.machine.insert_key_command else {
            return Err(ShareError::SshCantInsertKey {
                guest: self.machine.guest.clone(),
            });
        };
        let script = format!(
            "mkdir -p ~/.ssh && chmod 0700 ~/.ssh && echo {} >> ~/.ssh/authorized_keys && chmod 0600 ~/.ssh/authorized_keys",
            shell_quote(openssh_key)
        );
        let command = template
            .replace("{key_script}", &shell_quote(&script))
            .replace("{key}", &shell_quote(openssh_key));
        run_shell(&command).await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHosts for CommandHost {
    async fn start_proxy_host(&self, spec: ProxyHostSpec) -> Result<ProxyHandle> {
        let template = self.template(&self.proxy.up, "up")?;
        let name = format!("{}-{}", spec.name, Uuid::new_v4());
        let (guest_port, host_port) = spec
            .port
            .map(|p| (p.guest.to_string(), p.host.to_string()))
            .unwrap_or_default();
        let command = template
            .replace("{name}", &name)
            .replace("{ip}", &spec.ip.map(|ip| ip.to_string()).unwrap_or_default())
            .replace("{guest_port}", &guest_port)
            .replace("{host_port}", &host_port);

        let output = run_shell(&command).await?;
        let id = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(&name)
            .to_string();
        info!("Started proxy host {}", id);
        Ok(ProxyHandle { id, spec })
    }

    async fn destroy_proxy_host(&self, handle: &ProxyHandle) -> Result<()> {
        let template = self.template(&self.proxy.destroy, "destroy")?;
        run_shell(&template.replace("{id}", &handle.id)).await?;
        info!("Destroyed proxy host {}", handle.id);
        Ok(())
    }

    async fn run_privileged(&self, handle: &ProxyHandle, command: &str) -> Result<String> {
        let template = self.template(&self.proxy.exec, "exec")?;
        let full = template
            .replace("{id}", &handle.id)
            .replace("{command}", &shell_quote(command));
        run_shell(&full).await
    }

    fn host_has_capability(&self, _handle: &ProxyHandle, capability: Capability) -> bool {
        match capability {
            Capability::ShareProxy | Capability::ConnectProxy => self.proxy.exec.is_some(),
        }
    }
}

/// Single-quotes `s` for `sh`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn run_shell(command: &str) -> Result<String> {
    debug!("Running: {}", command);
    let output = Command::new("sh").arg("-c").arg(command).output().await?;
    if !output.status.success() {
        return Err(ShareError::Host(format!(
            "`{command}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::host::PortMapping;

    fn host(proxy: ProxyCommands) -> CommandHost {
        CommandHost::new("default", MachineConfig::default(), proxy)
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn up_uses_last_stdout_line_as_id() {
        let host = host(ProxyCommands {
            up: Some("echo booting {name}; echo proxy-{guest_port}-{host_port}".to_string()),
            ..Default::default()
        });
        let handle = host
            .start_proxy_host(ProxyHostSpec {
                name: "share".to_string(),
                ip: None,
                port: Some(PortMapping {
                    guest: 31338,
                    host: 50000,
                }),
            })
            .await
            .unwrap();
        assert_eq!(handle.id, "proxy-31338-50000");
    }

    #[tokio::test]
    async fn exec_passes_the_command_quoted() {
        let host = host(ProxyCommands {
            exec: Some("sh -c {command}".to_string()),
            ..Default::default()
        });
        let handle = ProxyHandle {
            id: "x".to_string(),
            spec: ProxyHostSpec {
                name: "x".to_string(),
                ip: None,
                port: None,
            },
        };
        let out = host
            .run_privileged(&handle, "echo 'hello world'")
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello world");
        assert!(host.host_has_capability(&handle, Capability::ShareProxy));
    }

    #[tokio::test]
    async fn failing_command_is_a_host_error() {
        let host = host(ProxyCommands {
            destroy: Some("exit 3".to_string()),
            ..Default::default()
        });
        let handle = ProxyHandle {
            id: "x".to_string(),
            spec: ProxyHostSpec {
                name: "x".to_string(),
                ip: None,
                port: None,
            },
        };
        assert!(matches!(
            host.destroy_proxy_host(&handle).await,
            Err(ShareError::Host(_))
        ));
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let host = host(ProxyCommands::default());
        let err = host
            .start_proxy_host(ProxyHostSpec {
                name: "connect".to_string(),
                ip: None,
                port: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("proxy.up"));
        assert!(!host.can_insert_public_key());
    }
}
