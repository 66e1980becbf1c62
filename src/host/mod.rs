//! # Host collaborator interface
//!
//! The share and connect sessions never manage virtual machines themselves.
//! They talk to two narrow interfaces instead:
//!
//! - [`Machine`]: the environment being shared (its forwarded ports, SSH
//!   details, public address, and public key insertion).
//! - [`ProxyHosts`]: lightweight proxy hosts that can be started, driven
//!   with privileged commands, and destroyed.
//!
//! [`command::CommandHost`] implements both by running configured shell
//! command templates. Tests use in-memory doubles.

pub mod command;
pub mod proxy;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One forwarded-port rule of a machine. Rules without a host port are
/// ignored by port detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    pub guest: u16,
    #[serde(default)]
    pub host: Option<u16>,
}

impl ForwardedPort {
    pub fn new(guest: u16, host: u16) -> Self {
        Self {
            guest,
            host: Some(host),
        }
    }
}

/// How to reach a machine over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
}

/// Optional operations a host may support. The set is fixed; new entries
/// need a new [`CAPABILITY_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Forward shared ports through a proxy server on the host.
    ShareProxy,
    /// Redirect all outbound traffic through a remote proxy.
    ConnectProxy,
}

pub const CAPABILITY_VERSION: u32 = 1;

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ShareProxy => f.write_str("share_proxy"),
            Capability::ConnectProxy => f.write_str("connect_proxy"),
        }
    }
}

/// The machine being shared.
#[async_trait]
pub trait Machine: Send + Sync {
    fn name(&self) -> &str;

    /// Guest operating system name, for error messages.
    fn guest_name(&self) -> &str;

    /// Forwarded-port rules from the machine's configuration.
    fn forwarded_port_rules(&self) -> Vec<ForwardedPort>;

    /// Host-to-guest port map reported by the provider itself, when the
    /// provider knows it. Takes precedence over the configured rules.
    fn provider_forwarded_ports(&self) -> Option<BTreeMap<u16, u16>> {
        None
    }

    /// `None` while the machine is not running.
    fn ssh_info(&self) -> Option<SshInfo>;

    /// Address other hosts can reach the machine on, if the provider has one.
    fn public_address(&self) -> Option<String> {
        None
    }

    fn can_insert_public_key(&self) -> bool;

    /// Authorizes an OpenSSH public key for the machine's SSH user.
    async fn insert_public_key(&self, openssh_key: &str) -> Result<()>;
}

/// Port forward from a proxy host port (`guest`) to a local port (`host`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub guest: u16,
    pub host: u16,
}

/// What to start a proxy host with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHostSpec {
    pub name: String,
    pub ip: Option<IpAddr>,
    pub port: Option<PortMapping>,
}

/// A running proxy host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandle {
    pub id: String,
    pub spec: ProxyHostSpec,
}

#[async_trait]
pub trait ProxyHosts: Send + Sync {
    async fn start_proxy_host(&self, spec: ProxyHostSpec) -> Result<ProxyHandle>;

    async fn destroy_proxy_host(&self, handle: &ProxyHandle) -> Result<()>;

    /// Runs `command` as root on the proxy host and returns its stdout.
    async fn run_privileged(&self, handle: &ProxyHandle, command: &str) -> Result<String>;

    fn host_has_capability(&self, handle: &ProxyHandle, capability: Capability) -> bool;
}

/// Host-to-guest forwarded ports of `machine`.
///
/// The provider's own answer wins; otherwise every configured rule that has
/// a host port is used.
pub fn forwarded_ports(machine: &dyn Machine) -> BTreeMap<u16, u16> {
    if let Some(ports) = machine.provider_forwarded_ports() {
        return ports;
    }

    machine
        .forwarded_port_rules()
        .into_iter()
        .filter_map(|rule| rule.host.map(|host| (host, rule.guest)))
        .collect()
}

/// Guest port that host port `port` forwards to.
pub fn guest_forwarded_port(machine: &dyn Machine, port: u16) -> Option<u16> {
    forwarded_ports(machine).get(&port).copied()
}

/// Host port that forwards to guest port `port`.
pub fn host_forwarded_port(machine: &dyn Machine, port: u16) -> Option<u16> {
    forwarded_ports(machine)
        .into_iter()
        .rev()
        .find_map(|(host, guest)| (guest == port).then_some(host))
}


#[cfg(test)]
mod tests {
    use super::testing::FakeMachine;
    use super::*;

    fn machine() -> FakeMachine {
        FakeMachine {
            rules: vec![
                ForwardedPort::new(8080, 3000),
                ForwardedPort::new(8080, 4567),
                ForwardedPort {
                    guest: 22,
                    host: None,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn forwarded_ports_come_from_rules_with_host_ports() {
        let ports = forwarded_ports(&machine());
        assert_eq!(ports, BTreeMap::from([(3000, 8080), (4567, 8080)]));
    }

    #[test]
    fn provider_answer_wins_unmodified() {
        let mut machine = machine();
        machine.provider_ports = Some(BTreeMap::from([(2222, 22)]));
        assert_eq!(forwarded_ports(&machine), BTreeMap::from([(2222, 22)]));
    }

    #[test]
    fn guest_and_host_lookups_are_inverse() {
        let machine = FakeMachine {
            rules: vec![ForwardedPort::new(22, 2222), ForwardedPort::new(80, 8080)],
            ..Default::default()
        };
        for (host, guest) in forwarded_ports(&machine) {
            assert_eq!(guest_forwarded_port(&machine, host), Some(guest));
            assert_eq!(host_forwarded_port(&machine, guest), Some(host));
        }
        assert_eq!(guest_forwarded_port(&machine, 9999), None);
        assert_eq!(host_forwarded_port(&machine, 9999), None);
    }
}
