//! Declarative tunnel configuration handed to the relay.

use std::collections::BTreeMap;

use serde::Serialize;

/// Logical channel names. `Proxy` and `Ssh` never coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelName {
    Http,
    Https,
    Ssh,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Http,
    Tls,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChannelAddr {
    Port(u16),
    Address(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub proto: Proto,
    pub addr: ChannelAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_tls: Option<bool>,
}

impl Channel {
    fn port(proto: Proto, port: u16) -> Self {
        Self {
            proto,
            addr: ChannelAddr::Port(port),
            bind_tls: None,
        }
    }
}

/// Which channels a session wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelRequest {
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    /// Dedicated SSH channel, used when the key is not password protected.
    pub ssh_port: Option<u16>,
    /// Generic TCP channel to the share proxy. Replaces `ssh_port`.
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelConfiguration {
    tunnels: BTreeMap<ChannelName, Channel>,
}

impl TunnelConfiguration {
    pub fn build(request: &ChannelRequest) -> Self {
        let mut config = Self::default();
        if let Some(port) = request.http_port {
            config.tunnels.insert(
                ChannelName::Http,
                Channel {
                    bind_tls: Some(false),
                    ..Channel::port(Proto::Http, port)
                },
            );
        }
        if let Some(port) = request.https_port {
            config
                .tunnels
                .insert(ChannelName::Https, Channel::port(Proto::Tls, port));
        }
        if let Some(port) = request.ssh_port {
            config
                .tunnels
                .insert(ChannelName::Ssh, Channel::port(Proto::Tcp, port));
        }
        if let Some(port) = request.proxy_port {
            config.set_proxy(port);
        }
        config
    }

    /// Routes all designated ports through one TCP channel, dropping any
    /// dedicated SSH channel.
    pub fn set_proxy(&mut self, port: u16) {
        self.tunnels.remove(&ChannelName::Ssh);
        self.tunnels
            .insert(ChannelName::Proxy, Channel::port(Proto::Tcp, port));
    }

    pub fn get(&self, name: ChannelName) -> Option<&Channel> {
        self.tunnels.get(&name)
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
