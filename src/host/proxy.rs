//! Provisioning scripts for proxy hosts.
//!
//! A share proxy accepts shadowsocks connections on [`GUEST_PROXY_PORT`] and
//! NATs them to the shared ports on its default gateway (the sharing host).
//! A connect proxy runs redsocks to push every outbound TCP connection
//! through a local shadowsocks client that talks to the relay.

use tracing::debug;

use super::{Capability, ProxyHandle, ProxyHosts};
use crate::error::{Result, ShareError};

/// Shadowsocks server port inside the share proxy host.
pub const GUEST_PROXY_PORT: u16 = 31338;

/// Local SOCKS port of the standalone shadowsocks client on a connect proxy.
pub const CONNECT_SOCKS_PORT: u16 = 31339;

pub const DEFAULT_SHARE_PASSWORD: &str = "TUNSHARE_DEFAULT_PASSWORD";

const IPTABLES: &str = "/usr/local/sbin/iptables";
const DEFAULT_GATEWAY: &str = "`route | grep default | awk '{print $2}'`";

const REDSOCKS_CONF: &str = "base {
        log_debug = on;
        log_info = on;
        log = \"file:/root/redsocks.log\";
        daemon = off;
        redirector = iptables;
}

redsocks {
        local_ip = 0.0.0.0;
        local_port = 31338;
        ip = %PROXY_IP%;
        port = %PROXY_PORT%;
        type = socks5;
}";

/// Settings for [`share_proxy_commands`].
#[derive(Debug, Clone)]
pub struct ShareProxy<'a> {
    pub proxy_port: u16,
    pub forwards: &'a [u16],
    pub target: Option<&'a str>,
    pub password: &'a str,
}

pub fn share_proxy_commands(opts: &ShareProxy<'_>) -> Vec<String> {
    let mut commands = vec![
        "sysctl -w net.ipv4.ip_forward=1".to_string(),
        format!(
            "{IPTABLES} -t filter -I INPUT -p tcp -i eth0 --dport {} -j ACCEPT",
            opts.proxy_port
        ),
        format!("{IPTABLES} -t nat -A OUTPUT -d {DEFAULT_GATEWAY}/32 -j RETURN"),
    ];
    for port in opts.forwards {
        commands.push(format!(
            "{IPTABLES} -t nat -A OUTPUT -p tcp --dport {port} -j DNAT --to-destination {DEFAULT_GATEWAY}:{port}"
        ));
    }
    if let Some(target) = opts.target {
        commands.push(format!(
            "{IPTABLES} -t nat -A OUTPUT -p tcp -j DNAT --to-destination {target}"
        ));
    }
    commands.push(format!(
        "start-stop-daemon -b --start --exec /usr/local/bin/ss-server -- -password {} -s :{}",
        opts.password, opts.proxy_port
    ));
    commands
}

/// Settings for [`connect_proxy_commands`].
#[derive(Debug, Clone)]
pub struct ConnectProxy<'a> {
    /// Relay host the local shadowsocks client dials.
    pub endpoint: &'a str,
    pub port: u16,
    pub password: &'a str,
}

/// Redsocks pushes every TCP connection through a shadowsocks client
/// listening on [`CONNECT_SOCKS_PORT`], which talks to the relay.
pub fn connect_proxy_commands(opts: &ConnectProxy<'_>) -> Vec<String> {
    let conf = REDSOCKS_CONF
        .replace("%PROXY_IP%", "127.0.0.1")
        .replace("%PROXY_PORT%", &CONNECT_SOCKS_PORT.to_string());

    let mut commands = vec![
        "sysctl -w net.ipv4.ip_forward=1".to_string(),
        // Everything arriving from the private network goes to redsocks
        format!("{IPTABLES} -t nat -A PREROUTING -i eth1 -p tcp -j REDIRECT --to-ports {GUEST_PROXY_PORT}"),
        format!("{IPTABLES} -A INPUT -i eth1 -j ACCEPT"),
        "rm -f ~/redsocks.conf".to_string(),
    ];
    commands.extend(conf.lines().map(|line| format!("echo '{line}' >> ~/redsocks.conf")));

    commands.push(format!(
        "start-stop-daemon -b --start --exec /usr/local/bin/ss-client -- -socks :{CONNECT_SOCKS_PORT} -password {} -c {}:{}",
        opts.password, opts.endpoint, opts.port
    ));
    commands.push(
        "start-stop-daemon -b --start --exec /usr/local/bin/redsocks -- -c ~/redsocks.conf"
            .to_string(),
    );
    commands
}

/// Runs `commands` in order on the proxy host, stopping at the first failure.
pub async fn provision(
    hosts: &dyn ProxyHosts,
    handle: &ProxyHandle,
    capability: Capability,
    commands: &[String],
) -> Result<()> {
    if !hosts.host_has_capability(handle, capability) {
        return Err(ShareError::Host(format!(
            "proxy host `{}` does not support {capability}",
            handle.id
        )));
    }
    for command in commands {
        debug!("[{}] {}", handle.id, command);
        hosts.run_privileged(handle, command).await?;
    }
    Ok(())
}
