//! # Connect Session
//!
//! The mirror image of a share. A share name decodes into the relay's tcp
//! port, the control API port behind the tunnel, and the relay host number.
//! Connecting starts a local proxy host that pushes its traffic through the
//! relay, then talks to the share's control API over that link.
//!
//! ```text
//! ┌─────────────┐  static IP  ┌─────────────┐   relay tcp   ┌─────────────┐
//! │   User /    │────────────►│ Connect     │──────────────►│   Share     │
//! │   ssh       │             │ proxy host  │  N.tcp.domain │   proxy     │
//! └─────────────┘             └─────────────┘               └─────────────┘
//! ```
//!
//! While connected, `/ping` is polled; a single failed ping ends the session.
//!
//! ## Example Usage
//!
//! ```bash
//! tunshare connect able_acid:bake_cat
//! tunshare connect --ssh able_acid:bake_cat@cab
//! tunshare connect --static-ip 172.16.0.10 able_acid:bake_cat
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::api::{ApiClient, ShareRecord};
use crate::config::Settings;
use crate::error::ShareError;
use crate::host::proxy::{self, CONNECT_SOCKS_PORT, ConnectProxy, DEFAULT_SHARE_PASSWORD};
use crate::host::{Capability, ProxyHandle, ProxyHostSpec, ProxyHosts};
use crate::keys::{self, KeyError};
use crate::lifecycle;
use crate::resource::{AcquiredIp, ResourceAcquirer};
use crate::wordlist::SessionName;

/// Command-line arguments for `tunshare connect`
///
/// Connecting starts a local proxy host with a static IP whose traffic is
/// routed to the shared machine.
///
/// # Examples
///
/// Connect with an automatically chosen IP:
/// ```bash
/// tunshare connect able_acid:bake_cat
/// ```
///
/// SSH straight into the shared machine:
/// ```bash
/// tunshare connect --ssh able_acid:bake_cat
/// ```
///
/// Through a non-default relay host, SOCKS only:
/// ```bash
/// tunshare connect --driver 2.tcp.ngrok.io --disable-static-ip able_acid:bake_cat@cab
/// ```
#[derive(Parser, Debug, Default, Clone)]
pub struct Args {
    /// Share name printed by `tunshare share`
    pub name: String,

    /// No static IP, only a SOCKS proxy
    #[arg(long, conflicts_with_all = ["static_ip", "ssh"])]
    pub disable_static_ip: bool,

    /// Manually override the static IP chosen
    #[arg(long, value_name = "IP")]
    pub static_ip: Option<String>,

    /// SSH into the remote machine
    #[arg(long)]
    pub ssh: bool,

    /// Relay host to connect through, e.g. `2.tcp.ngrok.io`
    #[arg(long, value_name = "HOST")]
    pub driver: Option<String>,
}

/// Validated connect options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub raw_name: String,
    pub name: SessionName,
    pub static_ip: bool,
    pub requested_ip: Option<IpAddr>,
    pub ssh: bool,
    pub driver: Option<String>,
}

impl TryFrom<&Args> for ConnectOptions {
    type Error = ShareError;

    fn try_from(args: &Args) -> Result<Self, ShareError> {
        let requested_ip = args
            .static_ip
            .as_deref()
            .map(|ip| ip.parse().map_err(|_| ShareError::IpInvalid(ip.to_string())))
            .transpose()?;
        Ok(Self {
            raw_name: args.name.clone(),
            name: parse_name(&args.name)?,
            static_ip: !args.disable_static_ip,
            requested_ip,
            ssh: args.ssh,
            driver: args.driver.clone(),
        })
    }
}

/// Decodes a share name, rejecting URLs pasted in by mistake.
pub fn parse_name(raw: &str) -> Result<SessionName, ShareError> {
    if Url::parse(raw).is_ok_and(|url| url.has_host()) {
        return Err(ShareError::ConnectNameIsUrl(raw.to_string()));
    }
    raw.parse().map_err(|source| ShareError::InvalidName {
        name: raw.to_string(),
        source,
    })
}

/// Relay address the connect proxy dials.
///
/// A `driver` on the relay's tcp domain wins over the host number in the
/// name.
pub fn relay_endpoint(name: &SessionName, driver: Option<&str>, tcp_domain: &str) -> String {
    match driver {
        Some(driver) if driver.ends_with(tcp_domain) => driver.to_string(),
        _ => format!("{}.{}", name.relay_host_number(), tcp_domain),
    }
}

/// Collaborators of a connect session.
pub struct ConnectContext<'a> {
    pub settings: &'a Settings,
    pub proxies: &'a dyn ProxyHosts,
    pub resources: &'a ResourceAcquirer,
}

/// Resources held by a connect session.
pub struct ConnectSession {
    pub options: ConnectOptions,
    ip: Option<AcquiredIp>,
    proxy: Option<ProxyHandle>,
}

impl ConnectSession {
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip.as_ref().map(AcquiredIp::value)
    }

    /// Client for the share's control API, reached through the static IP.
    pub fn api_client(&self) -> Result<Option<ApiClient>, ShareError> {
        self.ip()
            .map(|ip| ApiClient::new(ip, self.options.name.control_api_port))
            .transpose()
    }

    /// Destroys the proxy host and releases the IP, attempting both.
    pub async fn teardown(mut self, proxies: &dyn ProxyHosts) {
        if let Some(handle) = self.proxy.take() {
            debug!("Destroying connect proxy host {}", handle.id);
            if let Err(e) = proxies.destroy_proxy_host(&handle).await {
                error!("Failed to destroy connect proxy host {}: {}", handle.id, e);
            }
        }
        if let Some(ip) = self.ip.take() {
            ip.release();
        }
        info!("Connect session torn down");
    }
}

/// Acquires the static IP and brings up a provisioned connect proxy host.
pub async fn establish(ctx: &ConnectContext<'_>, options: ConnectOptions) -> Result<ConnectSession, ShareError> {
    let mut session = ConnectSession {
        options,
        ip: None,
        proxy: None,
    };
    match bring_up(ctx, &mut session).await {
        Ok(()) => Ok(session),
        Err(e) => {
            error!("Failed to connect: {}", e);
            session.teardown(ctx.proxies).await;
            Err(e)
        }
    }
}

async fn bring_up(ctx: &ConnectContext<'_>, session: &mut ConnectSession) -> Result<(), ShareError> {
    let options = session.options.clone();

    // The IP is claimed before the proxy host exists, so a clash fails fast
    if options.static_ip {
        info!("Acquiring IP for connect proxy host");
        let acquired = ctx.resources.acquire_ip(options.requested_ip)?;
        let acquired = match (acquired, options.requested_ip) {
            (Some(acquired), _) => acquired,
            (None, Some(ip)) => return Err(ShareError::IpInUse { ip }),
            (None, None) => return Err(ShareError::IpCouldNotAutoAcquire),
        };
        info!("Connect proxy host IP will be {}", acquired.value());
        session.ip = Some(acquired);
    }

    let endpoint = relay_endpoint(
        &options.name,
        options.driver.as_deref(),
        &ctx.settings.relay.tcp_domain,
    );
    println!("Starting a proxy host to connect to {}...", options.raw_name);

    // Start the connect proxy host
    let handle = ctx
        .proxies
        .start_proxy_host(ProxyHostSpec {
            name: "connect".to_string(),
            ip: session.ip(),
            port: None,
        })
        .await?;
    session.proxy = Some(handle.clone());

    let commands = proxy::connect_proxy_commands(&ConnectProxy {
        endpoint: &endpoint,
        port: options.name.tunnel_port,
        password: DEFAULT_SHARE_PASSWORD,
    });
    proxy::provision(ctx.proxies, &handle, Capability::ConnectProxy, &commands).await?;
    info!("Connect proxy host {} relays through {}", handle.id, endpoint);
    Ok(())
}

/// User-facing summary of a share.
pub fn render_share_info(record: &ShareRecord, tunnel_port: u16, ip: Option<IpAddr>) -> Vec<String> {
    let mut lines = Vec::new();

    let ports: Vec<_> = record
        .shared_ports
        .iter()
        .filter(|port| **port != tunnel_port)
        .collect();
    if !ports.is_empty() {
        lines.push("Only the following ports of the share can be accessed:".to_string());
        lines.push(String::new());
        lines.extend(ports.iter().map(|port| format!("Port: {port}")));
        lines.push(String::new());
    }
    if record.has_private_key {
        lines.push("SSH is available on this share: use `tunshare connect --ssh`.".to_string());
        lines.push(String::new());
    }

    lines.push("Connected!".to_string());
    if let Some(ip) = ip {
        lines.push(format!("SOCKS address: {ip}:{CONNECT_SOCKS_PORT}"));
        lines.push(format!("Machine IP: {ip}"));
        lines.push(String::new());
        lines.push("Reach the shared machine at the IP above. Press Ctrl-C to disconnect.".to_string());
    } else {
        lines.push("No static IP was requested; connect through the proxy host's SOCKS port.".to_string());
    }
    lines
}

/// Pings the share every `period` until `token` is cancelled.
///
/// One failed ping cancels `token` and reports the connection as lost.
pub async fn monitor(
    client: ApiClient,
    period: Duration,
    name: &str,
    token: &CancellationToken,
) -> Result<(), ShareError> {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticks.tick() => {}
        }

        if client.ping().await {
            debug!("Share connection is alive");
            continue;
        }

        error!("Share connection state has been lost, halting connect");
        token.cancel();
        return Err(ShareError::ConnectionLost {
            name: name.to_string(),
        });
    }
}

/// Asks for the key password until `pem` decrypts, then returns the key as
/// unencrypted PEM.
fn unlock_private_key(pem: &str) -> Result<String> {
    eprintln!("The SSH key of this share is password protected.");
    loop {
        let password = rpassword::prompt_password("Password for the private key: ")
            .context("Failed to read password")?;
        if password.is_empty() {
            continue;
        }
        match keys::decrypt_private_key(pem, Some(&password)) {
            Ok(key) => return Ok(keys::private_key_pem(&key)?),
            Err(KeyError::InvalidPassword) => eprintln!("Invalid password, please try again."),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Writes `pem` to a private temporary file that is deleted after `ttl`, or
/// when the returned guard is dropped, whichever comes first.
pub fn materialize_key(pem: &str, ttl: Duration) -> Result<(std::path::PathBuf, KeyFileGuard)> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("tunshare-connect-key-")
        .tempfile()
        .context("Failed to create key file")?;
    file.write_all(pem.as_bytes())?;
    file.flush()?;

    let path = file.into_temp_path();
    let location = path.to_path_buf();
    let expiry = tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        drop(path);
        debug!("Removed temporary key file");
    });
    Ok((location, KeyFileGuard { expiry }))
}

/// Deletes the key file early when dropped.
pub struct KeyFileGuard {
    expiry: tokio::task::JoinHandle<()>,
}

impl Drop for KeyFileGuard {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

async fn run_ssh(
    settings: &Settings,
    record: &ShareRecord,
    ip: IpAddr,
    key_path: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let port = record.ssh_port.unwrap_or(22);
    let user = record.ssh_username.as_deref().unwrap_or("root");

    println!("Executing SSH...");
    let mut child = Command::new(&settings.connect.ssh_binary)
        .arg("-i")
        .arg(key_path)
        .args(["-p", &port.to_string()])
        .args(["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"])
        .arg(format!("{user}@{ip}"))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", settings.connect.ssh_binary))?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            info!("SSH exited with {}", status);
        }
        _ = token.cancelled() => {
            warn!("Interrupted, stopping SSH");
            let _ = child.kill().await;
        }
    }
    Ok(())
}

async fn connect_ssh(
    settings: &Settings,
    session: &ConnectSession,
    client: &ApiClient,
    token: &CancellationToken,
) -> Result<()> {
    let name = &session.options.raw_name;
    println!("Looking up share {name}...");
    let record = client
        .connect_ssh()
        .await
        .map_err(|_| ShareError::ShareNotFound { name: name.clone() })?;

    let pem = record
        .ssh_private_key
        .as_deref()
        .filter(|_| record.has_private_key)
        .ok_or_else(|| ShareError::SshNotShared { name: name.clone() })?;

    let private_key = if record.private_key_encrypted {
        let pem = pem.to_string();
        // Ctrl-C must still reach teardown while the prompt is waiting.
        match lifecycle::prompt_unless_cancelled(token, move || unlock_private_key(&pem)).await? {
            Some(key) => key,
            None => return Ok(()),
        }
    } else {
        pem.to_string()
    };

    // ssh only reads the key at startup, so the file can go away soon after
    let (key_path, _guard) = materialize_key(&private_key, settings.connect.key_file_ttl())?;
    drop(private_key);

    let ip = session.ip().context("SSH needs a static IP")?;
    run_ssh(settings, &record, ip, &key_path, token).await
}

async fn connect_share(
    settings: &Settings,
    session: &ConnectSession,
    client: &ApiClient,
    token: &CancellationToken,
) -> Result<()> {
    let name = &session.options.raw_name;
    println!("Looking up share {name}...");
    let record = client.share_info().await.map_err(|e| {
        error!("Failed to establish connection to share `{}`: {}", name, e);
        ShareError::ShareNotFound { name: name.clone() }
    })?;

    for line in render_share_info(&record, session.options.name.tunnel_port, session.ip()) {
        println!("{line}");
    }

    if let Err(e) = monitor(client.clone(), settings.connect.ping_interval(), name, token).await {
        eprintln!("The connection to share `{name}` was lost.");
        return Err(e.into());
    }
    Ok(())
}

/// Runs `tunshare connect` until the share goes away or `token` is
/// cancelled.
pub async fn run_connect(args: Args, settings: Settings, token: CancellationToken) -> Result<()> {
    // Reject bad names and IPs before anything is acquired
    let options = ConnectOptions::try_from(&args)?;
    let proxies = settings.proxy_host();
    let resources = ResourceAcquirer::new(&settings.lock_dir)?;
    let ctx = ConnectContext {
        settings: &settings,
        proxies: &proxies,
        resources: &resources,
    };

    println!("Connecting to: {}", options.raw_name);
    let session = establish(&ctx, options).await?;

    let result = match session.api_client() {
        Ok(Some(client)) if session.options.ssh => connect_ssh(&settings, &session, &client, &token).await,
        Ok(Some(client)) => connect_share(&settings, &session, &client, &token).await,
        Ok(None) => {
            // No static IP means no route to the control API
            for line in render_share_info(&ShareRecord::default(), session.options.name.tunnel_port, None) {
                println!("{line}");
            }
            token.cancelled().await;
            Ok(())
        }
        Err(e) => Err(e.into()),
    };

    // Teardown runs whatever the session ended with
    session.teardown(&proxies).await;
    result
}
