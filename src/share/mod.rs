//! # Share Session
//!
//! Shares a machine through the relay. A share always exposes the detected
//! (or given) HTTP and HTTPS ports; with `--ssh` or `--full` it also starts
//! the control API and a share proxy host so peers can `connect` to it.
//!
//! ## Data Flow
//!
//! ```text
//! ┌────────────┐  ports   ┌────────────┐  config  ┌────────────┐  events  ┌────────────┐
//! │  Detector  │─────────►│  SharePlan │─────────►│   Relay    │─────────►│   Output   │
//! │            │          │            │          │ controller │  (queue) │   watcher  │
//! └────────────┘          └─────┬──────┘          └────────────┘          └────────────┘
//!                               │ ssh / full
//!                               ▼
//!                  ┌────────────────────────────┐
//!                  │ control API, proxy port,   │
//!                  │ share proxy host           │
//!                  └────────────────────────────┘
//! ```
//!
//! Everything acquired while starting is released in reverse order when the
//! session token is cancelled, and also when starting fails half way.
//!
//! ## Example Usage
//!
//! ```bash
//! # Share the detected HTTP port
//! tunshare share
//!
//! # Allow `tunshare connect --ssh`, key protected by a password
//! tunshare share --ssh
//!
//! # Share every forwarded port
//! tunshare share --full --disable-http
//! ```

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::api::{ControlApiServer, ServeOptions, ShareRecord};
use crate::config::Settings;
use crate::detect::{self, DetectedPorts, ForwardedProbe, Prober};
use crate::error::ShareError;
use crate::host::proxy::{self, DEFAULT_SHARE_PASSWORD, GUEST_PROXY_PORT, ShareProxy};
use crate::host::{self, Capability, Machine, PortMapping, ProxyHandle, ProxyHostSpec, ProxyHosts};
use crate::keys;
use crate::lifecycle;
use crate::relay::{
    self, ChannelRequest, RelayLaunch, RelayProcess, RequiredKeys, SessionInfo, ShareOutput,
    TunnelConfiguration,
};
use crate::resource::{AcquiredPort, ResourceAcquirer};

const LOCALHOST: &str = "127.0.0.1";
const MIN_PASSWORD_LEN: usize = 4;
const DEFAULT_DRIVER_NAME: &str = "ngrok";

/// Command-line arguments for `tunshare share`
///
/// A share always publishes the machine's HTTP and HTTPS ports, detected
/// unless given. SSH-only flags are rejected unless `--ssh` is given too.
///
/// # Examples
///
/// Share the detected HTTP server of the default machine:
/// ```bash
/// tunshare share
/// ```
///
/// Explicit ports, no HTTPS endpoint:
/// ```bash
/// tunshare share web --http 8080 --disable-https
/// ```
///
/// SSH access for a single peer, key without a password:
/// ```bash
/// tunshare share --ssh --ssh-no-password --ssh-once
/// ```
#[derive(Parser, Debug, Default, Clone)]
pub struct Args {
    /// Machine to share, as named in the settings file
    pub machine: Option<String>,

    /// Disable the public HTTP and HTTPS endpoints
    #[arg(long)]
    pub disable_http: bool,

    /// Disable the public HTTPS endpoint only
    #[arg(long)]
    pub disable_https: bool,

    /// Local HTTP port to forward to
    #[arg(long = "http", value_name = "PORT")]
    pub http_port: Option<u16>,

    /// Local HTTPS port to forward to
    #[arg(long = "https", value_name = "PORT")]
    pub https_port: Option<u16>,

    /// Allow `tunshare connect --ssh` access
    #[arg(long)]
    pub ssh: bool,

    /// Do not encrypt the SSH key with a password
    #[arg(long, requires = "ssh")]
    pub ssh_no_password: bool,

    /// Specific port for SSH when using --ssh
    #[arg(long, value_name = "PORT", requires = "ssh")]
    pub ssh_port: Option<u16>,

    /// Allow `tunshare connect --ssh` only one time
    #[arg(long, requires = "ssh")]
    pub ssh_once: bool,

    /// Share the entire machine
    #[arg(long)]
    pub full: bool,

    /// Specific name for the share (not supported by the relay)
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,
}

/// Normalised share options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareOptions {
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub disable_http: bool,
    pub disable_https: bool,
    pub ssh: bool,
    pub ssh_no_password: bool,
    pub ssh_port: Option<u16>,
    pub ssh_once: bool,
    pub full: bool,
}

impl From<&Args> for ShareOptions {
    fn from(args: &Args) -> Self {
        let mut options = Self {
            http_port: args.http_port,
            https_port: args.https_port,
            disable_http: args.disable_http,
            disable_https: args.disable_https,
            ssh: args.ssh,
            ssh_no_password: args.ssh_no_password,
            ssh_port: args.ssh_port,
            ssh_once: args.ssh_once,
            full: args.full,
        };
        if options.disable_http {
            options.http_port = None;
            options.https_port = None;
        }
        if options.disable_https {
            options.https_port = None;
        }
        options
    }
}

/// SSH endpoint peers are given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub username: String,
    pub port: u16,
}

/// What a share will expose, decided before anything is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePlan {
    /// Address of the machine when the provider reports one.
    pub public_address: Option<String>,
    /// Forwarded host ports; only these are reachable when the machine has
    /// no public address.
    pub restricted_ports: Vec<u16>,
    pub http_port: Option<u16>,
    pub https_port: Option<u16>,
    pub ssh: Option<SshTarget>,
    pub ssh_no_password: bool,
    pub ssh_once: bool,
    pub full: bool,
}

impl SharePlan {
    /// Whether peers reach this share through the control API and proxy.
    pub fn uses_proxy(&self) -> bool {
        self.full || (self.ssh.is_some() && !self.ssh_no_password)
    }

    pub fn required_keys(&self) -> RequiredKeys {
        RequiredKeys {
            http: self.http_port.is_some(),
            https: self.https_port.is_some(),
            name: self.ssh.is_some() || self.full,
        }
    }

    /// Ports advertised through the proxy channel.
    pub fn shared_ports(&self) -> Vec<u16> {
        if self.full {
            self.restricted_ports.clone()
        } else {
            self.ssh.iter().map(|ssh| ssh.port).collect()
        }
    }

    pub fn channel_request(&self, proxy_port: Option<u16>) -> ChannelRequest {
        ChannelRequest {
            http_port: self.http_port,
            https_port: self.https_port,
            ssh_port: self
                .ssh
                .as_ref()
                .filter(|_| self.ssh_no_password)
                .map(|ssh| ssh.port),
            proxy_port,
        }
    }
}

/// Collaborators of a share session.
pub struct ShareContext<'a> {
    pub settings: &'a Settings,
    pub machine: &'a dyn Machine,
    pub proxies: &'a dyn ProxyHosts,
    pub resources: &'a ResourceAcquirer,
}

/// Checks that `machine` can be shared with `options`.
///
/// Returns the machine's public address when the provider has one.
pub fn validate_target(machine: &dyn Machine, options: &ShareOptions) -> Result<Option<String>, ShareError> {
    if machine.ssh_info().is_none() {
        return Err(ShareError::MachineNotReady);
    }
    if options.ssh && !machine.can_insert_public_key() {
        return Err(ShareError::SshCantInsertKey {
            guest: machine.guest_name().to_string(),
        });
    }

    let target = machine.public_address();
    if target.is_none() {
        warn!(
            "Machine `{}` has no public address, sharing forwarded ports on {}",
            machine.name(),
            LOCALHOST
        );
    }
    Ok(target)
}

/// Detects HTTP(S) ports reachable on `target`.
///
/// `127.0.0.1` only probes forwarded ports; any other target races the
/// forwarded-port and common-port strategies.
pub async fn detect_http_ports(
    prober: &Prober,
    machine: &dyn Machine,
    target: &str,
) -> Result<DetectedPorts, ShareError> {
    if target == LOCALHOST {
        let detected = detect::detect_forwarded_ports(prober, machine, ForwardedProbe::default()).await;
        if detected.http.is_none() {
            return Err(ShareError::DetectHttpForwardedPortFailed);
        }
        Ok(detected)
    } else {
        let detected = detect::detect_hybrid(prober, machine, target).await;
        if detected.http.is_none() {
            return Err(ShareError::DetectHttpCommonPortFailed {
                target: target.to_string(),
            });
        }
        Ok(detected)
    }
}

/// Resolves the SSH username and port peers will use through `target`.
///
/// The machine's own SSH port is translated through its forwarded ports when
/// it lives on the other side of the forward from `target`.
pub fn configure_ssh_share(
    machine: &dyn Machine,
    target: &str,
    options: &ShareOptions,
) -> Result<SshTarget, ShareError> {
    let ssh_info = machine.ssh_info().ok_or(ShareError::SshNotReady)?;

    if let Some(port) = options.ssh_port {
        return Ok(SshTarget {
            username: ssh_info.username,
            port,
        });
    }

    let mut port = ssh_info.port;
    if ssh_info.host == LOCALHOST && target != LOCALHOST {
        port = host::guest_forwarded_port(machine, port).ok_or(ShareError::SshPortNotDetected)?;
    }
    if target == LOCALHOST && ssh_info.host != LOCALHOST {
        port = host::host_forwarded_port(machine, port)
            .ok_or(ShareError::SshHostPortNotDetected { guest_port: port })?;
    }

    Ok(SshTarget {
        username: ssh_info.username,
        port,
    })
}

/// Decides what to share. Probes the network but starts nothing.
pub async fn prepare(
    machine: &dyn Machine,
    prober: &Prober,
    options: &ShareOptions,
) -> Result<SharePlan, ShareError> {
    let public_address = validate_target(machine, options)?;

    let restricted_ports = if public_address.is_none() {
        host::forwarded_ports(machine).into_keys().collect()
    } else {
        Vec::new()
    };

    let mut http_port = options.http_port;
    let mut https_port = options.https_port;
    if http_port.is_none() && !options.disable_http {
        debug!("No HTTP port set, attempting auto-detection");
        // The relay runs locally, so detection always targets localhost.
        match detect_http_ports(prober, machine, LOCALHOST).await {
            Ok(detected) => {
                http_port = detected.http;
                https_port = https_port.or(detected.https);
            }
            Err(e) if options.ssh => {
                info!("HTTP detection failed, sharing SSH only: {}", e);
                println!("No HTTP port could be detected. Only SSH will be shared.");
            }
            Err(e) => return Err(e),
        }
    }
    if options.disable_https {
        https_port = None;
    }

    let ssh = if options.ssh {
        Some(configure_ssh_share(machine, LOCALHOST, options)?)
    } else {
        None
    };

    let plan = SharePlan {
        public_address,
        restricted_ports,
        http_port,
        https_port,
        ssh,
        ssh_no_password: options.ssh_no_password,
        ssh_once: options.ssh_once,
        full: options.full,
    };
    if plan.required_keys().is_empty() {
        return Err(ShareError::NothingToShare);
    }
    Ok(plan)
}

/// Reason a new key password is rejected, if any.
pub fn password_problem(password: &str, confirmation: &str) -> Option<&'static str> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Some("Password must be at least 4 characters long.");
    }
    if password != confirmation {
        return Some("Passwords do not match.");
    }
    None
}

/// Asks for a password to encrypt the SSH key with, until a valid one is
/// given twice.
pub fn prompt_new_password() -> Result<String> {
    loop {
        let password = rpassword::prompt_password("Please enter a password to encrypt the key: ")
            .context("Failed to read password")?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            eprintln!("Password must be at least 4 characters long.");
            continue;
        }
        let confirmation = rpassword::prompt_password("Repeat the password to confirm: ")
            .context("Failed to read password")?;
        match password_problem(&password, &confirmation) {
            Some(problem) => eprintln!("{problem}"),
            None => return Ok(password),
        }
    }
}

/// The resources held by a running share.
pub struct ShareSession {
    pub plan: SharePlan,
    outputs: Option<mpsc::UnboundedReceiver<ShareOutput>>,
    relay: Option<RelayProcess>,
    api: Option<ControlApiServer>,
    proxy: Option<ProxyHandle>,
    proxy_port: Option<AcquiredPort>,
}

impl ShareSession {
    /// Takes the output queue. It closes once the relay is gone.
    pub fn take_outputs(&mut self) -> Option<mpsc::UnboundedReceiver<ShareOutput>> {
        self.outputs.take()
    }

    pub fn control_api_port(&self) -> Option<u16> {
        self.api.as_ref().map(ControlApiServer::port)
    }

    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy_port.as_ref().map(AcquiredPort::value)
    }

    /// Releases everything in reverse order of acquisition. Each step is
    /// attempted even when an earlier one fails.
    pub async fn teardown(mut self, proxies: &dyn ProxyHosts) {
        if let Some(relay) = self.relay.take() {
            debug!("Stopping relay");
            relay.stop().await;
        }
        if let Some(api) = self.api.take() {
            debug!("Stopping control API");
            api.stop().await;
        }
        if let Some(handle) = self.proxy.take() {
            debug!("Destroying share proxy host {}", handle.id);
            if let Err(e) = proxies.destroy_proxy_host(&handle).await {
                error!("Failed to destroy share proxy host {}: {}", handle.id, e);
            }
        }
        if let Some(port) = self.proxy_port.take() {
            port.release();
        }
        info!("Share torn down");
    }
}

/// Starts everything `plan` needs, ending with the relay.
///
/// `password` encrypts the SSH key; `None` leaves it unencrypted. On
/// failure, whatever was already started is torn down before returning.
pub async fn start(
    ctx: &ShareContext<'_>,
    plan: SharePlan,
    password: Option<&str>,
    token: &CancellationToken,
) -> Result<ShareSession, ShareError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = ShareSession {
        plan,
        outputs: Some(rx),
        relay: None,
        api: None,
        proxy: None,
        proxy_port: None,
    };

    match launch(ctx, &mut session, password, tx, token).await {
        Ok(()) => Ok(session),
        Err(e) => {
            error!("Failed to start share: {}", e);
            session.teardown(ctx.proxies).await;
            Err(e)
        }
    }
}

async fn launch(
    ctx: &ShareContext<'_>,
    session: &mut ShareSession,
    password: Option<&str>,
    tx: mpsc::UnboundedSender<ShareOutput>,
    token: &CancellationToken,
) -> Result<(), ShareError> {
    let binary = relay::ensure_available(&ctx.settings.relay.binary)?;
    let plan = session.plan.clone();

    let private_key = match &plan.ssh {
        Some(_) => {
            println!("Generating new SSH key...");
            let password = password.filter(|_| !plan.ssh_no_password).map(str::to_owned);
            // RSA generation takes long enough to stall a runtime worker
            let keypair =
                tokio::task::spawn_blocking(move || keys::generate_keypair(password.as_deref())).await??;
            println!("Inserting generated SSH key into machine...");
            ctx.machine.insert_public_key(&keypair.openssh_public).await?;
            Some(keypair.private_pem)
        }
        None => None,
    };

    let mut proxy_port = None;
    if plan.uses_proxy() {
        // Control API first: its port goes into both the proxy rules and the name
        let bind: IpAddr = ctx
            .settings
            .control_api
            .bind
            .parse()
            .map_err(|_| ShareError::IpInvalid(ctx.settings.control_api.bind.clone()))?;
        let record = ShareRecord {
            shared_ports: plan.shared_ports(),
            has_private_key: private_key.is_some(),
            private_key_encrypted: plan.ssh.is_some() && !plan.ssh_no_password,
            ssh_username: plan.ssh.as_ref().map(|ssh| ssh.username.clone()),
            ssh_port: plan.ssh.as_ref().map(|ssh| ssh.port),
            ssh_private_key: None,
        };
        let api = ControlApiServer::start(
            bind,
            record,
            ServeOptions {
                private_key,
                ssh_once: plan.ssh_once,
            },
            token,
        )
        .await?;
        let api_port = api.port();
        session.api = Some(api);
        debug!("Control API is listening on port {}", api_port);

        // Probing the port range connects to each candidate synchronously
        let resources = ctx.resources.clone();
        let port = tokio::task::spawn_blocking(move || resources.acquire_port(None))
            .await??
            .ok_or(ShareError::PortCouldNotAcquire)?;
        let local_port = port.value();
        session.proxy_port = Some(port);
        proxy_port = Some(local_port);
        debug!("Local port for proxy forwarding: {}", local_port);

        // Bring up the share proxy with its shadowsocks port mapped locally
        let handle = ctx
            .proxies
            .start_proxy_host(ProxyHostSpec {
                name: "share".to_string(),
                ip: None,
                port: Some(PortMapping {
                    guest: GUEST_PROXY_PORT,
                    host: local_port,
                }),
            })
            .await?;
        session.proxy = Some(handle.clone());

        // Peers may reach the shared ports and the control API, nothing else
        let mut forwards = plan.shared_ports();
        forwards.push(api_port);
        let commands = proxy::share_proxy_commands(&ShareProxy {
            proxy_port: GUEST_PROXY_PORT,
            forwards: &forwards,
            target: plan.public_address.as_deref(),
            password: DEFAULT_SHARE_PASSWORD,
        });
        proxy::provision(ctx.proxies, &handle, Capability::ShareProxy, &commands).await?;
    }

    let tunnels = TunnelConfiguration::build(&plan.channel_request(proxy_port));
    // Without a control API the name still needs a second word pair.
    let control_api_port = session.control_api_port().unwrap_or(0);

    session.relay = Some(relay::start(
        RelayLaunch {
            binary: &binary,
            base_config: &ctx.settings.relay.base_config,
            tunnels: &tunnels,
            required: plan.required_keys(),
            control_api_port,
            default_endpoint: &ctx.settings.relay.tcp_endpoint,
        },
        tx,
        token.clone(),
    )?);
    info!("Share started");
    Ok(())
}

/// One line of user-facing share output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Success(String),
    Error(String),
}

/// Renders a queue item as connect instructions.
pub fn render_output(item: &ShareOutput, plan: &SharePlan, default_endpoint: &str) -> Vec<OutputLine> {
    let info: &SessionInfo = match item {
        ShareOutput::Error(message) => return vec![OutputLine::Error(message.clone())],
        ShareOutput::Session(info) => info,
    };
    let mut lines = Vec::new();

    if let Some(name) = &info.name {
        let relay_host = info
            .tcp
            .as_deref()
            .and_then(|tcp| Url::parse(tcp).ok())
            .and_then(|url| url.host_str().map(str::to_string))
            .filter(|host| host != default_endpoint);
        let driver = relay_host.as_deref().unwrap_or(DEFAULT_DRIVER_NAME);
        let driver_flag = relay_host
            .as_deref()
            .map(|host| format!("--driver {host} "))
            .unwrap_or_default();

        lines.push(OutputLine::Success(String::new()));
        lines.push(OutputLine::Success(format!("Share started! Your share name is: {name}")));
        if plan.full {
            lines.push(OutputLine::Success(String::new()));
            lines.push(OutputLine::Success(format!(
                "Full machine access through {driver}: tunshare connect {driver_flag}{name}"
            )));
        }
        if plan.ssh.is_some() {
            lines.push(OutputLine::Success(String::new()));
            lines.push(OutputLine::Success(format!(
                "SSH access through {driver}: tunshare connect {driver_flag}--ssh {name}"
            )));
        }
        lines.push(OutputLine::Success(String::new()));
    }
    if let Some(http) = &info.http {
        lines.push(OutputLine::Success(format!("HTTP URL: {http}")));
        lines.push(OutputLine::Success(String::new()));
    }
    if let Some(https) = &info.https {
        lines.push(OutputLine::Success(format!("HTTPS URL: {https}")));
        lines.push(OutputLine::Success(String::new()));
    }
    lines
}

/// Prints queue items until the queue closes.
pub async fn watch_output(
    mut outputs: mpsc::UnboundedReceiver<ShareOutput>,
    plan: SharePlan,
    default_endpoint: String,
) {
    while let Some(item) = outputs.recv().await {
        for line in render_output(&item, &plan, &default_endpoint) {
            match line {
                OutputLine::Success(text) => println!("{text}"),
                OutputLine::Error(text) => eprintln!("{text}"),
            }
        }
    }
    debug!("Share output watcher finished");
}

/// Runs `tunshare share` until `token` is cancelled.
pub async fn run_share(args: Args, settings: Settings, token: CancellationToken) -> Result<()> {
    let options = ShareOptions::from(&args);

    // Fail before touching the machine when the relay is missing
    relay::ensure_available(&settings.relay.binary)?;
    if let Some(name) = &args.name {
        warn!("Custom share names are not supported by the relay, ignoring `{}`", name);
        eprintln!("Custom share names are not supported, ignoring --name {name}");
    }

    let host = settings.host(args.machine.as_deref())?;
    let resources = ResourceAcquirer::new(&settings.lock_dir)?;
    let prober = Prober::new()?;

    println!("Detecting network information for machine...");
    let plan = prepare(&host, &prober, &options).await?;
    print_plan(&plan);

    let password = if plan.ssh.is_some() && !plan.ssh_no_password {
        match lifecycle::prompt_unless_cancelled(&token, prompt_new_password).await? {
            Some(password) => Some(password),
            // Interrupted before anything was started
            None => return Ok(()),
        }
    } else {
        None
    };

    println!("Creating share...");
    // The command host is both the machine and its proxy host provider
    let ctx = ShareContext {
        settings: &settings,
        machine: &host,
        proxies: &host,
        resources: &resources,
    };
    let mut session = start(&ctx, plan, password.as_deref(), &token).await?;

    // Print URLs and the share name as the relay reports them
    let watcher = session.take_outputs().map(|outputs| {
        tokio::spawn(watch_output(
            outputs,
            session.plan.clone(),
            settings.relay.tcp_endpoint.clone(),
        ))
    });

    // Ctrl-C, or a fatal relay error
    token.cancelled().await;
    println!("Halting share...");
    session.teardown(&host).await;

    if let Some(watcher) = watcher {
        if let Err(e) = watcher.await {
            error!("Share output watcher failed: {}", e);
        }
    }
    Ok(())
}

fn print_plan(plan: &SharePlan) {
    println!(
        "    Local machine address: {}",
        plan.public_address.as_deref().unwrap_or(LOCALHOST)
    );
    let port_or_disabled = |port: Option<u16>| port.map_or("disabled".to_string(), |p| p.to_string());
    println!("    Local HTTP port: {}", port_or_disabled(plan.http_port));
    println!("    Local HTTPS port: {}", port_or_disabled(plan.https_port));
    if let Some(ssh) = &plan.ssh {
        println!("    SSH Port: {}", ssh.port);
    }
    if plan.public_address.is_none() {
        for port in &plan.restricted_ports {
            println!("    Port: {port}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{FakeMachine, FakeProxyHosts};
    use crate::host::{ForwardedPort, SshInfo};
    use crate::wordlist::SessionName;
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;

    fn ssh_info(host: &str, port: u16) -> Option<SshInfo> {
        Some(SshInfo {
            host: host.to_string(),
            port,
            username: "vagrant".to_string(),
        })
    }

    async fn http_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn disable_http_clears_both_ports() {
        let args = Args {
            disable_http: true,
            http_port: Some(80),
            https_port: Some(443),
            ..Default::default()
        };
        let options = ShareOptions::from(&args);
        assert_eq!(options.http_port, None);
        assert_eq!(options.https_port, None);
    }

    #[test]
    fn ssh_only_flags_require_ssh() {
        assert!(Args::try_parse_from(["share", "--ssh-once"]).is_err());
        assert!(Args::try_parse_from(["share", "--ssh-port", "22"]).is_err());
        assert!(Args::try_parse_from(["share", "--ssh-no-password"]).is_err());
        let args = Args::try_parse_from(["share", "--ssh", "--ssh-once", "--http", "8080"]).unwrap();
        assert!(args.ssh_once);
        assert_eq!(args.http_port, Some(8080));
    }

    #[test]
    fn stopped_machine_cannot_be_shared() {
        let machine = FakeMachine::default();
        assert!(matches!(
            validate_target(&machine, &ShareOptions::default()),
            Err(ShareError::MachineNotReady)
        ));
    }

    #[test]
    fn ssh_needs_key_insertion() {
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            ..Default::default()
        };
        let options = ShareOptions {
            ssh: true,
            ..Default::default()
        };
        assert!(matches!(
            validate_target(&machine, &options),
            Err(ShareError::SshCantInsertKey { .. })
        ));
    }

    #[test]
    fn ssh_port_is_translated_to_the_host_side() {
        let machine = FakeMachine {
            ssh: ssh_info("10.0.0.5", 22),
            rules: vec![ForwardedPort::new(22, 2222)],
            ..Default::default()
        };
        let options = ShareOptions {
            ssh: true,
            ..Default::default()
        };
        let ssh = configure_ssh_share(&machine, LOCALHOST, &options).unwrap();
        assert_eq!(ssh.port, 2222);
        assert_eq!(ssh.username, "vagrant");

        let unforwarded = FakeMachine {
            ssh: ssh_info("10.0.0.5", 22),
            ..Default::default()
        };
        assert!(matches!(
            configure_ssh_share(&unforwarded, LOCALHOST, &options),
            Err(ShareError::SshHostPortNotDetected { guest_port: 22 })
        ));
    }

    #[test]
    fn ssh_port_is_translated_to_the_guest_side() {
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            rules: vec![ForwardedPort::new(22, 2222)],
            ..Default::default()
        };
        let options = ShareOptions {
            ssh: true,
            ..Default::default()
        };
        assert_eq!(configure_ssh_share(&machine, "10.0.0.5", &options).unwrap().port, 22);
        assert_eq!(configure_ssh_share(&machine, LOCALHOST, &options).unwrap().port, 2222);

        let explicit = ShareOptions {
            ssh_port: Some(2200),
            ..options
        };
        assert_eq!(configure_ssh_share(&machine, "10.0.0.5", &explicit).unwrap().port, 2200);
    }

    #[tokio::test]
    async fn prepare_detects_forwarded_http() {
        let live = http_server().await;
        let dead = dead_port().await;
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            rules: vec![ForwardedPort::new(8080, dead), ForwardedPort::new(8081, live)],
            ..Default::default()
        };
        let prober = Prober::new().unwrap();

        let plan = prepare(&machine, &prober, &ShareOptions::default()).await.unwrap();
        assert_eq!(plan.http_port, Some(live));
        assert_eq!(plan.https_port, None);
        assert_eq!(plan.public_address, None);
        let mut expected = vec![dead, live];
        expected.sort();
        assert_eq!(plan.restricted_ports, expected);
        assert_eq!(
            plan.required_keys(),
            RequiredKeys {
                http: true,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn failed_detection_is_fatal_unless_sharing_ssh() {
        let dead = dead_port().await;
        let prober = Prober::new().unwrap();
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            rules: vec![ForwardedPort::new(80, dead), ForwardedPort::new(22, 2222)],
            can_insert_key: true,
            ..Default::default()
        };

        assert!(matches!(
            prepare(&machine, &prober, &ShareOptions::default()).await,
            Err(ShareError::DetectHttpForwardedPortFailed)
        ));

        let options = ShareOptions {
            ssh: true,
            ..Default::default()
        };
        let plan = prepare(&machine, &prober, &options).await.unwrap();
        assert_eq!(plan.http_port, None);
        assert_eq!(plan.ssh.as_ref().unwrap().port, 2222);
        assert!(plan.uses_proxy());
        assert_eq!(plan.shared_ports(), vec![2222]);
    }

    #[tokio::test]
    async fn disabled_http_without_ssh_shares_nothing() {
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            ..Default::default()
        };
        let options = ShareOptions {
            disable_http: true,
            ..Default::default()
        };
        assert!(matches!(
            prepare(&machine, &Prober::new().unwrap(), &options).await,
            Err(ShareError::NothingToShare)
        ));
    }

    #[test]
    fn ssh_without_password_gets_a_dedicated_channel() {
        let plan = SharePlan {
            public_address: None,
            restricted_ports: vec![],
            http_port: Some(8080),
            https_port: None,
            ssh: Some(SshTarget {
                username: "vagrant".to_string(),
                port: 2222,
            }),
            ssh_no_password: true,
            ssh_once: false,
            full: false,
        };
        assert!(!plan.uses_proxy());
        let request = plan.channel_request(None);
        assert_eq!(request.ssh_port, Some(2222));
        assert_eq!(request.proxy_port, None);

        let full = SharePlan {
            full: true,
            restricted_ports: vec![2222, 8080],
            ..plan
        };
        assert!(full.uses_proxy());
        assert_eq!(full.shared_ports(), vec![2222, 8080]);
        let config = TunnelConfiguration::build(&full.channel_request(Some(50000)));
        assert!(config.get(relay::ChannelName::Ssh).is_none());
        assert!(config.get(relay::ChannelName::Proxy).is_some());
    }

    #[test]
    fn password_rules() {
        assert_eq!(password_problem("abc", "abc"), Some("Password must be at least 4 characters long."));
        assert_eq!(password_problem("abcd", "abce"), Some("Passwords do not match."));
        assert_eq!(password_problem("abcd", "abcd"), None);
    }

    #[test]
    fn output_lists_urls_and_connect_hints() {
        let plan = SharePlan {
            public_address: None,
            restricted_ports: vec![],
            http_port: Some(8080),
            https_port: None,
            ssh: Some(SshTarget {
                username: "vagrant".to_string(),
                port: 2222,
            }),
            ssh_no_password: false,
            ssh_once: false,
            full: false,
        };
        let name = SessionName::new(12345, 50123, Some(2));
        let info = SessionInfo {
            http: Some("http://abc.ngrok.io".to_string()),
            https: None,
            tcp: Some("tcp://2.tcp.ngrok.io:12345".to_string()),
            name: Some(name),
        };

        let lines = render_output(&ShareOutput::Session(info), &plan, "0.tcp.ngrok.io");
        let text: Vec<_> = lines
            .iter()
            .filter_map(|line| match line {
                OutputLine::Success(text) if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text[0], format!("Share started! Your share name is: {name}"));
        assert!(text[1].contains("2.tcp.ngrok.io"));
        assert!(text[1].contains(&format!("--ssh {name}")));
        assert_eq!(text[2], "HTTP URL: http://abc.ngrok.io");

        assert_eq!(
            render_output(&ShareOutput::Error("port in use".to_string()), &plan, "x"),
            vec![OutputLine::Error("port in use".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_start_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.relay.binary = "definitely-not-a-relay-binary-4821".to_string();
        settings.control_api.bind = "127.0.0.1".to_string();
        let resources = ResourceAcquirer::new(dir.path()).unwrap();
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            can_insert_key: true,
            ..Default::default()
        };
        let proxies = FakeProxyHosts::default();
        let ctx = ShareContext {
            settings: &settings,
            machine: &machine,
            proxies: &proxies,
            resources: &resources,
        };
        let plan = SharePlan {
            public_address: None,
            restricted_ports: vec![],
            http_port: None,
            https_port: None,
            ssh: None,
            ssh_no_password: false,
            ssh_once: false,
            full: true,
        };

        let token = CancellationToken::new();
        let err = start(&ctx, plan, None, &token).await.err().unwrap();
        assert!(matches!(err, ShareError::RelayUnavailable { .. }));
        assert!(proxies.started.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn full_share_provisions_proxy_and_tears_down() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let relay_path = dir.path().join("fake-relay");
        std::fs::write(
            &relay_path,
            "#!/bin/sh\necho '{\"msg\":\"decoded response\",\"resp\":{\"Error\":\"\",\"URL\":\"tcp://0.tcp.ngrok.io:4000\",\"Proto\":\"tcp\"}}'\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&relay_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let locks = dir.path().join("locks");
        let mut settings = Settings::default();
        settings.relay.binary = relay_path.to_string_lossy().into_owned();
        settings.relay.base_config = dir.path().join("missing.yml");
        settings.control_api.bind = "127.0.0.1".to_string();
        let resources = ResourceAcquirer::new(&locks).unwrap();
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            can_insert_key: true,
            ..Default::default()
        };
        let proxies = FakeProxyHosts::default();
        let ctx = ShareContext {
            settings: &settings,
            machine: &machine,
            proxies: &proxies,
            resources: &resources,
        };
        let plan = SharePlan {
            public_address: None,
            restricted_ports: vec![2222],
            http_port: None,
            https_port: None,
            ssh: None,
            ssh_no_password: false,
            ssh_once: false,
            full: true,
        };

        let token = CancellationToken::new();
        let mut session = start(&ctx, plan, None, &token).await.unwrap();
        let api_port = session.control_api_port().unwrap();
        let proxy_port = session.proxy_port().unwrap();
        assert!(crate::resource::SHARE_PORT_RANGE.contains(&proxy_port));

        let mut outputs = session.take_outputs().unwrap();
        let item = tokio::time::timeout(std::time::Duration::from_secs(10), outputs.recv())
            .await
            .unwrap()
            .unwrap();
        let ShareOutput::Session(info) = item else {
            panic!("expected a session, got {item:?}");
        };
        let name = info.name.unwrap();
        assert_eq!(name.tunnel_port, 4000);
        assert_eq!(name.control_api_port, api_port);

        {
            let started = proxies.started.lock().unwrap();
            assert_eq!(started.len(), 1);
            assert_eq!(
                started[0].port,
                Some(PortMapping {
                    guest: GUEST_PROXY_PORT,
                    host: proxy_port
                })
            );
            let commands = proxies.commands.lock().unwrap();
            assert!(commands.iter().any(|c| c.contains(&format!("--dport {api_port} "))));
            assert!(commands.iter().any(|c| c.contains("--dport 2222 ")));
        }

        token.cancel();
        session.teardown(&proxies).await;
        assert_eq!(proxies.destroyed.lock().unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(&locks).unwrap().count(), 0);
        assert!(outputs.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ssh_without_password_inserts_a_fresh_key() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let relay_path = dir.path().join("fake-relay");
        std::fs::write(
            &relay_path,
            "#!/bin/sh\necho '{\"msg\":\"decoded response\",\"resp\":{\"Error\":\"\",\"URL\":\"tcp://0.tcp.ngrok.io:4100\",\"Proto\":\"tcp\"}}'\nexec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&relay_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut settings = Settings::default();
        settings.relay.binary = relay_path.to_string_lossy().into_owned();
        settings.relay.base_config = dir.path().join("missing.yml");
        let resources = ResourceAcquirer::new(dir.path().join("locks")).unwrap();
        let machine = FakeMachine {
            ssh: ssh_info("127.0.0.1", 2222),
            can_insert_key: true,
            ..Default::default()
        };
        let proxies = FakeProxyHosts::default();
        let ctx = ShareContext {
            settings: &settings,
            machine: &machine,
            proxies: &proxies,
            resources: &resources,
        };
        let plan = SharePlan {
            public_address: None,
            restricted_ports: vec![],
            http_port: None,
            https_port: None,
            ssh: Some(SshTarget {
                username: "vagrant".to_string(),
                port: 2222,
            }),
            ssh_no_password: true,
            ssh_once: false,
            full: false,
        };

        let token = CancellationToken::new();
        let mut session = start(&ctx, plan, Some("ignored"), &token).await.unwrap();
        assert_eq!(session.control_api_port(), None);
        assert!(proxies.started.lock().unwrap().is_empty());
        {
            let keys = machine.inserted_keys.lock().unwrap();
            assert_eq!(keys.len(), 1);
            assert!(keys[0].starts_with("ssh-rsa "));
        }

        let mut outputs = session.take_outputs().unwrap();
        let item = tokio::time::timeout(std::time::Duration::from_secs(10), outputs.recv())
            .await
            .unwrap()
            .unwrap();
        let ShareOutput::Session(info) = item else {
            panic!("expected a session, got {item:?}");
        };
        let name = info.name.unwrap();
        assert_eq!(name.tunnel_port, 4100);
        assert_eq!(name.control_api_port, 0);

        token.cancel();
        session.teardown(&proxies).await;
    }
}
