//! # HTTP service detection
//!
//! Finds the local HTTP (and HTTPS) port of a machine so it can be shared
//! without the user naming it. Three strategies exist:
//!
//! - [`detect_ports`]: probe a list of commonly used ports on a target.
//! - [`detect_forwarded_ports`]: probe the machine's forwarded ports, plus a
//!   TLS probe for a port forwarded to guest port 443.
//! - [`detect_hybrid`]: run both and take whatever answers first.
//!
//! Probes run concurrently and the first one to see *any* HTTP response
//! wins, whatever its status code. Losing probes are aborted as soon as the
//! race is decided.

use std::time::Duration;

use reqwest::Client;
use reqwest::redirect::Policy;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::Result;
use crate::host::Machine;

/// Ports tried by [`detect_ports`].
pub const COMMON_PORTS: [u16; 5] = [80, 3000, 4567, 8000, 8080];

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_ATTEMPTS: usize = 2;

/// Result of a detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedPorts {
    pub http: Option<u16>,
    pub https: Option<u16>,
}

impl DetectedPorts {
    fn merge(&mut self, other: DetectedPorts) {
        self.http = self.http.or(other.http);
        self.https = self.https.or(other.https);
    }
}

/// HTTP clients used for probing. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Prober {
    client: Client,
}

impl Prober {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Whether something speaking HTTP answers at `url`.
    ///
    /// Connection failures are retried once. Any response, including error
    /// statuses, counts as a yes.
    pub async fn http_url(&self, url: &str) -> bool {
        for attempt in 1..=PROBE_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(response) => {
                    debug!("{} answered with {}", url, response.status());
                    return true;
                }
                Err(e) if e.is_connect() && attempt < PROBE_ATTEMPTS => {
                    debug!("Retrying {}: {}", url, e);
                }
                Err(e) => {
                    debug!("Not an HTTP URL: {} ({})", url, e);
                    return false;
                }
            }
        }
        false
    }
}

/// Waits for the first probe in `probes` that found something.
///
/// Remaining probes are aborted before returning.
async fn first_success(probes: &mut JoinSet<Option<u16>>) -> Option<u16> {
    let mut found = None;
    while let Some(joined) = probes.join_next().await {
        if let Ok(Some(port)) = joined {
            found = Some(port);
            break;
        }
    }
    probes.abort_all();
    found
}

fn spawn_probe(probes: &mut JoinSet<Option<u16>>, prober: &Prober, url: String, port: u16) {
    let prober = prober.clone();
    probes.spawn(async move { prober.http_url(&url).await.then_some(port) });
}

/// Probes [`COMMON_PORTS`] on `target`. Never finds HTTPS.
pub async fn detect_ports(prober: &Prober, target: &str) -> DetectedPorts {
    detect_ports_on(prober, target, &COMMON_PORTS).await
}

/// [`detect_ports`] with an explicit port list.
pub async fn detect_ports_on(prober: &Prober, target: &str, ports: &[u16]) -> DetectedPorts {
    let mut probes = JoinSet::new();
    for &port in ports {
        let url = format!("http://{target}:{port}/");
        debug!("Trying: {}", url);
        spawn_probe(&mut probes, prober, url, port);
    }

    DetectedPorts {
        http: first_success(&mut probes).await,
        https: None,
    }
}

/// Options for [`detect_forwarded_ports`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedProbe<'a> {
    /// Address to probe, `127.0.0.1` when unset.
    pub target: Option<&'a str>,
    /// Probe guest ports instead of host ports.
    pub guest_port: bool,
}

/// Probes every forwarded port of `machine`.
///
/// The first rule whose guest port is 443 additionally gets an HTTPS probe
/// with certificate validation disabled.
pub async fn detect_forwarded_ports(
    prober: &Prober,
    machine: &dyn Machine,
    opts: ForwardedProbe<'_>,
) -> DetectedPorts {
    let target = opts.target.unwrap_or("127.0.0.1");
    let mut http_probes = JoinSet::new();
    let mut https_probes = JoinSet::new();

    for rule in machine.forwarded_port_rules() {
        // Rules without a host port are unreachable from here
        let Some(host) = rule.host else {
            continue;
        };
        let port = if opts.guest_port { rule.guest } else { host };

        let url = format!("http://{target}:{port}/");
        debug!("Trying: {}", url);
        spawn_probe(&mut http_probes, prober, url, port);

        if rule.guest == 443 && https_probes.is_empty() {
            let url = format!("https://{target}:{port}/");
            debug!("Trying HTTPS: {}", url);
            spawn_probe(&mut https_probes, prober, url, port);
        }
    }

    let http = first_success(&mut http_probes).await;
    if let Some(port) = http {
        info!("HTTP port found: {}", port);
    }
    let https = first_success(&mut https_probes).await;

    DetectedPorts { http, https }
}

/// Runs the forwarded-port probe (against guest ports on `target`) and the
/// common-port probe side by side.
///
/// HTTP and HTTPS are each taken from whichever strategy reports them
/// first. Returns early once both are known.
pub async fn detect_hybrid(prober: &Prober, machine: &dyn Machine, target: &str) -> DetectedPorts {
    let forwarded = detect_forwarded_ports(
        prober,
        machine,
        ForwardedProbe {
            target: Some(target),
            guest_port: true,
        },
    );
    let common = detect_ports(prober, target);
    tokio::pin!(forwarded, common);

    let mut result = DetectedPorts::default();
    let (mut forwarded_done, mut common_done) = (false, false);
    while !(forwarded_done && common_done) {
        let found = tokio::select! {
            found = &mut forwarded, if !forwarded_done => {
                forwarded_done = true;
                found
            }
            found = &mut common, if !common_done => {
                common_done = true;
                found
            }
        };
        // The first strategy to report a port keeps it
        result.merge(found);
        if result.http.is_some() && result.https.is_some() {
            break;
        }
    }
    result
}
