//! # Local Control API
//!
//! A small TLS-only HTTP server started on an ephemeral port for each share.
//! A connecting peer reaches it through the relay tunnel to learn what is
//! shared and to fetch SSH credentials.
//!
//! | Path            | Response                                   |
//! |-----------------|--------------------------------------------|
//! | `/ping`         | `{"message": "pong"}`                      |
//! | `/share-info`   | [`ShareRecord`] without the private key    |
//! | `/shared-ports` | `{"ports": [...]}`                         |
//! | `/connect-ssh`  | [`ShareRecord`] including the private key  |
//!
//! The certificate is self-signed and generated at startup, so clients must
//! skip chain validation. The tunnel is the access boundary.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info};

use crate::error::{Result, ShareError};

/// What a share exposes to connecting peers. Field names on the wire follow
/// the established share protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    #[serde(rename = "ports", default)]
    pub shared_ports: Vec<u16>,
    #[serde(default)]
    pub has_private_key: bool,
    /// The served private key is password protected.
    #[serde(rename = "private_key_password", default)]
    pub private_key_encrypted: bool,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(rename = "ssh_key", default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedPorts {
    ports: Vec<u16>,
}

struct ApiState {
    record: ShareRecord,
    private_key: Option<String>,
    /// Hand the private key out to the first `/connect-ssh` caller only.
    ssh_once: bool,
    key_taken: AtomicBool,
}

impl ApiState {
    fn public_record(&self) -> ShareRecord {
        ShareRecord {
            has_private_key: self.private_key.is_some() && !self.key_exhausted(),
            ..self.record.clone()
        }
    }

    fn key_exhausted(&self) -> bool {
        self.ssh_once && self.key_taken.load(Ordering::SeqCst)
    }

    fn take_key(&self) -> Option<String> {
        if self.ssh_once && self.key_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.private_key.clone()
    }
}

type SharedState = Arc<ApiState>;

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/share-info", get(share_info))
        .route("/shared-ports", get(shared_ports))
        .route("/connect-ssh", get(connect_ssh))
        .with_state(state)
}

async fn ping() -> Json<Pong> {
    Json(Pong {
        message: "pong".to_string(),
    })
}

async fn share_info(State(state): State<SharedState>) -> Json<ShareRecord> {
    Json(state.public_record())
}

async fn shared_ports(State(state): State<SharedState>) -> Json<SharedPorts> {
    Json(SharedPorts {
        ports: state.record.shared_ports.clone(),
    })
}

async fn connect_ssh(State(state): State<SharedState>) -> Json<ShareRecord> {
    let key = state.take_key();
    if key.is_some() {
        info!("SSH private key handed out to a connecting peer");
    }
    Json(ShareRecord {
        has_private_key: key.is_some(),
        ssh_private_key: key,
        ..state.record.clone()
    })
}

fn tls(e: impl std::fmt::Display) -> ShareError {
    ShareError::Tls(e.to_string())
}

/// Acceptor with a freshly generated self-signed certificate.
pub(crate) fn tls_acceptor() -> Result<TlsAcceptor> {
    let certified = rcgen::generate_simple_self_signed(vec!["tunshare".to_string()])
        .map_err(tls)?;
    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls)?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(tls)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Options for [`ControlApiServer::start`].
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Private key served on `/connect-ssh`.
    pub private_key: Option<String>,
    pub ssh_once: bool,
}

/// A running control API.
pub struct ControlApiServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ControlApiServer {
    /// Binds `bind:0` and starts serving `record`.
    ///
    /// The server stops when `session` is cancelled or [`stop`](Self::stop)
    /// is called.
    pub async fn start(
        bind: IpAddr,
        record: ShareRecord,
        options: ServeOptions,
        session: &CancellationToken,
    ) -> Result<Self> {
        let acceptor = tls_acceptor()?;
        let listener = TcpListener::bind(SocketAddr::new(bind, 0)).await?;
        let local_addr = listener.local_addr()?;

        // The key is served from `private_key` only, never from the record
        let state = Arc::new(ApiState {
            record: ShareRecord {
                ssh_private_key: None,
                ..record
            },
            private_key: options.private_key,
            ssh_once: options.ssh_once,
            key_taken: AtomicBool::new(false),
        });
        let app = router(state);
        let stop = session.child_token();

        info!("Control API listening on {}", local_addr);
        let task = tokio::spawn(serve(listener, acceptor, app, stop.clone()));

        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops accepting, drops open connections and joins the server task.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!("Control API task failed: {}", e);
        }
        debug!("Control API on {} stopped", self.local_addr);
    }
}

async fn serve(listener: TcpListener, acceptor: TlsAcceptor, app: Router, stop: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Control API accept failed: {}", e);
                continue;
            }
        };

        // Handshake and serve each connection on its own task
        let acceptor = acceptor.clone();
        let app = app.clone();
        connections.spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };

            let service = hyper::service::service_fn(move |req| app.clone().oneshot(req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(tls_stream), service)
                .await
            {
                debug!("Control API connection from {} ended: {}", peer, e);
            }
        });
    }

    // Drop in-flight connections along with the listener
    connections.shutdown().await;
}

/// Client side of the control API, used by `connect`.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(ip: IpAddr, port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            base: format!("https://{}", SocketAddr::new(ip, port)),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base, path);
        debug!("Requesting {}", url);
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// True when the share answers `/ping` with 200.
    pub async fn ping(&self) -> bool {
        match self.get::<Pong>("ping").await {
            Ok(_) => true,
            Err(e) => {
                debug!("Share ping failed: {}", e);
                false
            }
        }
    }

    pub async fn share_info(&self) -> Result<ShareRecord> {
        self.get("share-info").await
    }

    pub async fn shared_ports(&self) -> Result<Vec<u16>> {
        Ok(self.get::<SharedPorts>("shared-ports").await?.ports)
    }

    pub async fn connect_ssh(&self) -> Result<ShareRecord> {
        self.get("connect-ssh").await
    }
}
