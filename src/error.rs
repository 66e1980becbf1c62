//! Error types shared by the share and connect sides.

use std::net::IpAddr;

use thiserror::Error;

use crate::wordlist::DecodeError;

/// Everything that can stop a share or connect session.
///
/// Resource contention while iterating a pool is not an error; only an
/// exhausted pool or an explicitly requested resource that is taken ends
/// up here.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("relay executable `{binary}` could not be found; install it and make sure it is on PATH")]
    RelayUnavailable { binary: String },

    #[error("the machine is not running; start it before sharing")]
    MachineNotReady,

    #[error("the machine is not ready for SSH")]
    SshNotReady,

    #[error("the guest `{guest}` cannot have a public key inserted, so SSH sharing is unavailable")]
    SshCantInsertKey { guest: String },

    #[error("the SSH port could not be detected from the forwarded ports; use --ssh-port")]
    SshPortNotDetected,

    #[error("no host port forwards to guest SSH port {guest_port}; use --ssh-port")]
    SshHostPortNotDetected { guest_port: u16 },

    #[error("share `{name}` does not allow SSH access")]
    SshNotShared { name: String },

    #[error("no HTTP server was found on any forwarded port; use --http or --disable-http")]
    DetectHttpForwardedPortFailed,

    #[error("no HTTP server was found on common ports of {target}; use --http or --disable-http")]
    DetectHttpCommonPortFailed { target: String },

    #[error("nothing to share: no HTTP or HTTPS port, and neither --ssh nor --full was given")]
    NothingToShare,

    #[error("could not acquire a static IP for the connect machine; use --static-ip")]
    IpCouldNotAutoAcquire,

    #[error("IP {ip} is already in use by another connect session")]
    IpInUse { ip: IpAddr },

    #[error("invalid IP address `{0}`")]
    IpInvalid(String),

    #[error("could not acquire a free local port for the share proxy")]
    PortCouldNotAcquire,

    #[error("connect takes a share name, not a URL: `{0}`")]
    ConnectNameIsUrl(String),

    #[error("invalid share name `{name}`: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: DecodeError,
    },

    #[error("share `{name}` could not be found")]
    ShareNotFound { name: String },

    #[error("connection to share `{name}` was lost")]
    ConnectionLost { name: String },

    #[error("relay error: {0}")]
    Relay(String),

    #[error("control API TLS setup failed: {0}")]
    Tls(String),

    #[error("host operation failed: {0}")]
    Host(String),

    #[error("no machine named `{0}` is configured")]
    UnknownMachine(String),

    #[error(transparent)]
    Key(#[from] crate::keys::KeyError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShareError>;
