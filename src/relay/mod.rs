//! # Relay Session Controller
//!
//! Supervises the external relay process for one share. The controller writes
//! the session's tunnel definitions to a private temporary file, launches the
//! relay with that file layered over the user's own relay configuration, and
//! turns the relay's JSON log stream into [`ShareOutput`] items.
//!
//! ```text
//! ┌──────────────┐  YAML   ┌─────────────┐  JSON lines  ┌─────────────┐  ShareOutput
//! │ Tunnel       │────────►│   Relay     │─────────────►│   Reader    │────────────►
//! │ Configuration│         │   process   │   (stdout)   │   task      │   (queue)
//! └──────────────┘         └─────────────┘              └─────────────┘
//! ```
//!
//! A tunnel error reported by the relay is fatal: it is published verbatim
//! and the session's cancellation token is cancelled. Lines that are not
//! JSON are logged and skipped.

pub mod config;
pub mod events;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use config::{ChannelName, ChannelRequest, TunnelConfiguration};
pub use events::{RelayEvent, RequiredKeys, SessionAccumulator, SessionInfo, ShareOutput};

use crate::error::{Result, ShareError};

/// Locates the relay executable, either as a path or on `PATH`.
///
/// Called before any machine or network side effects happen.
pub fn ensure_available(binary: &str) -> Result<PathBuf> {
    let unavailable = || ShareError::RelayUnavailable {
        binary: binary.to_string(),
    };

    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate
            .is_file()
            .then(|| candidate.to_path_buf())
            .ok_or_else(unavailable);
    }

    let path = std::env::var_os("PATH").ok_or_else(unavailable)?;
    std::env::split_paths(&path)
        .flat_map(|dir| {
            [
                dir.join(binary),
                dir.join(format!("{}{}", binary, std::env::consts::EXE_SUFFIX)),
            ]
        })
        .find(|p| p.is_file())
        .ok_or_else(unavailable)
}

/// Everything needed to launch a relay for one share.
#[derive(Debug)]
pub struct RelayLaunch<'a> {
    pub binary: &'a Path,
    /// User-level relay configuration; replaced by the session file when absent.
    pub base_config: &'a Path,
    pub tunnels: &'a TunnelConfiguration,
    pub required: RequiredKeys,
    pub control_api_port: u16,
    /// Relay host that needs no suffix in the session name.
    pub default_endpoint: &'a str,
}

/// Handle to a running relay and its reader task.
pub struct RelayProcess {
    stop: CancellationToken,
    reader: JoinHandle<()>,
}

impl RelayProcess {
    /// Kills the relay and waits for the reader to clean up.
    pub async fn stop(self) {
        self.stop.cancel();
        self.wait().await;
    }

    /// Waits for the reader task to finish, which happens once the session
    /// is cancelled or the relay exits.
    pub async fn wait(self) {
        if let Err(e) = self.reader.await {
            error!("Relay reader task failed: {}", e);
        }
    }
}

/// Launches the relay and starts publishing its events on `output`.
///
/// Fatal relay errors cancel `session`. Cancelling `session` kills the relay.
pub fn start(
    launch: RelayLaunch<'_>,
    output: UnboundedSender<ShareOutput>,
    session: CancellationToken,
) -> Result<RelayProcess> {
    let yaml = launch
        .tunnels
        .to_yaml()
        .map_err(|e| ShareError::Relay(format!("failed to serialize tunnel configuration: {}", e)))?;

    // The relay reads tunnel definitions from a file only
    let mut session_file = tempfile::Builder::new()
        .prefix("tunshare-")
        .suffix(".yml")
        .tempfile()?;
    session_file.write_all(yaml.as_bytes())?;
    session_file.flush()?;
    debug!("Generated relay configuration:\n{}", yaml);

    // The relay insists on two configs; reuse ours when the user has none
    let base_config = if launch.base_config.is_file() {
        launch.base_config
    } else {
        session_file.path()
    };

    let mut child = Command::new(launch.binary)
        .arg("start")
        .arg("--config")
        .arg(base_config)
        .arg("--config")
        .arg(session_file.path())
        .args(["--all", "--log", "stdout", "--log-format", "json", "--log-level", "debug"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    info!("Started relay process {:?}", child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ShareError::Relay("relay stdout was not captured".to_string()))?;

    let accumulator = SessionAccumulator::new(
        launch.required,
        launch.control_api_port,
        launch.default_endpoint,
    );
    let stop = session.child_token();

    let reader = tokio::spawn(read_events(
        child,
        BufReader::new(stdout),
        accumulator,
        output,
        session,
        stop.clone(),
        session_file,
    ));

    Ok(RelayProcess { stop, reader })
}

async fn read_events<R>(
    mut child: Child,
    stdout: BufReader<R>,
    mut accumulator: SessionAccumulator,
    output: UnboundedSender<ShareOutput>,
    session: CancellationToken,
    stop: CancellationToken,
    // Held until the reader exits so the file outlives the relay.
    _session_file: tempfile::NamedTempFile,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = stdout.lines();

    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                if !stop.is_cancelled() {
                    error!("Relay process exited unexpectedly");
                    let _ = output.send(ShareOutput::Error(
                        "The relay process exited unexpectedly".to_string(),
                    ));
                    session.cancel();
                }
                break;
            }
            Err(e) => {
                warn!("Failed to read relay output: {}", e);
                continue;
            }
        };

        debug!("relay: {}", line);
        let event = match events::parse_line(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failure handling relay output line: {} (`{}`)", e, line);
                continue;
            }
        };

        // Errors are fatal for the whole share
        match accumulator.apply(event) {
            Some(ShareOutput::Error(message)) => {
                error!("Error encountered with relay connection: {}", message);
                let _ = output.send(ShareOutput::Error(message));
                session.cancel();
                break;
            }
            Some(complete) => {
                info!("Relay session established");
                let _ = output.send(complete);
            }
            None => {}
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Relay process already gone: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fake_relay(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-relay");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn missing_binary_is_a_precondition_failure() {
        let err = ensure_available("definitely-not-a-relay-binary-4821").unwrap_err();
        assert!(matches!(err, ShareError::RelayUnavailable { .. }));
        assert!(ensure_available("/nonexistent/relay").is_err());
    }

    #[test]
    fn explicit_path_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let relay = fake_relay(dir.path(), "exit 0");
        assert_eq!(ensure_available(relay.to_str().unwrap()).unwrap(), relay);
    }

    #[tokio::test]
    async fn publishes_completed_session_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let relay = fake_relay(
            dir.path(),
            r#"echo 'garbage'
echo '{"msg":"decoded response","resp":{"Error":"","URL":"http://x","Proto":"http"}}'
exec sleep 30"#,
        );
        let tunnels = TunnelConfiguration::build(&ChannelRequest {
            http_port: Some(8080),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CancellationToken::new();

        let process = start(
            RelayLaunch {
                binary: &relay,
                base_config: &dir.path().join("missing.yml"),
                tunnels: &tunnels,
                required: RequiredKeys {
                    http: true,
                    ..Default::default()
                },
                control_api_port: 0,
                default_endpoint: "0.tcp.ngrok.io",
            },
            tx,
            session.clone(),
        )
        .unwrap();

        let item = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ShareOutput::Session(info) = item else {
            panic!("expected a session, got {:?}", item);
        };
        assert_eq!(info.http.as_deref(), Some("http://x"));

        session.cancel();
        tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn relay_error_cancels_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let relay = fake_relay(
            dir.path(),
            r#"echo '{"msg":"decoded response","resp":{"Error":"port in use"}}'
exec sleep 30"#,
        );
        let tunnels = TunnelConfiguration::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CancellationToken::new();

        let process = start(
            RelayLaunch {
                binary: &relay,
                base_config: &relay,
                tunnels: &tunnels,
                required: RequiredKeys::default(),
                control_api_port: 0,
                default_endpoint: "0.tcp.ngrok.io",
            },
            tx,
            session.clone(),
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), session.cancelled())
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ShareOutput::Error("port in use".to_string()))
        );
        process.wait().await;
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let relay = fake_relay(dir.path(), "exit 1");
        let tunnels = TunnelConfiguration::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CancellationToken::new();

        let process = start(
            RelayLaunch {
                binary: &relay,
                base_config: &relay,
                tunnels: &tunnels,
                required: RequiredKeys::default(),
                control_api_port: 0,
                default_endpoint: "0.tcp.ngrok.io",
            },
            tx,
            session.clone(),
        )
        .unwrap();

        process.wait().await;
        assert!(session.is_cancelled());
        assert!(matches!(rx.recv().await, Some(ShareOutput::Error(_))));
    }
}
