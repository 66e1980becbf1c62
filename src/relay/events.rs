//! Relay log stream parsing.
//!
//! The relay logs one JSON object per line. Two messages matter:
//!
//! - `"decoded response"` carries `resp.{Error, URL, Proto}` for each tunnel
//!   the relay brought up (or failed to).
//! - `"start tunnel listen"` with a non-nil `err` means a tunnel could not
//!   start at all.
//!
//! Everything else is ignored.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::wordlist::SessionName;

const MSG_DECODED_RESPONSE: &str = "decoded response";
const MSG_START_TUNNEL_LISTEN: &str = "start tunnel listen";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A tunnel is up at `url`.
    Established { url: String, proto: String },
    /// The relay refused a tunnel. Fatal.
    TunnelError(String),
    /// A tunnel listener failed to start. Fatal.
    ListenFailed(String),
    Ignored,
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    resp: Option<Value>,
    #[serde(default)]
    err: Option<Value>,
}

fn string_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Parses one relay log line.
pub fn parse_line(line: &str) -> Result<RelayEvent, serde_json::Error> {
    let line: LogLine = serde_json::from_str(line)?;

    match line.msg.as_deref() {
        Some(MSG_DECODED_RESPONSE) => {
            let Some(resp) = line.resp else {
                return Ok(RelayEvent::Ignored);
            };
            // An error wins even when a URL came with it
            if let Some(error) = string_field(&resp, "Error").filter(|e| !e.is_empty()) {
                return Ok(RelayEvent::TunnelError(error.to_string()));
            }
            match (string_field(&resp, "URL"), string_field(&resp, "Proto")) {
                (Some(url), Some(proto)) if !url.is_empty() && !proto.is_empty() => {
                    Ok(RelayEvent::Established {
                        url: url.to_string(),
                        proto: proto.to_string(),
                    })
                }
                _ => Ok(RelayEvent::Ignored),
            }
        }
        Some(MSG_START_TUNNEL_LISTEN) => match line.err {
            Some(Value::String(err)) if err != "<nil>" && !err.is_empty() => {
                Ok(RelayEvent::ListenFailed(err))
            }
            // The relay logs a literal "<nil>" on success
            Some(Value::Null) | Some(Value::String(_)) | None => Ok(RelayEvent::Ignored),
            Some(other) => Ok(RelayEvent::ListenFailed(other.to_string())),
        },
        _ => Ok(RelayEvent::Ignored),
    }
}

/// Public endpoints of a running share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub http: Option<String>,
    pub https: Option<String>,
    pub tcp: Option<String>,
    pub name: Option<SessionName>,
}

/// Which parts of a [`SessionInfo`] must be present before it is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequiredKeys {
    pub http: bool,
    pub https: bool,
    pub name: bool,
}

impl RequiredKeys {
    pub fn is_empty(&self) -> bool {
        !(self.http || self.https || self.name)
    }

    fn satisfied_by(&self, info: &SessionInfo) -> bool {
        !self.is_empty()
            && (!self.http || info.http.is_some())
            && (!self.https || info.https.is_some())
            && (!self.name || info.name.is_some())
    }
}

/// Items on the share output queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutput {
    /// Fatal relay error, verbatim.
    Error(String),
    /// A complete set of endpoints.
    Session(SessionInfo),
}

/// Folds relay events into [`SessionInfo`] and emits it once complete.
#[derive(Debug)]
pub struct SessionAccumulator {
    required: RequiredKeys,
    control_api_port: u16,
    default_endpoint: String,
    info: SessionInfo,
}

impl SessionAccumulator {
    pub fn new(required: RequiredKeys, control_api_port: u16, default_endpoint: impl Into<String>) -> Self {
        Self {
            required,
            control_api_port,
            default_endpoint: default_endpoint.into(),
            info: SessionInfo::default(),
        }
    }

    /// Applies `event`, returning what should go on the output queue.
    ///
    /// After a complete session is returned the accumulator starts over, so
    /// a long-lived relay may complete more than once.
    pub fn apply(&mut self, event: RelayEvent) -> Option<ShareOutput> {
        match event {
            RelayEvent::TunnelError(error) | RelayEvent::ListenFailed(error) => {
                return Some(ShareOutput::Error(error));
            }
            RelayEvent::Established { url, .. } => self.record(&url),
            RelayEvent::Ignored => {}
        }

        if self.required.satisfied_by(&self.info) {
            return Some(ShareOutput::Session(std::mem::take(&mut self.info)));
        }
        None
    }

    fn record(&mut self, raw: &str) {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                warn!("Failed to parse relay URL `{}`: {}", raw, e);
                return;
            }
        };

        match url.scheme() {
            "http" => self.info.http = Some(raw.to_string()),
            "https" => self.info.https = Some(raw.to_string()),
            "tcp" => {
                let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
                    warn!("TCP URL without host or port: `{}`", raw);
                    return;
                };
                // Only non-default relay hosts get the `@host` suffix
                let relay_host = (host != self.default_endpoint).then(|| relay_host_number(host));
                self.info.tcp = Some(raw.to_string());
                self.info.name = Some(SessionName::new(port, self.control_api_port, relay_host));
            }
            other => warn!("Unhandled URL scheme detected: {} - `{}`", other, raw),
        }
    }
}

/// Leading number of a relay host such as `2.tcp.ngrok.io`.
pub fn relay_host_number(host: &str) -> u64 {
    host.split('.')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
