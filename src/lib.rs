//! # tunshare - Share a Machine Through a Relay Tunnel
//!
//! tunshare makes a local machine reachable from anywhere by driving an
//! external relay process (ngrok or compatible). A share exposes HTTP and
//! HTTPS endpoints and, optionally, SSH or full machine access that peers
//! reach with `tunshare connect`.
//!
//! ## Quick Start
//!
//! ```bash
//! # Share the HTTP server of the default machine
//! tunshare share
//!
//! # Share with SSH access, then connect from elsewhere
//! tunshare share --ssh
//! tunshare connect --ssh able_acid:bake_cat
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use tunshare::config::Settings;
//! use tunshare::lifecycle::install_interrupt_handler;
//! use tunshare::share::{Args as ShareArgs, run_share};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! let token = install_interrupt_handler()?;
//! let args = ShareArgs {
//!     http_port: Some(8080),
//!     ..Default::default()
//! };
//! run_share(args, settings, token).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[Word list](wordlist)**: speakable share names
//! - **[Resources](resource)**: lock-file arbitrated IPs and ports
//! - **[Detection](detect)**: racing HTTP probes
//! - **[Relay](relay)**: relay process supervision and its event stream
//! - **[Control API](api)**: TLS endpoints describing a share
//! - **[Share](share)** and **[Connect](connect)**: the two sessions
//! - **[Lifecycle](lifecycle)**: interrupt handling and cancellation
//! - **[Host](host)**: machines and proxy hosts the sessions drive
//!
//! ## Cancellation
//!
//! Every session runs under one `CancellationToken`. Ctrl-C, a fatal relay
//! error, or a lost connection cancels it, and teardown releases resources
//! in reverse order of acquisition.

pub mod api;
pub mod config;
pub mod connect;
pub mod detect;
pub mod error;
pub mod host;
pub mod keys;
pub mod lifecycle;
pub mod relay;
pub mod resource;
pub mod share;
pub mod wordlist;
