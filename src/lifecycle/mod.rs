//! Process-wide interrupt handling.
//!
//! One `ctrlc` handler is registered per process. The first interrupt
//! cancels the session's root [`CancellationToken`], which every long-running
//! task observes; teardown then runs in reverse order of acquisition. A
//! second interrupt exits immediately, like the default handler would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status used when a second interrupt forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    Cancel,
    Exit,
}

#[derive(Debug, Default)]
struct InterruptState {
    received: AtomicUsize,
}

impl InterruptState {
    fn on_interrupt(&self, token: &CancellationToken) -> InterruptAction {
        if self.received.fetch_add(1, Ordering::SeqCst) == 0 {
            token.cancel();
            InterruptAction::Cancel
        } else {
            InterruptAction::Exit
        }
    }
}

/// Creates the root token and wires SIGINT to it.
pub fn install_interrupt_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let state = Arc::new(InterruptState::default());

    let handler_token = token.clone();
    ctrlc::set_handler(move || match state.on_interrupt(&handler_token) {
        InterruptAction::Cancel => {
            info!("Interrupt received, shutting down");
            eprintln!("\nShutting down. Press Ctrl-C again to force exit.");
        }
        InterruptAction::Exit => {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
    .context("Failed to set interrupt handler")?;

    Ok(token)
}

/// Runs a blocking `prompt` off the runtime, giving up once `token` is
/// cancelled.
///
/// Returns `Ok(None)` when interrupted. The prompt thread is left behind;
/// the binary shuts its runtime down without waiting for it.
pub async fn prompt_unless_cancelled<T, F>(token: &CancellationToken, prompt: F) -> Result<Option<T>>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let answer = tokio::task::spawn_blocking(prompt);
    tokio::select! {
        _ = token.cancelled() => {
            info!("Prompt abandoned after interrupt");
            Ok(None)
        }
        joined = answer => joined.context("Prompt task failed")?.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[tokio::test]
    async fn interrupted_prompt_does_not_block() {
        let token = CancellationToken::new();
        let (unblock, blocked) = mpsc::channel::<()>();
        token.cancel();

        let answer = prompt_unless_cancelled(&token, move || {
            let _ = blocked.recv();
            Ok("secret".to_string())
        })
        .await
        .unwrap();
        assert_eq!(answer, None);
        drop(unblock);
    }

    #[tokio::test]
    async fn answered_prompt_is_returned() {
        let token = CancellationToken::new();
        let answer = prompt_unless_cancelled(&token, || Ok(4))
            .await
            .unwrap();
        assert_eq!(answer, Some(4));

        let failed = prompt_unless_cancelled(&token, || -> Result<u8> { anyhow::bail!("no tty") }).await;
        assert!(failed.is_err());
    }

    #[test]
    fn first_interrupt_cancels_second_exits() {
        let state = InterruptState::default();
        let token = CancellationToken::new();
        let child = token.child_token();

        assert_eq!(state.on_interrupt(&token), InterruptAction::Cancel);
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());

        assert_eq!(state.on_interrupt(&token), InterruptAction::Exit);
        assert_eq!(state.on_interrupt(&token), InterruptAction::Exit);
    }
}
