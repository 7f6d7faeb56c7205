use tokio::signal::unix::{Signal, SignalKind, signal};

use crate::error::MkvmError;

/// SIGINT and SIGTERM, raced against a run.
///
/// Handlers are registered by [`install`](Self::install), so once it returns
/// either signal is delivered here instead of terminating the process.
pub struct Shutdown {
    sigint: Signal,
    sigterm: Signal,
}

impl Shutdown {
    pub fn install() -> Result<Self, MkvmError> {
        let register = |kind: SignalKind, name: &'static str| {
            signal(kind).map_err(|source| MkvmError::SignalHandler {
                signal: name,
                source,
            })
        };
        Ok(Self {
            sigint: register(SignalKind::interrupt(), "SIGINT")?,
            sigterm: register(SignalKind::terminate(), "SIGTERM")?,
        })
    }

    /// Wait for the next signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}
