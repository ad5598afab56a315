//! Termination requests delivered to the agent itself
//!
//! SIGTERM and SIGINT cancel whichever [`CancellationToken`] is currently
//! armed. Phases that honor termination arm a token for their duration;
//! while nothing is armed, signals are ignored.

use isorun_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TerminationSignal {
    armed: Arc<Mutex<Option<CancellationToken>>>,
    listener: Option<JoinHandle<()>>,
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationSignal {
    /// A signal source that only fires through [`TerminationSignal::trigger`]
    pub fn new() -> Self {
        Self {
            armed: Arc::new(Mutex::new(None)),
            listener: None,
        }
    }

    /// Listen for process termination signals. Requires a tokio runtime.
    pub fn install() -> Result<Self> {
        let mut signal = Self::new();
        let armed = Arc::clone(&signal.armed);
        signal.listener = Some(spawn_listener(armed)?);
        Ok(signal)
    }

    /// Start honoring termination requests; the returned token is
    /// cancelled by the next one
    pub fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.armed.lock() = Some(token.clone());
        token
    }

    /// Ignore termination requests until the next [`TerminationSignal::arm`]
    pub fn disarm(&self) {
        *self.armed.lock() = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Deliver a termination request
    pub fn trigger(&self) {
        deliver(&self.armed);
    }
}

impl Drop for TerminationSignal {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn deliver(armed: &Mutex<Option<CancellationToken>>) {
    match armed.lock().as_ref() {
        None => tracing::info!("termination request ignored, nothing to interrupt"),
        Some(token) if token.is_cancelled() => tracing::debug!("termination request already pending"),
        Some(token) => {
            tracing::warn!("termination requested");
            token.cancel();
        }
    }
}

#[cfg(unix)]
fn spawn_listener(armed: Arc<Mutex<Option<CancellationToken>>>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let install = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| Error::configuration(format!("cannot listen for {name}: {e}")))
    };
    let mut term = install(SignalKind::terminate(), "SIGTERM")?;
    let mut int = install(SignalKind::interrupt(), "SIGINT")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = term.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                received = int.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            deliver(&armed);
        }
    }))
}

#[cfg(not(unix))]
fn spawn_listener(armed: Arc<Mutex<Option<CancellationToken>>>) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            deliver(&armed);
        }
    }))
}
