//! Background ticker threads.
//!
//! A `Periodic` owns one named thread that calls `tick` every `interval` on
//! a weakly-held target. The thread exits when the stop channel closes (the
//! `Periodic` is dropped) or when the target itself is gone, so a ticker
//! never keeps its owner alive.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};
use tracing::{debug, warn};

pub(crate) struct Periodic {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub(crate) fn spawn<T, F>(name: &str, target: Weak<T>, interval: Duration, tick: F) -> std::io::Result<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || loop {
            select! {
                recv(stop_rx) -> _ => break,
                default(interval) => {
                    let Some(strong) = target.upgrade() else {
                        break;
                    };
                    tick(&strong);
                }
            }
        })?;
        debug!(worker = name, interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "worker started");

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Closes the stop channel and joins the thread. Idempotent.
    pub(crate) fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Periodic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Periodic")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}
