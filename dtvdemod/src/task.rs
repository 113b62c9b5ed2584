//! Supervised background tasks.
//!
//! A [`SupervisedTask`] owns at most one running tokio task together with
//! the token used to cancel it. Stopping cancels and joins, so register
//! sessions held by the task are released before `stop` returns.

use std::future::Future;

use log::{debug, error, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SupervisedTask {
    name: &'static str,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl SupervisedTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the task body with a fresh cancellation token.
    ///
    /// Returns false, spawning nothing, if the task is already running.
    pub fn start<F, Fut>(&mut self, body: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            warn!("[Task] {} already running", self.name);
            return false;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        debug!("[Task] {} started", self.name);
        self.running = Some((token, handle));
        true
    }

    /// Cancel and join. A stopped task is left alone.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.running.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!("[Task] {} panicked: {}", self.name, e);
            }
        }
        debug!("[Task] {} stopped", self.name);
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        if let Some((token, _)) = self.running.take() {
            token.cancel();
        }
    }
}
