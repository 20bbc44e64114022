//! Coordinated shutdown of long-running components.
//!
//! Components come in two stages.  Serving components ([`spawn`]) watch the
//! shared [`CancellationToken`]; drain components ([`spawn_drain`]) watch a
//! separate drain token that is only cancelled once every serving component
//! has returned, so whatever the serving side produced while finishing its
//! in-flight work is still consumed.  [`ShutdownCoordinator::wait`] returns
//! once all of them have stopped:
//!
//! 1. until the token is cancelled, the first component to exit is a failure
//!    and triggers cancellation for the rest;
//! 2. after cancellation, serving components stop, then the drain token is
//!    cancelled and drain components stop;
//! 3. both stages share one `grace_period`; anything still running after it
//!    is aborted.
//!
//! The first error observed is the one returned.
//!
//! [`spawn`]: ShutdownCoordinator::spawn
//! [`spawn_drain`]: ShutdownCoordinator::spawn_drain

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("component '{name}' failed: {source}")]
    Component {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("component '{name}' exited before shutdown was requested")]
    ExitedEarly { name: String },

    #[error("component '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("components {pending:?} did not stop within {grace_period:?}")]
    Timeout {
        pending: Vec<String>,
        grace_period: Duration,
    },
}

impl ShutdownError {
    pub fn component(&self) -> Option<&str> {
        match self {
            ShutdownError::Component { name, .. }
            | ShutdownError::ExitedEarly { name }
            | ShutdownError::Panicked { name, .. } => Some(name),
            ShutdownError::Timeout { .. } => None,
        }
    }
}

type Joined = Result<(Id, anyhow::Result<()>), JoinError>;

pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain: CancellationToken,
    grace_period: Duration,
    tasks: JoinSet<anyhow::Result<()>>,
    drainers: JoinSet<anyhow::Result<()>>,
    names: HashMap<Id, String>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("grace_period", &self.grace_period)
            .field("components", &self.names.values().collect::<Vec<_>>())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self::with_token(CancellationToken::new(), grace_period)
    }

    pub fn with_token(token: CancellationToken, grace_period: Duration) -> Self {
        Self {
            token,
            drain: CancellationToken::new(),
            grace_period,
            tasks: JoinSet::new(),
            drainers: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// A handle on the shared cancellation signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancelled once every serving component has stopped, or when the grace
    /// period runs out.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Run a serving component. It should return once [`Self::token`] is
    /// cancelled.
    pub fn spawn<F>(&mut self, name: impl Into<String>, component: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.tasks.spawn(component);
        info!(component = %name, "component started");
        self.names.insert(handle.id(), name);
    }

    /// Run a drain component. It should return once [`Self::drain_token`]
    /// is cancelled.
    pub fn spawn_drain<F>(&mut self, name: impl Into<String>, component: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.drainers.spawn(component);
        info!(component = %name, "drain component started");
        self.names.insert(handle.id(), name);
    }

    /// Wait for cancellation or the first component exit, then for every
    /// component to stop.
    pub async fn wait(mut self) -> Result<(), ShutdownError> {
        let mut first_error = None;

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                info!("shutdown requested");
            }
            Some(joined) = self.tasks.join_next_with_id() => {
                let failure = self.early_exit(joined);
                error!(error = %failure, "component stopped unexpectedly, shutting down");
                first_error = Some(failure);
                self.token.cancel();
            }
            Some(joined) = self.drainers.join_next_with_id() => {
                let failure = self.early_exit(joined);
                error!(error = %failure, "drain component stopped unexpectedly, shutting down");
                first_error = Some(failure);
                self.token.cancel();
            }
        }

        let deadline = tokio::time::sleep(self.grace_period);
        tokio::pin!(deadline);

        loop {
            if self.tasks.is_empty() && !self.drain.is_cancelled() {
                info!("serving components stopped, draining");
                self.drain.cancel();
            }
            let stage = if self.tasks.is_empty() {
                &mut self.drainers
            } else {
                &mut self.tasks
            };

            tokio::select! {
                joined = stage.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    if let Some(failure) = self.settled(joined) {
                        if first_error.is_none() {
                            first_error = Some(failure);
                        } else {
                            warn!(error = %failure, "additional component failure during shutdown");
                        }
                    }
                }
                _ = &mut deadline => {
                    let mut pending: Vec<String> =
                        self.names.drain().map(|(_, name)| name).collect();
                    pending.sort();
                    warn!(
                        ?pending,
                        grace_period = ?self.grace_period,
                        "aborting components that did not stop"
                    );
                    self.drain.cancel();
                    self.tasks.abort_all();
                    self.drainers.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    while self.drainers.join_next().await.is_some() {}
                    let timeout = ShutdownError::Timeout {
                        pending,
                        grace_period: self.grace_period,
                    };
                    return Err(first_error.unwrap_or(timeout));
                }
            }
        }

        match first_error {
            Some(failure) => Err(failure),
            None => {
                info!("all components stopped");
                Ok(())
            }
        }
    }

    fn take_name(&mut self, id: Id) -> String {
        self.names
            .remove(&id)
            .unwrap_or_else(|| format!("task-{id}"))
    }

    /// Classify a component that finished before cancellation.
    fn early_exit(&mut self, joined: Joined) -> ShutdownError {
        match joined {
            Ok((id, Ok(()))) => ShutdownError::ExitedEarly {
                name: self.take_name(id),
            },
            Ok((id, Err(source))) => ShutdownError::Component {
                name: self.take_name(id),
                source,
            },
            Err(join_error) => self.join_failure(join_error),
        }
    }

    /// Classify a component that finished after cancellation.
    fn settled(&mut self, joined: Joined) -> Option<ShutdownError> {
        match joined {
            Ok((id, Ok(()))) => {
                info!(component = %self.take_name(id), "component stopped");
                None
            }
            Ok((id, Err(source))) => Some(ShutdownError::Component {
                name: self.take_name(id),
                source,
            }),
            Err(join_error) if join_error.is_cancelled() => {
                self.take_name(join_error.id());
                None
            }
            Err(join_error) => Some(self.join_failure(join_error)),
        }
    }

    fn join_failure(&mut self, join_error: JoinError) -> ShutdownError {
        let name = self.take_name(join_error.id());
        let message = if join_error.is_panic() {
            let panic = join_error.into_panic();
            panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_owned()))
                .unwrap_or_else(|| "unknown panic payload".to_owned())
        } else {
            join_error.to_string()
        };
        ShutdownError::Panicked { name, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const GRACE: Duration = Duration::from_millis(200);

    fn well_behaved(
        token: CancellationToken,
        stopped: Arc<AtomicBool>,
    ) -> impl Future<Output = anyhow::Result<()>> {
        async move {
            token.cancelled().await;
            stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn external_cancel_stops_every_component() {
        let mut coordinator = ShutdownCoordinator::new(GRACE);
        let token = coordinator.token();
        let http = Arc::new(AtomicBool::new(false));
        let grpc = Arc::new(AtomicBool::new(false));
        coordinator.spawn("http", well_behaved(token.clone(), Arc::clone(&http)));
        coordinator.spawn("grpc", well_behaved(token.clone(), Arc::clone(&grpc)));
        assert_eq!(coordinator.len(), 2);

        token.cancel();
        coordinator.wait().await.expect("clean shutdown");
        assert!(http.load(Ordering::SeqCst));
        assert!(grpc.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failing_component_cancels_the_rest() {
        let mut coordinator = ShutdownCoordinator::new(GRACE);
        let token = coordinator.token();
        let grpc = Arc::new(AtomicBool::new(false));
        coordinator.spawn("grpc", well_behaved(token.clone(), Arc::clone(&grpc)));
        coordinator.spawn("http", async { anyhow::bail!("address in use") });

        let err = coordinator.wait().await.unwrap_err();
        assert!(matches!(&err, ShutdownError::Component { name, .. } if name == "http"));
        assert!(err.to_string().contains("address in use"));
        assert!(token.is_cancelled());
        assert!(grpc.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn listener_returning_ok_early_is_a_failure() {
        let mut coordinator = ShutdownCoordinator::new(GRACE);
        coordinator.spawn("http", async { Ok(()) });
        let err = coordinator.wait().await.unwrap_err();
        assert!(matches!(err, ShutdownError::ExitedEarly { ref name } if name == "http"));
    }

    #[tokio::test]
    async fn first_error_is_terminal() {
        let mut coordinator = ShutdownCoordinator::new(GRACE);
        let token = coordinator.token();
        coordinator.spawn("consumer", {
            let token = token.clone();
            async move {
                token.cancelled().await;
                anyhow::bail!("flush failed")
            }
        });
        coordinator.spawn("grpc", async { anyhow::bail!("bind failed") });

        let err = coordinator.wait().await.unwrap_err();
        assert_eq!(err.component(), Some("grpc"));
    }

    #[tokio::test]
    async fn stragglers_are_aborted_after_grace_period() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let token = coordinator.token();
        let http = Arc::new(AtomicBool::new(false));
        coordinator.spawn("http", well_behaved(token.clone(), Arc::clone(&http)));
        coordinator.spawn("stuck", std::future::pending());

        token.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), coordinator.wait())
            .await
            .expect("wait must not hang")
            .unwrap_err();
        match err {
            ShutdownError::Timeout { pending, .. } => assert_eq!(pending, vec!["stuck"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(http.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_component_is_reported() {
        let mut coordinator = ShutdownCoordinator::new(GRACE);
        coordinator.spawn("consumer", async { panic!("boom") });
        let err = coordinator.wait().await.unwrap_err();
        match err {
            ShutdownError::Panicked { name, message } => {
                assert_eq!(name, "consumer");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_components_waits_for_cancel() {
        let coordinator = ShutdownCoordinator::new(GRACE);
        let token = coordinator.token();
        let waiter = tokio::spawn(coordinator.wait());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        token.cancel();
        waiter.await.unwrap().expect("clean");
    }

    #[tokio::test]
    async fn drain_starts_after_serving_components_stop() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coordinator.token();
        let drain = coordinator.drain_token();
        let http = Arc::new(AtomicBool::new(false));
        let saw_http_stopped = Arc::new(AtomicBool::new(false));

        coordinator.spawn("http", {
            let token = token.clone();
            let http = Arc::clone(&http);
            async move {
                token.cancelled().await;
                // Finishing an in-flight request.
                tokio::time::sleep(Duration::from_millis(50)).await;
                http.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        coordinator.spawn_drain("event-consumer", {
            let drain = drain.clone();
            let http = Arc::clone(&http);
            let saw = Arc::clone(&saw_http_stopped);
            async move {
                drain.cancelled().await;
                saw.store(http.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            }
        });

        token.cancel();
        assert!(!drain.is_cancelled());
        coordinator.wait().await.expect("clean shutdown");
        assert!(drain.is_cancelled());
        assert!(saw_http_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_component_exiting_early_is_a_failure() {
        let mut coordinator = ShutdownCoordinator::new(GRACE);
        let token = coordinator.token();
        let http = Arc::new(AtomicBool::new(false));
        coordinator.spawn("http", well_behaved(token.clone(), Arc::clone(&http)));
        coordinator.spawn_drain("event-consumer", async { Ok(()) });

        let err = coordinator.wait().await.unwrap_err();
        assert_eq!(err.component(), Some("event-consumer"));
        assert!(http.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stuck_serving_component_still_releases_the_drain() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let token = coordinator.token();
        let drain = coordinator.drain_token();
        coordinator.spawn("http", std::future::pending());
        coordinator.spawn_drain("event-consumer", well_behaved(drain.clone(), Arc::default()));

        token.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), coordinator.wait())
            .await
            .expect("wait must not hang")
            .unwrap_err();
        assert!(matches!(err, ShutdownError::Timeout { ref pending, .. } if pending.len() == 2));
        assert!(drain.is_cancelled());
    }
}
