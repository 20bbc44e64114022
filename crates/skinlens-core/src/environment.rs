//! Process-wide engine environment.
//!
//! Inference runtimes such as ONNX Runtime keep global state that must be
//! initialised before the first session is created and torn down after the
//! last one is gone.  [`Environment`] makes that lifecycle explicit: every
//! [`crate::ModelSession`] holds an [`EnvironmentLease`], the first lease runs
//! [`EnvironmentBackend::init`] and releasing the last one runs
//! [`EnvironmentBackend::teardown`].

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::EngineError;

/// Global init/teardown hooks for one inference runtime.
pub trait EnvironmentBackend: Send + Sync + 'static {
    fn init(&self) -> Result<(), EngineError>;
    fn teardown(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("failed to initialize '{name}' environment")]
    Init {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to tear down '{name}' environment")]
    Teardown {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("environment lease already released")]
    AlreadyReleased,

    #[error("Lock poisoned while trying to {operation}")]
    LockPoisoned { operation: &'static str },
}

#[derive(Debug, Default)]
struct LeaseState {
    leases: usize,
    initialized: bool,
}

/// A reference-counted engine environment.
pub struct Environment {
    name: String,
    backend: Box<dyn EnvironmentBackend>,
    state: Mutex<LeaseState>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("leases", &self.lease_count())
            .finish()
    }
}

impl Environment {
    pub fn new(name: impl Into<String>, backend: impl EnvironmentBackend) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backend: Box::new(backend),
            state: Mutex::new(LeaseState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of outstanding leases.
    pub fn lease_count(&self) -> usize {
        self.state.lock().map(|s| s.leases).unwrap_or(0)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().map(|s| s.initialized).unwrap_or(false)
    }

    /// Take a lease, initialising the environment if this is the first one.
    pub fn acquire(self: &Arc<Self>) -> Result<EnvironmentLease, EnvironmentError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EnvironmentError::LockPoisoned {
                operation: "acquire environment lease",
            })?;

        if !state.initialized {
            self.backend
                .init()
                .map_err(|source| EnvironmentError::Init {
                    name: self.name.clone(),
                    source,
                })?;
            state.initialized = true;
            info!(environment = %self.name, "engine environment initialised");
        }
        state.leases += 1;
        debug!(environment = %self.name, leases = state.leases, "environment lease acquired");

        Ok(EnvironmentLease {
            environment: Some(Arc::clone(self)),
        })
    }

    fn release_one(&self) -> Result<(), EnvironmentError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EnvironmentError::LockPoisoned {
                operation: "release environment lease",
            })?;

        state.leases = state.leases.saturating_sub(1);
        debug!(environment = %self.name, leases = state.leases, "environment lease released");
        if state.leases > 0 || !state.initialized {
            return Ok(());
        }

        // Mark torn down even when the hook fails so a later acquire re-runs init.
        state.initialized = false;
        self.backend
            .teardown()
            .map_err(|source| EnvironmentError::Teardown {
                name: self.name.clone(),
                source,
            })?;
        info!(environment = %self.name, "engine environment torn down");
        Ok(())
    }
}

/// Ownership of one reference to an [`Environment`].
///
/// Call [`EnvironmentLease::release`] to observe teardown failures; dropping an
/// unreleased lease releases it and logs any failure.
#[derive(Debug)]
pub struct EnvironmentLease {
    environment: Option<Arc<Environment>>,
}

impl EnvironmentLease {
    pub fn release(&mut self) -> Result<(), EnvironmentError> {
        let environment = self
            .environment
            .take()
            .ok_or(EnvironmentError::AlreadyReleased)?;
        environment.release_one()
    }

    pub fn is_released(&self) -> bool {
        self.environment.is_none()
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.environment.is_some() {
            if let Err(e) = self.release() {
                warn!(error = %e, "failed to release environment lease on drop");
            }
        }
    }
}

/// Backend for runtimes without global state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl EnvironmentBackend for NoopBackend {
    fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn teardown(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        inits: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
        fail_teardown: bool,
    }

    impl EnvironmentBackend for CountingBackend {
        fn init(&self) -> Result<(), EngineError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn teardown(&self) -> Result<(), EngineError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown {
                Err(EngineError::Release("teardown refused".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn init_once_teardown_after_last_lease() {
        let backend = CountingBackend::default();
        let inits = Arc::clone(&backend.inits);
        let teardowns = Arc::clone(&backend.teardowns);
        let env = Environment::new("test", backend);

        let mut a = env.acquire().expect("first lease");
        let mut b = env.acquire().expect("second lease");
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(env.lease_count(), 2);

        a.release().expect("release a");
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        assert!(env.is_initialized());

        b.release().expect("release b");
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(!env.is_initialized());
    }

    #[test]
    fn double_release_is_reported() {
        let env = Environment::new("test", NoopBackend);
        let mut lease = env.acquire().expect("lease");
        lease.release().expect("first release");
        assert!(matches!(
            lease.release(),
            Err(EnvironmentError::AlreadyReleased)
        ));
        assert_eq!(env.lease_count(), 0);
    }

    #[test]
    fn drop_releases_lease() {
        let backend = CountingBackend::default();
        let teardowns = Arc::clone(&backend.teardowns);
        let env = Environment::new("test", backend);
        {
            let _lease = env.acquire().expect("lease");
        }
        assert_eq!(env.lease_count(), 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_failure_surfaces_and_allows_reinit() {
        let backend = CountingBackend {
            fail_teardown: true,
            ..Default::default()
        };
        let inits = Arc::clone(&backend.inits);
        let env = Environment::new("test", backend);

        let mut lease = env.acquire().expect("lease");
        assert!(matches!(
            lease.release(),
            Err(EnvironmentError::Teardown { .. })
        ));

        let _again = env.acquire().expect("re-acquire");
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }
}
