//! Service lifecycle
//!
//! Long-running components (remote shims, the launcher) share a start/close lifecycle.
//! `StateMachine` enforces that each transition happens exactly once.

use crate::error::ServiceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Start/stop lifecycle of a managed component
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable name used in logs and health reports
    fn name(&self) -> String;

    /// Start background work
    async fn start(&self) -> Result<(), ServiceError>;

    /// Stop background work and release resources
    async fn close(&self) -> Result<(), ServiceError>;

    /// Readiness check
    fn ready(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Health of this service keyed by name
    fn health_report(&self) -> HashMap<String, Result<(), String>> {
        HashMap::from([(self.name(), self.ready().map_err(|e| e.to_string()))])
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, not yet started
    Unstarted,
    /// Running
    Started,
    /// Closed; cannot be restarted
    Stopped,
}

/// Once-only start/stop guard
#[derive(Debug)]
pub struct StateMachine {
    name: String,
    state: Mutex<ServiceState>,
}

impl StateMachine {
    /// Create a guard in the `Unstarted` state
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ServiceState::Unstarted),
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` and move to `Started`; fails unless currently `Unstarted`
    ///
    /// If `f` fails the state stays `Unstarted`.
    pub fn start_once<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            ServiceState::Unstarted => {
                f()?;
                *state = ServiceState::Started;
                Ok(())
            }
            ServiceState::Started | ServiceState::Stopped => Err(ServiceError::AlreadyStarted {
                name: self.name.clone(),
            }),
        }
    }

    /// Run `f` and move to `Stopped`; fails unless currently `Started`
    ///
    /// The state becomes `Stopped` even if `f` fails.
    pub fn stop_once<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            ServiceState::Started => {
                *state = ServiceState::Stopped;
                f()
            }
            ServiceState::Unstarted => Err(ServiceError::NotStarted {
                name: self.name.clone(),
            }),
            ServiceState::Stopped => Err(ServiceError::AlreadyStopped {
                name: self.name.clone(),
            }),
        }
    }

    /// Ok while started
    pub fn ready(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Started => Ok(()),
            ServiceState::Unstarted => Err(ServiceError::NotStarted {
                name: self.name.clone(),
            }),
            ServiceState::Stopped => Err(ServiceError::AlreadyStopped {
                name: self.name.clone(),
            }),
        }
    }
}
