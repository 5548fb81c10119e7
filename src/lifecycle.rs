//! Startup/shutdown state machine
//!
//! One instance is shared between the surface owner (the platform bridge) and
//! the server thread. States only move forward, one step at a time, and each
//! step has a single permitted writer: the surface owner writes the
//! `Request*` states and the server writes everything else. Either side
//! blocks on a condition variable until the state it waits for is reached.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    RequestStartup,
    ResponseStartingUp,
    ResponseStartedUp,
    RequestShutdown,
    ResponseShuttingDown,
    ResponseShutdown,
}

/// Who is allowed to write a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    SurfaceOwner,
    Server,
}

impl LifecycleState {
    /// The only state that may follow this one
    pub fn next(self) -> Option<Self> {
        use LifecycleState::*;
        match self {
            Uninitialized => Some(Initialized),
            Initialized => Some(RequestStartup),
            RequestStartup => Some(ResponseStartingUp),
            ResponseStartingUp => Some(ResponseStartedUp),
            ResponseStartedUp => Some(RequestShutdown),
            RequestShutdown => Some(ResponseShuttingDown),
            ResponseShuttingDown => Some(ResponseShutdown),
            ResponseShutdown => None,
        }
    }

    pub fn writer(self) -> Side {
        match self {
            LifecycleState::RequestStartup | LifecycleState::RequestShutdown => Side::SurfaceOwner,
            _ => Side::Server,
        }
    }

    pub fn as_str(self) -> &'static str {
        use LifecycleState::*;
        match self {
            Uninitialized => "uninitialized",
            Initialized => "initialized",
            RequestStartup => "request_startup",
            ResponseStartingUp => "response_starting_up",
            ResponseStartedUp => "response_started_up",
            RequestShutdown => "request_shutdown",
            ResponseShuttingDown => "response_shutting_down",
            ResponseShutdown => "response_shutdown",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("{side:?} may not write {state}")]
    WrongSide { state: LifecycleState, side: Side },

    #[error("lifecycle aborted: {0}")]
    Aborted(String),

    #[error("timed out waiting for {0}")]
    TimedOut(LifecycleState),
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    history: Vec<LifecycleState>,
    surface_size: Option<(u32, u32)>,
    aborted: Option<String>,
}

#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LifecycleState::Uninitialized,
                history: Vec::new(),
                surface_size: None,
                aborted: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Every state entered so far, in order
    pub fn history(&self) -> Vec<LifecycleState> {
        self.lock().history.clone()
    }

    /// Surface size supplied with the startup request
    pub fn surface_size(&self) -> Option<(u32, u32)> {
        self.lock().surface_size
    }

    /// Whether serving threads should wind down: shutdown was requested or the lifecycle aborted
    pub fn shutdown_requested(&self) -> bool {
        let inner = self.lock();
        inner.state >= LifecycleState::RequestShutdown || inner.aborted.is_some()
    }

    /// Move to `to` on behalf of `side`
    pub fn advance(&self, side: Side, to: LifecycleState) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.aborted {
            return Err(LifecycleError::Aborted(reason.clone()));
        }
        if inner.state.next() != Some(to) {
            return Err(LifecycleError::InvalidTransition {
                from: inner.state,
                to,
            });
        }
        if to.writer() != side {
            return Err(LifecycleError::WrongSide { state: to, side });
        }

        debug!("Lifecycle {} -> {}", inner.state, to);
        inner.state = to;
        inner.history.push(to);
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    /// Surface owner: ask the server to start against a `width` x `height` surface
    pub fn request_startup(&self, width: u32, height: u32) -> Result<(), LifecycleError> {
        self.lock().surface_size = Some((width, height));
        self.advance(Side::SurfaceOwner, LifecycleState::RequestStartup)
    }

    pub fn request_shutdown(&self) -> Result<(), LifecycleError> {
        self.advance(Side::SurfaceOwner, LifecycleState::RequestShutdown)
    }

    /// Fail every current and future wait with `reason`
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.lock();
        if inner.aborted.is_none() {
            error!("Lifecycle aborted in state {}: {}", inner.state, reason);
            inner.aborted = Some(reason);
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Block until `target` (or a later state) is reached
    pub fn wait_for(&self, target: LifecycleState) -> Result<(), LifecycleError> {
        let mut inner = self.lock();
        loop {
            if inner.state >= target {
                return Ok(());
            }
            if let Some(reason) = &inner.aborted {
                return Err(LifecycleError::Aborted(reason.clone()));
            }
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_for_timeout(
        &self,
        target: LifecycleState,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.state >= target {
                return Ok(());
            }
            if let Some(reason) = &inner.aborted {
                return Err(LifecycleError::Aborted(reason.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::TimedOut(target));
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
