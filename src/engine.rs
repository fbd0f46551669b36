//! Stateful navigation engine.
//!
//! Owns the current [`NavState`], the configuration and the monotonic fetch
//! generation counter. Callers feed events in one at a time and execute the
//! returned effects; the engine itself performs no I/O. The async
//! [`NavigationService`](crate::service::NavigationService) and the FFI layer
//! both drive one of these.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::NavigationConfig;
use crate::error::{NavigationError, OptionExt, Result};
use crate::progress::ProgressSnapshot;
use crate::route::RouteResponse;
use crate::session::{Session, SessionStatus, StartRequest};
use crate::state::{transition, Effect, NavEvent, NavState, TransitionContext};
use crate::LocationFix;

/// What observers see after every processed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationUpdate {
    pub status: SessionStatus,
    pub session: Option<Session>,
    pub progress: Option<ProgressSnapshot>,
    /// Message of the error that put the engine into `Error`
    pub error: Option<String>,
}

impl Default for NavigationUpdate {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            session: None,
            progress: None,
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct NavigationEngine {
    state: NavState,
    config: NavigationConfig,
    /// Last generation handed out; 0 means no fetch yet
    generation: u64,
}

impl Default for NavigationEngine {
    fn default() -> Self {
        Self::new(NavigationConfig::default())
    }
}

impl NavigationEngine {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            state: NavState::Idle,
            config,
            generation: 0,
        }
    }

    /// Apply one event and return the effects to execute.
    ///
    /// A rejected event leaves the state untouched and returns the error.
    pub fn handle(&mut self, event: NavEvent, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        let ctx = TransitionContext {
            config: &self.config,
            now,
            next_generation: self.generation + 1,
        };
        let state = std::mem::take(&mut self.state);
        let outcome = transition(state, event, &ctx);

        if outcome.fetch().is_some() {
            self.generation += 1;
        }
        self.state = outcome.state;

        match outcome.rejected {
            Some(error) => Err(error),
            None => {
                if !outcome.effects.is_empty() {
                    debug!(
                        "[NavigationEngine] {} -> {} effects",
                        self.state.status(),
                        outcome.effects.len()
                    );
                }
                Ok(outcome.effects)
            }
        }
    }

    // ========================================================================
    // Convenience wrappers
    // ========================================================================

    pub fn start(&mut self, request: StartRequest, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::Start(request), now)
    }

    pub fn route_ready(
        &mut self,
        generation: u64,
        response: RouteResponse,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        self.handle(NavEvent::RouteReady { generation, response }, now)
    }

    pub fn route_failed(
        &mut self,
        generation: u64,
        error: NavigationError,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        self.handle(NavEvent::RouteFailed { generation, error }, now)
    }

    pub fn update_location(&mut self, fix: LocationFix, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::Fix(fix), now)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::Pause, now)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::Resume, now)
    }

    pub fn recalculate(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::Recalculate, now)
    }

    pub fn retry_due(&mut self, generation: u64, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::RetryDue { generation }, now)
    }

    pub fn end(&mut self, completed: bool, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::End { completed }, now)
    }

    pub fn reset(&mut self, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        self.handle(NavEvent::Reset, now)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> &NavState {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn session(&self) -> Option<&Session> {
        self.state.session()
    }

    /// Session of the current run, or a `StateTransition` error naming `operation`.
    pub fn require_session(&self, operation: &'static str) -> Result<&Session> {
        self.session().ok_or_state(operation, self.status())
    }

    pub fn progress(&self) -> Option<&ProgressSnapshot> {
        self.state.progress()
    }

    pub fn last_error(&self) -> Option<&NavigationError> {
        self.state.error()
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect from the next event.
    pub fn set_config(&mut self, config: NavigationConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Last fetch generation handed out.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> NavigationUpdate {
        NavigationUpdate {
            status: self.status(),
            session: self.session().cloned(),
            progress: self.progress().cloned(),
            error: self.last_error().map(|e| e.to_string()),
        }
    }
}
