//! Navigation state machine.
//!
//! The lifecycle is a closed enum of states, each carrying only the data that
//! state needs. [`transition`] is a pure function from `(state, event)` to the
//! next state plus a list of [`Effect`]s for the driver to execute (start or
//! stop the location stream, fetch a route, persist, notify observers).
//!
//! ```text
//! Idle -> Loading -> Active <-> Paused
//!                      |  ^
//!                      v  |
//!                  Recalculating
//! Active | Paused | Recalculating -> Arrived | Cancelled | Error
//! ```
//!
//! Route fetches are tagged with a generation. Results and retry timers whose
//! generation does not match the fetch the current state waits for are stale
//! and ignored.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::NavigationConfig;
use crate::error::NavigationError;
use crate::eta::EtaEstimator;
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::route::{Maneuver, PlannedRoute, RouteRequest, RouteResponse};
use crate::session::{Session, SessionStatus, StartRequest};
use crate::{Coordinate, LocationFix};

// ============================================================================
// States
// ============================================================================

/// Waiting for the initial route.
#[derive(Debug, Clone)]
pub struct Loading {
    pub generation: u64,
    pub request: StartRequest,
    pub requested_at: DateTime<Utc>,
}

/// A session being tracked (active or paused).
#[derive(Debug, Clone)]
pub struct Tracking {
    pub session: Session,
    pub progress: Option<ProgressSnapshot>,
    pub last_fix: Option<LocationFix>,
    /// Consecutive off-route fixes
    pub off_route_streak: u32,
    /// Step whose approach was already announced
    pub announced_step: Option<usize>,
}

impl Tracking {
    fn new(session: Session) -> Self {
        Self {
            session,
            progress: None,
            last_fix: None,
            off_route_streak: 0,
            announced_step: None,
        }
    }

    fn with_status(self, status: SessionStatus) -> Self {
        Self {
            session: self.session.with_status(status),
            ..self
        }
    }
}

/// Fetching a replacement route.
#[derive(Debug, Clone)]
pub struct Recalculating {
    pub tracking: Tracking,
    /// Generation of the fetch in flight, or of the last failed one while a retry is scheduled
    pub generation: u64,
    /// Failed attempts so far
    pub failures: u32,
    pub awaiting_retry: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Finished {
    pub session: Option<Session>,
    pub progress: Option<ProgressSnapshot>,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub error: NavigationError,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Default)]
pub enum NavState {
    #[default]
    Idle,
    Loading(Loading),
    Active(Tracking),
    Paused(Tracking),
    Recalculating(Recalculating),
    Arrived(Finished),
    Cancelled(Finished),
    Error(Failure),
}

impl NavState {
    pub fn status(&self) -> SessionStatus {
        match self {
            NavState::Idle => SessionStatus::Idle,
            NavState::Loading(_) => SessionStatus::Loading,
            NavState::Active(_) => SessionStatus::Active,
            NavState::Paused(_) => SessionStatus::Paused,
            NavState::Recalculating(_) => SessionStatus::Recalculating,
            NavState::Arrived(_) => SessionStatus::Arrived,
            NavState::Cancelled(_) => SessionStatus::Cancelled,
            NavState::Error(_) => SessionStatus::Error,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            NavState::Active(t) | NavState::Paused(t) => Some(&t.session),
            NavState::Recalculating(r) => Some(&r.tracking.session),
            NavState::Arrived(f) | NavState::Cancelled(f) => f.session.as_ref(),
            NavState::Error(e) => e.session.as_ref(),
            NavState::Idle | NavState::Loading(_) => None,
        }
    }

    pub fn progress(&self) -> Option<&ProgressSnapshot> {
        match self {
            NavState::Active(t) | NavState::Paused(t) => t.progress.as_ref(),
            NavState::Recalculating(r) => r.tracking.progress.as_ref(),
            NavState::Arrived(f) | NavState::Cancelled(f) => f.progress.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&NavigationError> {
        match self {
            NavState::Error(e) => Some(&e.error),
            _ => None,
        }
    }

    /// Generation of the route fetch this state is waiting for, if any.
    pub fn pending_generation(&self) -> Option<u64> {
        match self {
            NavState::Loading(l) => Some(l.generation),
            NavState::Recalculating(r) if !r.awaiting_retry => Some(r.generation),
            _ => None,
        }
    }
}

// ============================================================================
// Events, Effects, Notices
// ============================================================================

#[derive(Debug, Clone)]
pub enum NavEvent {
    Start(StartRequest),
    RouteReady { generation: u64, response: RouteResponse },
    RouteFailed { generation: u64, error: NavigationError },
    Fix(LocationFix),
    Pause,
    Resume,
    Recalculate,
    RetryDue { generation: u64 },
    End { completed: bool },
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPurpose {
    Initial,
    Recalculation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteFetch {
    pub generation: u64,
    pub request: RouteRequest,
    pub purpose: FetchPurpose,
}

/// I/O the driver must perform after a transition, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Effect {
    StartLocation,
    StopLocation,
    FetchRoute(RouteFetch),
    CancelFetch { generation: u64 },
    ScheduleRetry { generation: u64, delay_ms: u64 },
    SaveSession(Session),
    UpdateStatus { session_id: String, status: SessionStatus },
    DeleteProgress { session_id: String },
    Notify(NavigationNotice),
}

/// One-shot notices for the voice/UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NavigationNotice {
    Started {
        session_id: String,
        destination_name: Option<String>,
        total_distance_m: f64,
        total_duration_s: f64,
    },
    ApproachingTurn {
        step_index: usize,
        instruction: String,
        maneuver: Maneuver,
        distance_m: f64,
    },
    OffRoute {
        distance_from_route_m: f64,
    },
    Rerouted {
        session_id: String,
        total_distance_m: f64,
        recalculation_count: u32,
    },
    Arrived {
        session_id: String,
        destination_name: Option<String>,
    },
    Failed {
        message: String,
        recoverable: bool,
    },
    PersistenceFailed {
        message: String,
    },
}

impl NavigationNotice {
    fn failed(error: &NavigationError) -> Self {
        NavigationNotice::Failed {
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }

    fn arrived(session: &Session) -> Self {
        NavigationNotice::Arrived {
            session_id: session.id.clone(),
            destination_name: session.destination_name.clone(),
        }
    }
}

// ============================================================================
// Transition
// ============================================================================

/// Inputs a transition needs besides the state and event.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub config: &'a NavigationConfig,
    pub now: DateTime<Utc>,
    /// Generation to tag a new route fetch with
    pub next_generation: u64,
}

/// Result of applying one event.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: NavState,
    pub effects: Vec<Effect>,
    /// Set when the event was not valid in the current state; `state` is then unchanged
    pub rejected: Option<NavigationError>,
}

impl Transition {
    fn to(state: NavState, effects: Vec<Effect>) -> Self {
        Self {
            state,
            effects,
            rejected: None,
        }
    }

    fn unchanged(state: NavState) -> Self {
        Self::to(state, Vec::new())
    }

    fn rejected(state: NavState, error: NavigationError) -> Self {
        warn!("[Navigator] Rejected: {}", error);
        Self {
            state,
            effects: Vec::new(),
            rejected: Some(error),
        }
    }

    fn invalid(state: NavState, operation: &'static str) -> Self {
        let status = state.status();
        Self::rejected(
            state,
            NavigationError::StateTransition {
                operation,
                state: status,
            },
        )
    }

    /// Whether this transition started a new route fetch.
    pub fn fetch(&self) -> Option<&RouteFetch> {
        self.effects.iter().find_map(|e| match e {
            Effect::FetchRoute(fetch) => Some(fetch),
            _ => None,
        })
    }
}

/// Apply `event` to `state`.
pub fn transition(state: NavState, event: NavEvent, ctx: &TransitionContext<'_>) -> Transition {
    match event {
        NavEvent::Start(request) => on_start(state, request, ctx),
        NavEvent::RouteReady {
            generation,
            response,
        } => on_route_ready(state, generation, response, ctx),
        NavEvent::RouteFailed { generation, error } => on_route_failed(state, generation, error, ctx),
        NavEvent::Fix(fix) => on_fix(state, fix, ctx),
        NavEvent::Pause => on_pause(state),
        NavEvent::Resume => on_resume(state),
        NavEvent::Recalculate => on_recalculate(state, ctx),
        NavEvent::RetryDue { generation } => on_retry_due(state, generation, ctx),
        NavEvent::End { completed } => on_end(state, completed),
        NavEvent::Reset => on_reset(state),
    }
}

fn on_start(state: NavState, request: StartRequest, ctx: &TransitionContext<'_>) -> Transition {
    if !request.origin.is_valid() || !request.destination.is_valid() {
        return Transition::rejected(
            state,
            NavigationError::InvalidRequest {
                message: format!(
                    "origin {:?} / destination {:?} out of range",
                    request.origin, request.destination
                ),
            },
        );
    }

    let mut effects = Vec::new();
    match &state {
        NavState::Loading(loading) => {
            info!(
                "[Navigator] Start supersedes pending fetch {}",
                loading.generation
            );
            effects.push(Effect::CancelFetch {
                generation: loading.generation,
            });
        }
        NavState::Idle | NavState::Arrived(_) | NavState::Cancelled(_) | NavState::Error(_) => {
            effects.push(Effect::StartLocation);
        }
        NavState::Active(_) | NavState::Paused(_) | NavState::Recalculating(_) => {
            return Transition::invalid(state, "start");
        }
    }

    let generation = ctx.next_generation;
    info!(
        "[Navigator] Loading route (generation {}) to {:?}",
        generation, request.destination
    );
    effects.push(Effect::FetchRoute(RouteFetch {
        generation,
        request: request.route_request(),
        purpose: FetchPurpose::Initial,
    }));

    Transition::to(
        NavState::Loading(Loading {
            generation,
            request,
            requested_at: ctx.now,
        }),
        effects,
    )
}

fn on_route_ready(
    state: NavState,
    generation: u64,
    response: RouteResponse,
    ctx: &TransitionContext<'_>,
) -> Transition {
    if state.pending_generation() != Some(generation) {
        debug!("[Navigator] Ignoring stale route (generation {})", generation);
        return Transition::unchanged(state);
    }

    match state {
        NavState::Loading(loading) => {
            let route = match PlannedRoute::from_response(&response, ctx.config.precision) {
                Ok(route) => route,
                Err(error) => return initial_failure(error),
            };
            let session = Session::new(
                &loading.request,
                route,
                generation,
                loading.requested_at,
                ctx.now,
            );
            info!(
                "[Navigator] Session {} active: {} steps, {:.0} m",
                session.id,
                session.steps().len(),
                session.route.total_distance_m
            );
            let effects = vec![
                Effect::SaveSession(session.clone()),
                Effect::Notify(NavigationNotice::Started {
                    session_id: session.id.clone(),
                    destination_name: session.destination_name.clone(),
                    total_distance_m: session.route.total_distance_m,
                    total_duration_s: session.route.total_duration_s,
                }),
            ];
            Transition::to(NavState::Active(Tracking::new(session)), effects)
        }
        NavState::Recalculating(recalc) => {
            let route = match PlannedRoute::from_response(&response, ctx.config.precision) {
                Ok(route) => route,
                Err(error) => return recalculation_failure(recalc, error.to_string(), ctx),
            };
            let Recalculating { tracking, .. } = recalc;
            // Back to step 0 of the new route. Progress is rebuilt from the next fix.
            let session = tracking
                .session
                .with_route(route)
                .with_status(SessionStatus::Active);

            info!(
                "[Navigator] Rerouted session {} ({} steps, reroute #{})",
                session.id,
                session.steps().len(),
                session.recalculation_count
            );
            let effects = vec![
                Effect::SaveSession(session.clone()),
                Effect::Notify(NavigationNotice::Rerouted {
                    session_id: session.id.clone(),
                    total_distance_m: session.route.total_distance_m,
                    recalculation_count: session.recalculation_count,
                }),
            ];
            Transition::to(
                NavState::Active(Tracking {
                    session,
                    progress: None,
                    last_fix: tracking.last_fix,
                    off_route_streak: 0,
                    announced_step: None,
                }),
                effects,
            )
        }
        other => Transition::unchanged(other),
    }
}

fn on_route_failed(
    state: NavState,
    generation: u64,
    error: NavigationError,
    ctx: &TransitionContext<'_>,
) -> Transition {
    if state.pending_generation() != Some(generation) {
        debug!(
            "[Navigator] Ignoring stale fetch failure (generation {})",
            generation
        );
        return Transition::unchanged(state);
    }

    match state {
        NavState::Loading(_) => initial_failure(error),
        NavState::Recalculating(recalc) => recalculation_failure(recalc, error.to_string(), ctx),
        other => Transition::unchanged(other),
    }
}

/// The initial fetch failed: no retry, session discarded.
fn initial_failure(error: NavigationError) -> Transition {
    warn!("[Navigator] Route fetch failed: {}", error);
    let effects = vec![
        Effect::StopLocation,
        Effect::Notify(NavigationNotice::failed(&error)),
    ];
    Transition::to(
        NavState::Error(Failure {
            error,
            session: None,
        }),
        effects,
    )
}

fn recalculation_failure(
    mut recalc: Recalculating,
    message: String,
    ctx: &TransitionContext<'_>,
) -> Transition {
    recalc.failures += 1;

    if recalc.failures <= ctx.config.max_recalculation_retries {
        let delay = ctx.config.retry_delay(recalc.failures);
        warn!(
            "[Navigator] Recalculation attempt {} failed ({}), retrying in {:?}",
            recalc.failures, message, delay
        );
        recalc.awaiting_retry = true;
        recalc.last_error = Some(message);
        let effects = vec![Effect::ScheduleRetry {
            generation: recalc.generation,
            delay_ms: delay.as_millis() as u64,
        }];
        return Transition::to(NavState::Recalculating(recalc), effects);
    }

    let error = NavigationError::Recalculation {
        attempts: recalc.failures,
        message,
    };
    warn!("[Navigator] {}", error);
    let session = recalc.tracking.session.with_status(SessionStatus::Error);
    let effects = vec![
        Effect::StopLocation,
        Effect::UpdateStatus {
            session_id: session.id.clone(),
            status: SessionStatus::Error,
        },
        Effect::Notify(NavigationNotice::failed(&error)),
    ];
    Transition::to(
        NavState::Error(Failure {
            error,
            session: Some(session),
        }),
        effects,
    )
}

fn on_fix(state: NavState, fix: LocationFix, ctx: &TransitionContext<'_>) -> Transition {
    if !fix.coordinate.is_valid() {
        warn!("[Navigator] Dropping invalid fix {:?}", fix.coordinate);
        return Transition::unchanged(state);
    }

    match state {
        NavState::Active(tracking) => track_fix(tracking, fix, ctx),
        NavState::Recalculating(mut recalc) => {
            // Keep the latest position for the retry origin
            recalc.tracking.last_fix = Some(fix);
            Transition::unchanged(NavState::Recalculating(recalc))
        }
        other => {
            debug!("[Navigator] Dropping fix while {}", other.status());
            Transition::unchanged(other)
        }
    }
}

fn track_fix(tracking: Tracking, fix: LocationFix, ctx: &TransitionContext<'_>) -> Transition {
    let config = ctx.config;
    let tracker = ProgressTracker::new(config);
    let estimator = EtaEstimator::new(config);

    let steps = tracking.session.steps();
    let mut snapshot = tracker.snapshot(
        &fix,
        steps,
        tracking.session.current_step_index,
        tracking.last_fix.as_ref(),
        &estimator,
        ctx.now,
    );
    // Step ends and starts coincide, so a final step shorter than the off-route
    // radius never wins classification. Within arrival range, move onto it.
    if let Some(last) = steps.len().checked_sub(1) {
        if snapshot.current_step_index + 1 == last
            && steps[last].distance_to_end(&fix.coordinate) <= config.arrival_threshold_m
        {
            snapshot = tracker.snapshot(
                &fix,
                steps,
                last,
                tracking.last_fix.as_ref(),
                &estimator,
                ctx.now,
            );
        }
    }
    debug!(
        "[Navigator] step {} | to end {:.0} m | remaining {:.0} m | off route {:.0} m",
        snapshot.current_step_index,
        snapshot.distance_to_step_end_m,
        snapshot.remaining_distance_m,
        snapshot.distance_from_route_m
    );

    let session = if snapshot.current_step_index != tracking.session.current_step_index {
        info!(
            "[Navigator] Advanced to step {}",
            snapshot.current_step_index
        );
        tracking.session.with_step_index(snapshot.current_step_index)
    } else {
        tracking.session
    };

    if session.is_last_step() && snapshot.distance_to_step_end_m <= config.arrival_threshold_m {
        info!("[Navigator] Arrived at destination ({})", session.id);
        let session = session.with_status(SessionStatus::Arrived);
        let effects = vec![
            Effect::StopLocation,
            Effect::UpdateStatus {
                session_id: session.id.clone(),
                status: SessionStatus::Arrived,
            },
            Effect::DeleteProgress {
                session_id: session.id.clone(),
            },
            Effect::Notify(NavigationNotice::arrived(&session)),
        ];
        return Transition::to(
            NavState::Arrived(Finished {
                session: Some(session),
                progress: Some(snapshot),
            }),
            effects,
        );
    }

    let off_route_streak = if snapshot.off_route {
        tracking.off_route_streak + 1
    } else {
        0
    };

    if off_route_streak >= config.off_route_debounce_fixes {
        let generation = ctx.next_generation;
        info!(
            "[Navigator] Off route for {} fixes ({:.0} m), recalculating (generation {})",
            off_route_streak, snapshot.distance_from_route_m, generation
        );
        let effects = vec![
            Effect::Notify(NavigationNotice::OffRoute {
                distance_from_route_m: snapshot.distance_from_route_m,
            }),
            Effect::FetchRoute(RouteFetch {
                generation,
                request: session.reroute_request(fix.coordinate),
                purpose: FetchPurpose::Recalculation,
            }),
        ];
        let tracking = Tracking {
            session: session.with_status(SessionStatus::Recalculating),
            progress: Some(snapshot),
            last_fix: Some(fix),
            off_route_streak: 0,
            announced_step: tracking.announced_step,
        };
        return Transition::to(
            NavState::Recalculating(Recalculating {
                tracking,
                generation,
                failures: 0,
                awaiting_retry: false,
                last_error: None,
            }),
            effects,
        );
    }

    let mut effects = Vec::new();
    let mut announced_step = tracking.announced_step;
    if snapshot.near_next_turn {
        let next_index = snapshot.current_step_index + 1;
        if announced_step != Some(next_index) {
            if let Some(next) = session.steps().get(next_index) {
                effects.push(Effect::Notify(NavigationNotice::ApproachingTurn {
                    step_index: next_index,
                    instruction: next.instruction.clone(),
                    maneuver: next.maneuver,
                    distance_m: snapshot.distance_to_next_step_m.unwrap_or(0.0),
                }));
                announced_step = Some(next_index);
            }
        }
    }

    Transition::to(
        NavState::Active(Tracking {
            session,
            progress: Some(snapshot),
            last_fix: Some(fix),
            off_route_streak,
            announced_step,
        }),
        effects,
    )
}

fn on_pause(state: NavState) -> Transition {
    match state {
        NavState::Active(tracking) => {
            info!("[Navigator] Paused {}", tracking.session.id);
            Transition::to(
                NavState::Paused(tracking.with_status(SessionStatus::Paused)),
                vec![Effect::StopLocation],
            )
        }
        other => Transition::invalid(other, "pause"),
    }
}

fn on_resume(state: NavState) -> Transition {
    match state {
        NavState::Paused(tracking) => {
            info!("[Navigator] Resumed {}", tracking.session.id);
            let tracking = Tracking {
                off_route_streak: 0,
                ..tracking.with_status(SessionStatus::Active)
            };
            Transition::to(NavState::Active(tracking), vec![Effect::StartLocation])
        }
        other => Transition::invalid(other, "resume"),
    }
}

fn on_recalculate(state: NavState, ctx: &TransitionContext<'_>) -> Transition {
    let generation = ctx.next_generation;
    let (tracking, mut effects) = match state {
        NavState::Active(tracking) => (tracking, Vec::new()),
        NavState::Recalculating(recalc) => {
            let mut effects = Vec::new();
            if !recalc.awaiting_retry {
                effects.push(Effect::CancelFetch {
                    generation: recalc.generation,
                });
            }
            (recalc.tracking, effects)
        }
        other => return Transition::invalid(other, "recalculate"),
    };

    let origin = reroute_origin(&tracking);
    info!(
        "[Navigator] Recalculation requested (generation {})",
        generation
    );
    effects.push(Effect::FetchRoute(RouteFetch {
        generation,
        request: tracking.session.reroute_request(origin),
        purpose: FetchPurpose::Recalculation,
    }));

    Transition::to(
        NavState::Recalculating(Recalculating {
            tracking: Tracking {
                off_route_streak: 0,
                ..tracking.with_status(SessionStatus::Recalculating)
            },
            generation,
            failures: 0,
            awaiting_retry: false,
            last_error: None,
        }),
        effects,
    )
}

fn on_retry_due(state: NavState, generation: u64, ctx: &TransitionContext<'_>) -> Transition {
    match state {
        NavState::Recalculating(mut recalc)
            if recalc.awaiting_retry && recalc.generation == generation =>
        {
            let next = ctx.next_generation;
            info!(
                "[Navigator] Retrying recalculation (attempt {}, generation {})",
                recalc.failures + 1,
                next
            );
            let origin = reroute_origin(&recalc.tracking);
            let effects = vec![Effect::FetchRoute(RouteFetch {
                generation: next,
                request: recalc.tracking.session.reroute_request(origin),
                purpose: FetchPurpose::Recalculation,
            })];
            recalc.generation = next;
            recalc.awaiting_retry = false;
            Transition::to(NavState::Recalculating(recalc), effects)
        }
        other => {
            debug!("[Navigator] Ignoring stale retry timer (generation {})", generation);
            Transition::unchanged(other)
        }
    }
}

/// Reroute from the latest known position, or the current step's start before any fix.
fn reroute_origin(tracking: &Tracking) -> Coordinate {
    tracking
        .last_fix
        .as_ref()
        .map(|fix| fix.coordinate)
        .or_else(|| tracking.session.current_step().map(|s| s.start))
        .unwrap_or(tracking.session.origin)
}

fn on_end(state: NavState, completed: bool) -> Transition {
    let (tracking, mut effects) = match state {
        NavState::Loading(loading) => {
            info!("[Navigator] Navigation ended while loading");
            return Transition::to(
                NavState::Cancelled(Finished::default()),
                vec![
                    Effect::CancelFetch {
                        generation: loading.generation,
                    },
                    Effect::StopLocation,
                ],
            );
        }
        NavState::Active(tracking) | NavState::Paused(tracking) => (tracking, Vec::new()),
        NavState::Recalculating(recalc) => {
            let mut effects = Vec::new();
            if !recalc.awaiting_retry {
                effects.push(Effect::CancelFetch {
                    generation: recalc.generation,
                });
            }
            (recalc.tracking, effects)
        }
        other => return Transition::invalid(other, "end"),
    };

    let status = if completed {
        SessionStatus::Arrived
    } else {
        SessionStatus::Cancelled
    };
    let session = tracking.session.with_status(status);
    info!("[Navigator] Session {} ended: {}", session.id, status);

    effects.push(Effect::StopLocation);
    effects.push(Effect::UpdateStatus {
        session_id: session.id.clone(),
        status,
    });
    effects.push(Effect::DeleteProgress {
        session_id: session.id.clone(),
    });
    if completed {
        effects.push(Effect::Notify(NavigationNotice::arrived(&session)));
    }

    let finished = Finished {
        session: Some(session),
        progress: tracking.progress,
    };
    let state = if completed {
        NavState::Arrived(finished)
    } else {
        NavState::Cancelled(finished)
    };
    Transition::to(state, effects)
}

fn on_reset(state: NavState) -> Transition {
    match state {
        NavState::Idle => Transition::unchanged(NavState::Idle),
        NavState::Arrived(_) | NavState::Cancelled(_) | NavState::Error(_) => {
            info!("[Navigator] Reset to idle");
            Transition::unchanged(NavState::Idle)
        }
        other => Transition::invalid(other, "reset"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::EARTH_RADIUS_M;
    use crate::polyline;
    use crate::route::StepResponse;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 14, 10, 0, 0).unwrap()
    }

    fn ctx(config: &NavigationConfig, generation: u64) -> TransitionContext<'_> {
        TransitionContext {
            config,
            now: now(),
            next_generation: generation,
        }
    }

    fn north(c: Coordinate, meters: f64) -> Coordinate {
        Coordinate::new(c.latitude + (meters / EARTH_RADIUS_M).to_degrees(), c.longitude)
    }

    fn east(c: Coordinate, meters: f64) -> Coordinate {
        let dlng = (meters / (EARTH_RADIUS_M * c.latitude.to_radians().cos())).to_degrees();
        Coordinate::new(c.latitude, c.longitude + dlng)
    }

    fn origin() -> Coordinate {
        Coordinate::new(46.0, 7.0)
    }

    /// Two steps: 1000 m north, then 1000 m east.
    fn response() -> RouteResponse {
        let a = origin();
        let b = north(a, 1000.0);
        let c = east(b, 1000.0);
        let step = |start, end, maneuver: Option<&str>, text: &str| StepResponse {
            start,
            end,
            instruction: text.to_string(),
            maneuver: maneuver.map(str::to_string),
            distance_m: 1000.0,
            duration_s: 200.0,
            polyline: polyline::encode(&[start, end]),
        };
        RouteResponse {
            steps: vec![
                step(a, b, None, "Head north"),
                step(b, c, Some("turn-right"), "Turn right onto Quai"),
            ],
            overview_polyline: polyline::encode(&[a, b, c]),
            total_distance_m: 2000.0,
            total_duration_s: 400.0,
        }
    }

    fn request() -> StartRequest {
        StartRequest::new(origin(), east(north(origin(), 1000.0), 1000.0))
    }

    fn fix(c: Coordinate) -> NavEvent {
        NavEvent::Fix(LocationFix::new(c, now()))
    }

    fn active(config: &NavigationConfig) -> NavState {
        let t = transition(NavState::Idle, NavEvent::Start(request()), &ctx(config, 1));
        let t = transition(
            t.state,
            NavEvent::RouteReady {
                generation: 1,
                response: response(),
            },
            &ctx(config, 2),
        );
        assert_eq!(t.state.status(), SessionStatus::Active);
        t.state
    }

    fn recalculating(config: &NavigationConfig) -> NavState {
        let mut state = active(config);
        let lost = east(north(origin(), 300.0), -300.0);
        for _ in 0..config.off_route_debounce_fixes {
            state = transition(state, fix(lost), &ctx(config, 2)).state;
        }
        assert_eq!(state.status(), SessionStatus::Recalculating);
        state
    }

    #[test]
    fn test_start_emits_fetch_and_location() {
        let config = NavigationConfig::default();
        let t = transition(NavState::Idle, NavEvent::Start(request()), &ctx(&config, 1));
        assert_eq!(t.state.status(), SessionStatus::Loading);
        assert_eq!(t.effects[0], Effect::StartLocation);
        let fetch = t.fetch().unwrap();
        assert_eq!(fetch.generation, 1);
        assert_eq!(fetch.purpose, FetchPurpose::Initial);
    }

    #[test]
    fn test_start_rejects_invalid_coordinates() {
        let config = NavigationConfig::default();
        let bad = StartRequest::new(Coordinate::new(95.0, 0.0), origin());
        let t = transition(NavState::Idle, NavEvent::Start(bad), &ctx(&config, 1));
        assert!(matches!(t.rejected, Some(NavigationError::InvalidRequest { .. })));
        assert_eq!(t.state.status(), SessionStatus::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_route_ready_activates_session() {
        let config = NavigationConfig::default();
        let state = active(&config);
        let session = state.session().unwrap();
        assert_eq!(session.current_step_index, 0);
        assert_eq!(session.steps().len(), 2);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn test_superseding_start_cancels_previous_fetch() {
        let config = NavigationConfig::default();
        let t = transition(NavState::Idle, NavEvent::Start(request()), &ctx(&config, 1));
        let t = transition(t.state, NavEvent::Start(request()), &ctx(&config, 2));
        assert_eq!(t.effects[0], Effect::CancelFetch { generation: 1 });
        assert_eq!(t.state.pending_generation(), Some(2));

        // The slow first answer arrives late and must not win
        let t = transition(
            t.state,
            NavEvent::RouteReady {
                generation: 1,
                response: response(),
            },
            &ctx(&config, 3),
        );
        assert_eq!(t.state.status(), SessionStatus::Loading);
        assert!(t.effects.is_empty());
        assert!(t.rejected.is_none());
    }

    #[test]
    fn test_initial_failure_goes_to_error_without_retry() {
        let config = NavigationConfig::default();
        let t = transition(NavState::Idle, NavEvent::Start(request()), &ctx(&config, 1));
        let t = transition(
            t.state,
            NavEvent::RouteFailed {
                generation: 1,
                error: NavigationError::RouteFetch {
                    message: "503".to_string(),
                },
            },
            &ctx(&config, 2),
        );
        assert_eq!(t.state.status(), SessionStatus::Error);
        assert!(t.state.session().is_none());
        assert!(matches!(t.state.error(), Some(NavigationError::RouteFetch { .. })));
        assert!(t.effects.contains(&Effect::StopLocation));
        assert!(t.fetch().is_none());
    }

    #[test]
    fn test_empty_route_is_an_error() {
        let config = NavigationConfig::default();
        let t = transition(NavState::Idle, NavEvent::Start(request()), &ctx(&config, 1));
        let mut empty = response();
        empty.steps.clear();
        let t = transition(
            t.state,
            NavEvent::RouteReady {
                generation: 1,
                response: empty,
            },
            &ctx(&config, 2),
        );
        assert!(matches!(t.state.error(), Some(NavigationError::EmptyRoute)));
    }

    #[test]
    fn test_pause_while_idle_is_rejected() {
        let config = NavigationConfig::default();
        let t = transition(NavState::Idle, NavEvent::Pause, &ctx(&config, 1));
        assert!(matches!(
            t.rejected,
            Some(NavigationError::StateTransition {
                operation: "pause",
                state: SessionStatus::Idle
            })
        ));
        assert_eq!(t.state.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_single_noisy_fix_does_not_reroute() {
        let config = NavigationConfig::default();
        let state = active(&config);
        let lost = east(north(origin(), 300.0), -300.0);
        let t = transition(state, fix(lost), &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Active);
        let t = transition(t.state, fix(north(origin(), 320.0)), &ctx(&config, 2));
        let t = transition(t.state, fix(lost), &ctx(&config, 2));
        let t = transition(t.state, fix(lost), &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Active);
    }

    #[test]
    fn test_sustained_off_route_triggers_recalculation() {
        let config = NavigationConfig::default();
        let state = active(&config);
        let lost = east(north(origin(), 300.0), -300.0);
        let t = transition(state, fix(lost), &ctx(&config, 2));
        let t = transition(t.state, fix(lost), &ctx(&config, 2));
        let t = transition(t.state, fix(lost), &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Recalculating);
        let fetch = t.fetch().unwrap();
        assert_eq!(fetch.purpose, FetchPurpose::Recalculation);
        assert_eq!(fetch.request.origin, lost);
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Notify(NavigationNotice::OffRoute { .. }))));
    }

    #[test]
    fn test_retries_are_bounded() {
        let config = NavigationConfig::default();
        let mut state = recalculating(&config);
        let mut generation = 2;

        for attempt in 1..=config.max_recalculation_retries {
            let t = transition(
                state,
                NavEvent::RouteFailed {
                    generation,
                    error: NavigationError::RouteFetch {
                        message: "timeout".to_string(),
                    },
                },
                &ctx(&config, generation + 1),
            );
            let expected_delay = config.retry_delay(attempt).as_millis() as u64;
            assert_eq!(
                t.effects,
                vec![Effect::ScheduleRetry {
                    generation,
                    delay_ms: expected_delay
                }]
            );
            let t = transition(t.state, NavEvent::RetryDue { generation }, &ctx(&config, generation + 1));
            generation += 1;
            assert_eq!(t.fetch().map(|f| f.generation), Some(generation));
            state = t.state;
        }

        let t = transition(
            state,
            NavEvent::RouteFailed {
                generation,
                error: NavigationError::RouteFetch {
                    message: "timeout".to_string(),
                },
            },
            &ctx(&config, generation + 1),
        );
        assert_eq!(t.state.status(), SessionStatus::Error);
        assert!(matches!(
            t.state.error(),
            Some(NavigationError::Recalculation { attempts: 4, .. })
        ));
        assert!(t.state.session().is_some());
    }

    #[test]
    fn test_stale_retry_timer_is_ignored() {
        let config = NavigationConfig::default();
        let state = recalculating(&config);
        let t = transition(state, NavEvent::RetryDue { generation: 2 }, &ctx(&config, 3));
        assert!(t.effects.is_empty());
        assert_eq!(t.state.pending_generation(), Some(2));
    }

    #[test]
    fn test_explicit_recalculate_supersedes_fetch() {
        let config = NavigationConfig::default();
        let state = recalculating(&config);
        let t = transition(state, NavEvent::Recalculate, &ctx(&config, 3));
        assert_eq!(t.effects[0], Effect::CancelFetch { generation: 2 });
        assert_eq!(t.state.pending_generation(), Some(3));
    }

    #[test]
    fn test_fixes_while_recalculating_update_origin() {
        let config = NavigationConfig::default();
        let state = recalculating(&config);
        let moved = east(north(origin(), 350.0), -350.0);
        let t = transition(state, fix(moved), &ctx(&config, 3));
        assert!(t.effects.is_empty());
        match &t.state {
            NavState::Recalculating(r) => {
                assert_eq!(r.tracking.last_fix.as_ref().map(|f| f.coordinate), Some(moved))
            }
            other => panic!("unexpected state {:?}", other.status()),
        }
    }

    #[test]
    fn test_reroute_restarts_at_first_step() {
        let config = NavigationConfig::default();
        let state = recalculating(&config);
        let lost = east(north(origin(), 300.0), -300.0);

        // New route: 10 m to rejoin, then straight to the destination
        let rejoin = east(lost, 10.0);
        let destination = east(north(origin(), 1000.0), 1000.0);
        let step = |start, end, distance_m| StepResponse {
            start,
            end,
            instruction: "Continue".to_string(),
            maneuver: None,
            distance_m,
            duration_s: distance_m / 5.0,
            polyline: polyline::encode(&[start, end]),
        };
        let reroute = RouteResponse {
            steps: vec![step(lost, rejoin, 10.0), step(rejoin, destination, 1500.0)],
            overview_polyline: polyline::encode(&[lost, rejoin, destination]),
            total_distance_m: 1510.0,
            total_duration_s: 302.0,
        };

        let t = transition(
            state,
            NavEvent::RouteReady {
                generation: 2,
                response: reroute,
            },
            &ctx(&config, 3),
        );
        assert_eq!(t.state.status(), SessionStatus::Active);
        let session = t.state.session().unwrap();
        assert_eq!(session.current_step_index, 0);
        assert_eq!(session.recalculation_count, 1);
        assert_eq!(session.steps().len(), 2);
        assert_eq!(session.route.total_distance_m, 1510.0);
        assert!(t.state.progress().is_none());

        let t = transition(t.state, fix(east(lost, 5.0)), &ctx(&config, 3));
        let progress = t.state.progress().unwrap();
        assert!(!progress.off_route);
        assert!(progress.remaining_distance_m < 1510.0);
    }

    #[test]
    fn test_short_final_step_still_arrives() {
        let config = NavigationConfig::default();
        let a = origin();
        let b = north(a, 1000.0);
        let c = east(b, 25.0);
        let step = |start, end, distance_m| StepResponse {
            start,
            end,
            instruction: "Go".to_string(),
            maneuver: None,
            distance_m,
            duration_s: distance_m / 5.0,
            polyline: polyline::encode(&[start, end]),
        };
        let response = RouteResponse {
            steps: vec![step(a, b, 1000.0), step(b, c, 25.0)],
            overview_polyline: polyline::encode(&[a, b, c]),
            total_distance_m: 1025.0,
            total_duration_s: 205.0,
        };

        let t = transition(
            NavState::Idle,
            NavEvent::Start(StartRequest::new(a, c)),
            &ctx(&config, 1),
        );
        let mut state = transition(
            t.state,
            NavEvent::RouteReady {
                generation: 1,
                response,
            },
            &ctx(&config, 2),
        )
        .state;

        for k in 0..100 {
            state = transition(state, fix(north(a, k as f64 * 10.0)), &ctx(&config, 2)).state;
            assert_eq!(state.status(), SessionStatus::Active);
        }
        // Standing at the corner is not arrival: 25 m to go
        state = transition(state, fix(b), &ctx(&config, 2)).state;
        assert_eq!(state.status(), SessionStatus::Active);

        let t = transition(state, fix(c), &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Arrived);
        assert!(t.effects.contains(&Effect::StopLocation));
        let progress = t.state.progress().unwrap();
        assert_eq!(progress.current_step_index, 1);
        assert!(progress.remaining_distance_m < 1.0);
    }

    #[test]
    fn test_end_while_loading_cancels() {
        let config = NavigationConfig::default();
        let t = transition(NavState::Idle, NavEvent::Start(request()), &ctx(&config, 1));
        let t = transition(t.state, NavEvent::End { completed: true }, &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Cancelled);
        assert_eq!(
            t.effects,
            vec![Effect::CancelFetch { generation: 1 }, Effect::StopLocation]
        );
    }

    #[test]
    fn test_end_persists_final_status() {
        let config = NavigationConfig::default();
        let state = active(&config);
        let id = state.session().unwrap().id.clone();
        let t = transition(state, NavEvent::End { completed: false }, &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Cancelled);
        assert!(t.effects.contains(&Effect::UpdateStatus {
            session_id: id.clone(),
            status: SessionStatus::Cancelled
        }));
        assert!(t.effects.contains(&Effect::DeleteProgress { session_id: id }));

        let t = transition(t.state, NavEvent::End { completed: false }, &ctx(&config, 2));
        assert!(t.rejected.is_some());
    }

    #[test]
    fn test_approaching_turn_announced_once() {
        let config = NavigationConfig::default();
        let state = active(&config);
        let t = transition(state, fix(north(origin(), 850.0)), &ctx(&config, 2));
        let announced = t
            .effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify(NavigationNotice::ApproachingTurn { .. })))
            .count();
        assert_eq!(announced, 1);

        let t = transition(t.state, fix(north(origin(), 900.0)), &ctx(&config, 2));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_reset_only_from_terminal() {
        let config = NavigationConfig::default();
        let state = active(&config);
        let t = transition(state, NavEvent::Reset, &ctx(&config, 2));
        assert!(t.rejected.is_some());
        let t = transition(t.state, NavEvent::End { completed: true }, &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Arrived);
        let t = transition(t.state, NavEvent::Reset, &ctx(&config, 2));
        assert_eq!(t.state.status(), SessionStatus::Idle);
        assert!(t.state.session().is_none());
    }

    #[test]
    fn test_effect_json_shape() {
        let json = serde_json::to_value(Effect::CancelFetch { generation: 4 }).unwrap();
        assert_eq!(json["type"], "cancel_fetch");
        assert_eq!(json["data"]["generation"], 4);
        let json = serde_json::to_value(Effect::StopLocation).unwrap();
        assert_eq!(json["type"], "stop_location");
    }
}
