//! Async navigation service.
//!
//! A single tokio task owns the [`NavigationEngine`] and processes every input
//! (commands, location fixes, route fetch results, retry timers) from one
//! mailbox, in arrival order. No two recomputations ever interleave.
//!
//! ```text
//!   NavigationHandle ──┐
//!   FixSink ───────────┼──► mailbox ──► actor ──► engine.handle(event)
//!   fetch tasks ───────┤                  │
//!   retry timers ──────┘                  ├──► watch: NavigationUpdate
//!                                         ├──► broadcast: NavigationNotice
//!                                         └──► persistence worker (sequential)
//! ```
//!
//! Internal senders (fetch tasks, timers, fix sinks) hold weak references to
//! the mailbox, so the actor shuts down once every [`NavigationHandle`] is
//! dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::collaborators::{DirectionsProvider, LocationSource, SessionStore};
use crate::config::NavigationConfig;
use crate::engine::{NavigationEngine, NavigationUpdate};
use crate::error::{NavigationError, Result};
use crate::route::RouteResponse;
use crate::session::{Session, SessionStatus, StartRequest};
use crate::state::{Effect, NavState, NavigationNotice, RouteFetch};
use crate::LocationFix;

const NOTICE_CAPACITY: usize = 64;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Command {
    Pause,
    Resume,
    Recalculate,
    End { completed: bool },
    Reset,
}

enum Message {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<Result<Session>>,
    },
    Command {
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
    Fix {
        epoch: u64,
        fix: LocationFix,
    },
    RouteFetched {
        generation: u64,
        result: Result<RouteResponse>,
    },
    RetryDue {
        generation: u64,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

enum PersistOp {
    Save(Session),
    UpdateStatus(String, SessionStatus),
    DeleteProgress(String),
    Flush(oneshot::Sender<Result<()>>),
}

/// Where a [`LocationSource`] pushes fixes.
///
/// Each sink is bound to one run of the location stream. Once the service has
/// processed a stop (pause, end, arrival), fixes sent through an older sink
/// are dropped.
#[derive(Clone)]
pub struct FixSink {
    epoch: u64,
    tx: mpsc::WeakUnboundedSender<Message>,
}

impl FixSink {
    /// Deliver a fix. Returns false once the service has shut down.
    pub fn send(&self, fix: LocationFix) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx
                .send(Message::Fix {
                    epoch: self.epoch,
                    fix,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Location stream run this sink belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl std::fmt::Debug for FixSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixSink").field("epoch", &self.epoch).finish()
    }
}

// ============================================================================
// Handle
// ============================================================================

/// The collaborators a service drives.
#[derive(Clone)]
pub struct Collaborators {
    pub directions: Arc<dyn DirectionsProvider>,
    pub location: Arc<dyn LocationSource>,
    pub store: Arc<dyn SessionStore>,
}

/// Cloneable client for a running [`NavigationService`].
///
/// Requests are enqueued when the method is called, so two requests issued
/// one after the other are processed in that order even if their futures are
/// awaited later.
#[derive(Clone)]
pub struct NavigationHandle {
    tx: mpsc::UnboundedSender<Message>,
    updates: watch::Receiver<NavigationUpdate>,
    notices: broadcast::Sender<NavigationNotice>,
}

impl NavigationHandle {
    fn request<T: Send + 'static>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Message,
    ) -> impl Future<Output = Result<T>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(build(reply)).is_ok();
        async move {
            if !sent {
                return Err(NavigationError::ServiceClosed);
            }
            rx.await.map_err(|_| NavigationError::ServiceClosed)?
        }
    }

    fn command(&self, command: Command) -> impl Future<Output = Result<()>> + Send + 'static {
        self.request(move |reply| Message::Command { command, reply })
    }

    /// Start navigating. Resolves once the route is loaded and the session is
    /// active, or with the error that ended the attempt
    /// ([`NavigationError::Superseded`] when a newer start replaced it).
    pub fn start(&self, request: StartRequest) -> impl Future<Output = Result<Session>> + Send + 'static {
        self.request(move |reply| Message::Start { request, reply })
    }

    pub fn pause(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.command(Command::Pause)
    }

    pub fn resume(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.command(Command::Resume)
    }

    pub fn recalculate(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.command(Command::Recalculate)
    }

    pub fn end(&self, completed: bool) -> impl Future<Output = Result<()>> + Send + 'static {
        self.command(Command::End { completed })
    }

    pub fn reset(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.command(Command::Reset)
    }

    /// Wait until every persistence operation queued so far has completed.
    pub fn flush(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.request(|reply| Message::Flush { reply })
    }

    /// Stop the service: stops the location stream and aborts pending fetches.
    pub fn shutdown(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.request(|reply| Message::Shutdown { reply })
    }

    /// Receiver for the latest published update.
    pub fn subscribe(&self) -> watch::Receiver<NavigationUpdate> {
        self.updates.clone()
    }

    pub fn current(&self) -> NavigationUpdate {
        self.updates.borrow().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<NavigationNotice> {
        self.notices.subscribe()
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct NavigationService;

impl NavigationService {
    /// Spawn the service on the current tokio runtime.
    pub fn spawn(config: NavigationConfig, collaborators: Collaborators) -> Result<NavigationHandle> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| NavigationError::Config {
            message: format!("navigation service needs a tokio runtime: {}", e),
        })?;

        let (tx, mailbox) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = watch::channel(NavigationUpdate::default());
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        runtime.spawn(persistence_worker(
            Arc::clone(&collaborators.store),
            persist_rx,
            notices_tx.clone(),
        ));

        let actor = ServiceActor {
            engine: NavigationEngine::new(config),
            collaborators,
            mailbox,
            self_tx: tx.downgrade(),
            updates: updates_tx,
            notices: notices_tx.clone(),
            persistence: persist_tx,
            location_epoch: 0,
            location_running: false,
            fetches: HashMap::new(),
            retry_timer: None,
            pending_start: None,
        };
        runtime.spawn(actor.run());
        info!("[NavigationService] Started");

        Ok(NavigationHandle {
            tx,
            updates: updates_rx,
            notices: notices_tx,
        })
    }
}

async fn persistence_worker(
    store: Arc<dyn SessionStore>,
    mut ops: mpsc::UnboundedReceiver<PersistOp>,
    notices: broadcast::Sender<NavigationNotice>,
) {
    while let Some(op) = ops.recv().await {
        let (what, result) = match op {
            PersistOp::Save(session) => ("save", store.save(session).await),
            PersistOp::UpdateStatus(id, status) => ("update_status", store.update_status(id, status).await),
            PersistOp::DeleteProgress(id) => ("delete_progress", store.delete_progress(id).await),
            PersistOp::Flush(reply) => {
                let _ = reply.send(Ok(()));
                continue;
            }
        };
        if let Err(e) = result {
            warn!("[NavigationService] Persistence {} failed: {}", what, e);
            let _ = notices.send(NavigationNotice::PersistenceFailed {
                message: e.to_string(),
            });
        }
    }
    debug!("[NavigationService] Persistence worker stopped");
}

struct ServiceActor {
    engine: NavigationEngine,
    collaborators: Collaborators,
    mailbox: mpsc::UnboundedReceiver<Message>,
    self_tx: mpsc::WeakUnboundedSender<Message>,
    updates: watch::Sender<NavigationUpdate>,
    notices: broadcast::Sender<NavigationNotice>,
    persistence: mpsc::UnboundedSender<PersistOp>,
    /// Incremented on every start and stop of the location stream
    location_epoch: u64,
    location_running: bool,
    fetches: HashMap<u64, JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    pending_start: Option<oneshot::Sender<Result<Session>>>,
}

impl ServiceActor {
    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                Message::Start { request, reply } => self.on_start(request, reply),
                Message::Command { command, reply } => {
                    let result = self.on_command(command);
                    let _ = reply.send(result);
                }
                Message::Fix { epoch, fix } => self.on_fix(epoch, fix),
                Message::RouteFetched { generation, result } => {
                    self.fetches.remove(&generation);
                    let now = Utc::now();
                    let outcome = match result {
                        Ok(response) => self.engine.route_ready(generation, response, now),
                        Err(error) => self.engine.route_failed(generation, error, now),
                    };
                    self.apply(outcome);
                }
                Message::RetryDue { generation } => {
                    self.retry_timer = None;
                    let outcome = self.engine.retry_due(generation, Utc::now());
                    self.apply(outcome);
                }
                Message::Flush { reply } => {
                    if let Err(mpsc::error::SendError(PersistOp::Flush(reply))) =
                        self.persistence.send(PersistOp::Flush(reply))
                    {
                        let _ = reply.send(Err(NavigationError::ServiceClosed));
                    }
                }
                Message::Shutdown { reply } => {
                    self.stop();
                    let _ = reply.send(Ok(()));
                    info!("[NavigationService] Shut down");
                    return;
                }
            }
        }
        self.stop();
        info!("[NavigationService] All handles dropped, stopping");
    }

    fn on_start(&mut self, request: StartRequest, reply: oneshot::Sender<Result<Session>>) {
        match self.engine.start(request, Utc::now()) {
            Ok(effects) => {
                if let Some(previous) = self.pending_start.take() {
                    let _ = previous.send(Err(NavigationError::Superseded {
                        generation: self.engine.generation(),
                    }));
                }
                self.pending_start = Some(reply);
                self.execute(effects);
                self.publish();
            }
            Err(error) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Result<()> {
        let now = Utc::now();
        let effects = match command {
            Command::Pause => self.engine.pause(now),
            Command::Resume => self.engine.resume(now),
            Command::Recalculate => self.engine.recalculate(now),
            Command::End { completed } => self.engine.end(completed, now),
            Command::Reset => self.engine.reset(now),
        }?;
        self.execute(effects);
        self.publish();
        Ok(())
    }

    fn on_fix(&mut self, epoch: u64, fix: LocationFix) {
        if !self.location_running || epoch != self.location_epoch {
            debug!(
                "[NavigationService] Dropping fix from stream {} (current {}, running {})",
                epoch, self.location_epoch, self.location_running
            );
            return;
        }
        let outcome = self.engine.update_location(fix, Utc::now());
        self.apply(outcome);
    }

    /// Execute and publish the outcome of an internal event. These are never
    /// rejected by the engine; a stray error is only logged.
    fn apply(&mut self, outcome: Result<Vec<Effect>>) {
        match outcome {
            Ok(effects) => {
                self.execute(effects);
                self.publish();
            }
            Err(e) => warn!("[NavigationService] Internal event rejected: {}", e),
        }
    }

    fn publish(&mut self) {
        self.updates.send_replace(self.engine.snapshot());
        self.settle_pending_start();
    }

    /// Resolve the pending `start` call once loading is over.
    fn settle_pending_start(&mut self) {
        let result = match self.engine.state() {
            NavState::Loading(_) => return,
            NavState::Error(failure) => Err(failure.error.clone()),
            NavState::Idle | NavState::Cancelled(_) => Err(NavigationError::Cancelled),
            state => match state.session() {
                Some(session) => Ok(session.clone()),
                None => Err(NavigationError::Cancelled),
            },
        };
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(result);
        }
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartLocation => self.start_location(),
                Effect::StopLocation => self.stop_location(),
                Effect::FetchRoute(fetch) => self.spawn_fetch(fetch),
                Effect::CancelFetch { generation } => {
                    if let Some(task) = self.fetches.remove(&generation) {
                        debug!("[NavigationService] Aborting fetch {}", generation);
                        task.abort();
                    }
                }
                Effect::ScheduleRetry {
                    generation,
                    delay_ms,
                } => self.schedule_retry(generation, delay_ms),
                Effect::SaveSession(session) => self.persist(PersistOp::Save(session)),
                Effect::UpdateStatus { session_id, status } => {
                    self.persist(PersistOp::UpdateStatus(session_id, status))
                }
                Effect::DeleteProgress { session_id } => {
                    self.persist(PersistOp::DeleteProgress(session_id))
                }
                Effect::Notify(notice) => {
                    // No receivers is fine
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    fn start_location(&mut self) {
        self.location_epoch += 1;
        self.location_running = true;
        let sink = FixSink {
            epoch: self.location_epoch,
            tx: self.self_tx.clone(),
        };
        info!(
            "[NavigationService] Starting location stream {}",
            self.location_epoch
        );
        if let Err(e) = self.collaborators.location.start(sink) {
            warn!("[NavigationService] Location source failed to start: {}", e);
            let _ = self.notices.send(NavigationNotice::Failed {
                message: e.to_string(),
                recoverable: true,
            });
        }
    }

    fn stop_location(&mut self) {
        self.location_epoch += 1;
        if self.location_running {
            info!("[NavigationService] Stopping location stream");
            self.collaborators.location.stop();
        }
        self.location_running = false;
    }

    fn spawn_fetch(&mut self, fetch: RouteFetch) {
        let RouteFetch {
            generation,
            request,
            purpose,
        } = fetch;
        debug!(
            "[NavigationService] Fetching route {} ({:?})",
            generation, purpose
        );
        let directions = Arc::clone(&self.collaborators.directions);
        let tx = self.self_tx.clone();
        let task = tokio::spawn(async move {
            let result = directions.fetch_route(request).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::RouteFetched { generation, result });
            }
        });
        self.fetches.insert(generation, task);
    }

    fn schedule_retry(&mut self, generation: u64, delay_ms: u64) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        let tx = self.self_tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::RetryDue { generation });
            }
        }));
    }

    fn persist(&self, op: PersistOp) {
        if self.persistence.send(op).is_err() {
            warn!("[NavigationService] Persistence worker is gone");
        }
    }

    fn stop(&mut self) {
        if self.location_running {
            self.collaborators.location.stop();
            self.location_running = false;
        }
        self.location_epoch += 1;
        for (_, task) in self.fetches.drain() {
            task.abort();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(NavigationError::ServiceClosed));
        }
    }
}
