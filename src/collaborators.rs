//! External collaborators the navigation service talks to.
//!
//! Implementations are shared as `Arc<dyn Trait>` and must be `Send + Sync`.
//! Futures are boxed so the traits stay object safe.

use futures::future::BoxFuture;

use crate::error::Result;
use crate::route::{RouteRequest, RouteResponse};
use crate::service::FixSink;
use crate::session::{Session, SessionStatus};

/// Route planning backend.
///
/// The engine imposes no timeout; a provider that gives up should return an
/// error, which takes the same path as any other fetch failure.
pub trait DirectionsProvider: Send + Sync {
    fn fetch_route(&self, request: RouteRequest) -> BoxFuture<'_, Result<RouteResponse>>;
}

/// Device location stream.
///
/// After `start`, the source pushes fixes into the sink until `stop` is
/// called. A sink whose stream has been stopped silently drops fixes, so a
/// source does not need to synchronise `stop` with in-flight deliveries.
pub trait LocationSource: Send + Sync {
    fn start(&self, sink: FixSink) -> Result<()>;
    fn stop(&self);
}

/// Session persistence backend, used at start, reroute and end only.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: Session) -> BoxFuture<'_, Result<()>>;
    fn update_status(&self, session_id: String, status: SessionStatus) -> BoxFuture<'_, Result<()>>;
    fn delete_progress(&self, session_id: String) -> BoxFuture<'_, Result<()>>;
}
