//! Session stores.
//!
//! - [`MemorySessionStore`]: process-local map, always available
//! - [`SqliteSessionStore`]: SQLite-backed (feature `persistence`)
//!
//! Both keep the session row and a separate progress row so `delete_progress`
//! can drop per-run state while the finished session stays queryable.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use log::debug;

use crate::collaborators::SessionStore;
use crate::error::{NavigationError, Result};
use crate::session::{Session, SessionStatus};

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct StoredSession {
    session: Session,
    has_progress: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: HashMap<String, StoredSession>,
    saves: usize,
}

/// Session store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemoryInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| NavigationError::Persistence {
            message: "session store lock poisoned".to_string(),
        })
    }

    /// Latest stored copy of a session, with its persisted status.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let inner = self.lock().ok()?;
        inner.sessions.get(session_id).map(|s| s.session.clone())
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.get(session_id).map(|s| s.status)
    }

    pub fn has_progress(&self, session_id: &str) -> bool {
        self.lock()
            .map(|inner| {
                inner
                    .sessions
                    .get(session_id)
                    .is_some_and(|s| s.has_progress)
            })
            .unwrap_or(false)
    }

    /// Number of `save` calls so far (initial save plus one per reroute).
    pub fn save_count(&self) -> usize {
        self.lock().map(|inner| inner.saves).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save_now(&self, session: Session) -> Result<()> {
        let mut inner = self.lock()?;
        debug!("[SessionStore] Saving {} ({})", session.id, session.status);
        inner.saves += 1;
        inner.sessions.insert(
            session.id.clone(),
            StoredSession {
                session,
                has_progress: true,
            },
        );
        Ok(())
    }

    fn update_status_now(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| NavigationError::Persistence {
                message: format!("unknown session {}", session_id),
            })?;
        debug!("[SessionStore] {} -> {}", session_id, status);
        stored.session.status = status;
        Ok(())
    }

    fn delete_progress_now(&self, session_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(stored) = inner.sessions.get_mut(session_id) {
            stored.has_progress = false;
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: Session) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save_now(session) })
    }

    fn update_status(&self, session_id: String, status: SessionStatus) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.update_status_now(&session_id, status) })
    }

    fn delete_progress(&self, session_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.delete_progress_now(&session_id) })
    }
}

// ============================================================================
// SQLite store
// ============================================================================

#[cfg(feature = "persistence")]
pub use sqlite::SqliteSessionStore;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::sync::{Arc, Mutex, MutexGuard};

    use chrono::{DateTime, TimeZone, Utc};
    use futures::future::BoxFuture;
    use log::{debug, info};
    use rusqlite::{params, Connection, OptionalExtension};

    use crate::collaborators::SessionStore;
    use crate::error::{NavigationError, Result};
    use crate::route::{PlannedRoute, TravelMode};
    use crate::session::{Session, SessionStatus};
    use crate::Coordinate;

    fn db_error(e: rusqlite::Error) -> NavigationError {
        NavigationError::Persistence {
            message: e.to_string(),
        }
    }

    fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| NavigationError::Persistence {
                message: format!("invalid timestamp {}", ms),
            })
    }

    fn parse_mode(value: &str) -> TravelMode {
        match value {
            "bicycling" => TravelMode::Bicycling,
            "walking" => TravelMode::Walking,
            _ => TravelMode::Driving,
        }
    }

    /// Session store persisted to SQLite.
    ///
    /// The route (steps and geometry) is stored as a MessagePack blob.
    /// Writes made through [`SessionStore`] run on tokio's blocking pool.
    #[derive(Clone)]
    pub struct SqliteSessionStore {
        db: Arc<Mutex<Connection>>,
    }

    impl SqliteSessionStore {
        /// Open (or create) the database at `db_path`.
        pub fn new(db_path: &str) -> Result<Self> {
            let db = Connection::open(db_path).map_err(db_error)?;
            Self::init_schema(&db).map_err(db_error)?;
            info!("[SessionStore] Opened {}", db_path);
            Ok(Self {
                db: Arc::new(Mutex::new(db)),
            })
        }

        /// Create an in-memory database (for testing).
        pub fn in_memory() -> Result<Self> {
            Self::new(":memory:")
        }

        fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
            conn.execute_batch(
                r#"
                PRAGMA foreign_keys = ON;

                -- One row per navigation run
                CREATE TABLE IF NOT EXISTS nav_sessions (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    origin_lat REAL NOT NULL,
                    origin_lng REAL NOT NULL,
                    destination_lat REAL NOT NULL,
                    destination_lng REAL NOT NULL,
                    destination_name TEXT,
                    group_id TEXT,
                    mode TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER NOT NULL,
                    total_distance_m REAL NOT NULL,
                    total_duration_s REAL NOT NULL,
                    recalculation_count INTEGER NOT NULL DEFAULT 0,
                    route BLOB NOT NULL
                );

                -- Per-run progress, dropped when the run ends
                CREATE TABLE IF NOT EXISTS nav_progress (
                    session_id TEXT PRIMARY KEY REFERENCES nav_sessions(id) ON DELETE CASCADE,
                    current_step_index INTEGER NOT NULL,
                    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                );
                "#,
            )
        }

        fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
            self.db.lock().map_err(|_| NavigationError::Persistence {
                message: "database lock poisoned".to_string(),
            })
        }

        fn save_now(&self, session: &Session) -> Result<()> {
            let route_blob =
                rmp_serde::to_vec_named(&*session.route).map_err(|e| NavigationError::Persistence {
                    message: e.to_string(),
                })?;
            let db = self.lock()?;
            db.execute(
                "INSERT OR REPLACE INTO nav_sessions (
                    id, status, origin_lat, origin_lng, destination_lat, destination_lng,
                    destination_name, group_id, mode, created_at, started_at,
                    total_distance_m, total_duration_s, recalculation_count, route
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    session.id,
                    session.status.as_str(),
                    session.origin.latitude,
                    session.origin.longitude,
                    session.destination.latitude,
                    session.destination.longitude,
                    session.destination_name,
                    session.group_id,
                    session.mode.as_str(),
                    session.created_at.timestamp_millis(),
                    session.started_at.timestamp_millis(),
                    session.route.total_distance_m,
                    session.route.total_duration_s,
                    session.recalculation_count,
                    route_blob,
                ],
            )
            .map_err(db_error)?;
            db.execute(
                "INSERT OR REPLACE INTO nav_progress (session_id, current_step_index) VALUES (?1, ?2)",
                params![session.id, session.current_step_index as i64],
            )
            .map_err(db_error)?;
            debug!("[SessionStore] Saved {}", session.id);
            Ok(())
        }

        fn update_status_now(&self, session_id: &str, status: SessionStatus) -> Result<()> {
            let db = self.lock()?;
            let updated = db
                .execute(
                    "UPDATE nav_sessions SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), session_id],
                )
                .map_err(db_error)?;
            if updated == 0 {
                return Err(NavigationError::Persistence {
                    message: format!("unknown session {}", session_id),
                });
            }
            debug!("[SessionStore] {} -> {}", session_id, status);
            Ok(())
        }

        fn delete_progress_now(&self, session_id: &str) -> Result<()> {
            let db = self.lock()?;
            db.execute(
                "DELETE FROM nav_progress WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(db_error)?;
            Ok(())
        }

        /// Load a stored session. Runs without a progress row resume at step 0.
        pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
            let db = self.lock()?;
            let row = db
                .query_row(
                    "SELECT s.status, s.origin_lat, s.origin_lng, s.destination_lat, s.destination_lng,
                            s.destination_name, s.group_id, s.mode, s.created_at, s.started_at,
                            s.recalculation_count, s.route, p.current_step_index
                     FROM nav_sessions s
                     LEFT JOIN nav_progress p ON p.session_id = s.id
                     WHERE s.id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            Coordinate::new(row.get(1)?, row.get(2)?),
                            Coordinate::new(row.get(3)?, row.get(4)?),
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                            row.get::<_, u32>(10)?,
                            row.get::<_, Vec<u8>>(11)?,
                            row.get::<_, Option<i64>>(12)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_error)?;

            let Some((
                status,
                origin,
                destination,
                destination_name,
                group_id,
                mode,
                created_at,
                started_at,
                recalculation_count,
                route_blob,
                step_index,
            )) = row
            else {
                return Ok(None);
            };

            let route: PlannedRoute =
                rmp_serde::from_slice(&route_blob).map_err(|e| NavigationError::Persistence {
                    message: format!("corrupt route blob for {}: {}", session_id, e),
                })?;
            let status = SessionStatus::parse(&status).ok_or_else(|| NavigationError::Persistence {
                message: format!("unknown status {:?}", status),
            })?;

            let session = Session {
                id: session_id.to_string(),
                origin,
                destination,
                destination_name,
                route: std::sync::Arc::new(route),
                created_at: timestamp(created_at)?,
                started_at: timestamp(started_at)?,
                status,
                current_step_index: 0,
                group_id,
                mode: parse_mode(&mode),
                recalculation_count,
            };
            let index = step_index.unwrap_or(0).max(0) as usize;
            Ok(Some(session.with_step_index(index)))
        }

        /// Whether a progress row exists for the session.
        pub fn has_progress(&self, session_id: &str) -> Result<bool> {
            let db = self.lock()?;
            let count: i64 = db
                .query_row(
                    "SELECT COUNT(*) FROM nav_progress WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .map_err(db_error)?;
            Ok(count > 0)
        }
    }

    impl SqliteSessionStore {
        /// Run a rusqlite call on the blocking pool so the persistence worker
        /// never stalls a runtime thread.
        fn blocking<F>(&self, op: F) -> BoxFuture<'_, Result<()>>
        where
            F: FnOnce(&SqliteSessionStore) -> Result<()> + Send + 'static,
        {
            let store = self.clone();
            Box::pin(async move {
                tokio::task::spawn_blocking(move || op(&store))
                    .await
                    .map_err(|e| NavigationError::Persistence {
                        message: format!("store task failed: {}", e),
                    })?
            })
        }
    }

    impl SessionStore for SqliteSessionStore {
        fn save(&self, session: Session) -> BoxFuture<'_, Result<()>> {
            self.blocking(move |store| store.save_now(&session))
        }

        fn update_status(
            &self,
            session_id: String,
            status: SessionStatus,
        ) -> BoxFuture<'_, Result<()>> {
            self.blocking(move |store| store.update_status_now(&session_id, status))
        }

        fn delete_progress(&self, session_id: String) -> BoxFuture<'_, Result<()>> {
            self.blocking(move |store| store.delete_progress_now(&session_id))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Maneuver, PlannedRoute, Step};
    use crate::session::StartRequest;
    use crate::Coordinate;
    use chrono::Utc;

    fn session() -> Session {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 0.01);
        let route = PlannedRoute::from_steps(vec![Step {
            index: 0,
            start: a,
            end: b,
            instruction: "Go east".to_string(),
            maneuver: Maneuver::Depart,
            distance_m: 1113.0,
            duration_s: 90.0,
            polyline: vec![a, b],
        }])
        .unwrap();
        Session::new(&StartRequest::new(a, b), route, 1, Utc::now(), Utc::now())
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemorySessionStore::new();
        let s = session();

        store.save(s.clone()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.status(&s.id), Some(SessionStatus::Active));
        assert!(store.has_progress(&s.id));

        store
            .update_status(s.id.clone(), SessionStatus::Arrived)
            .await
            .unwrap();
        store.delete_progress(s.id.clone()).await.unwrap();
        assert_eq!(store.status(&s.id), Some(SessionStatus::Arrived));
        assert!(!store.has_progress(&s.id));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_unknown_session() {
        let store = MemorySessionStore::new();
        let err = store
            .update_status("nav-nope".to_string(), SessionStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, NavigationError::Persistence { .. }));
        assert!(store.is_empty());
    }
}
