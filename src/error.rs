//! Unified error handling for the navigation engine.
//!
//! Only provider, network and storage failures surface as recoverable errors.
//! Geometry and numeric edge cases are handled with fallback values inside the
//! pure computation modules and never produce an error.

use thiserror::Error;

use crate::session::SessionStatus;
use crate::Coordinate;

/// What went wrong while decoding a polyline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("input ended inside a chunk")]
    Truncated,
    #[error("character {0:?} is outside the polyline alphabet")]
    InvalidCharacter(char),
    #[error("chunk does not fit in 64 bits")]
    Overflow,
    #[error("latitude has no matching longitude")]
    MissingLongitude,
}

/// A malformed polyline string.
///
/// Carries the coordinates that were decoded before the failure so callers
/// can still use a partial geometry.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed polyline at byte {offset}: {kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    /// Byte offset into the encoded string where decoding stopped
    pub offset: usize,
    /// Coordinates decoded before the failure
    pub partial: Vec<Coordinate>,
}

/// Unified error type for navigation operations.
#[derive(Debug, Clone, Error)]
pub enum NavigationError {
    /// Directions provider or network failure on the initial fetch
    #[error("route fetch failed: {message}")]
    RouteFetch { message: String },

    /// Directions provider answered with no steps
    #[error("directions provider returned an empty route")]
    EmptyRoute,

    /// Recalculation kept failing after the bounded retries
    #[error("recalculation failed after {attempts} attempts: {message}")]
    Recalculation { attempts: u32, message: String },

    /// Malformed polyline in a provider response
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Operation requested in a state that does not allow it
    #[error("cannot {operation} while {state}")]
    StateTransition {
        operation: &'static str,
        state: SessionStatus,
    },

    /// Start request with unusable coordinates
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A newer start request replaced this one
    #[error("request superseded by fetch generation {generation}")]
    Superseded { generation: u64 },

    /// Navigation ended before the pending request completed
    #[error("navigation cancelled before the route was ready")]
    Cancelled,

    /// Session store failure
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The navigation service task is gone
    #[error("navigation service has shut down")]
    ServiceClosed,
}

impl NavigationError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NavigationError::RouteFetch { .. }
                | NavigationError::Recalculation { .. }
                | NavigationError::Persistence { .. }
        )
    }
}

/// Result type alias for navigation operations.
pub type Result<T> = std::result::Result<T, NavigationError>;

/// Extension trait for converting Option to NavigationError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a state transition error.
    fn ok_or_state(self, operation: &'static str, state: SessionStatus) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_state(self, operation: &'static str, state: SessionStatus) -> Result<T> {
        self.ok_or(NavigationError::StateTransition { operation, state })
    }
}
