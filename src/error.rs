// Error types shared by the settlement engine and the trip store

use crate::model::TripId;

/// Input-contract violations detected before an event is settled.
///
/// A malformed event is rejected as a whole; nothing is emitted for it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettleError {
    #[error("expense has no participants")]
    NoParticipants,
    #[error("participant {identity} has a negative paid amount ({paid_cents})")]
    NegativeAmount { identity: String, paid_cents: i64 },
    #[error("participant {identity} appears more than once in the same expense")]
    DuplicateParticipant { identity: String },
    #[error("amount overflows the cents range")]
    AmountOverflow,
    #[error("expense #{index} of the trip is invalid: {source}")]
    InvalidEvent {
        index: usize,
        #[source]
        source: Box<SettleError>,
    },
}

/// Failures of trip-level operations that callers may want to tell apart
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TripError {
    #[error("trip {0} not found")]
    NotFound(TripId),
    #[error("trip {0} is already closed")]
    AlreadyClosed(TripId),
    #[error("trip {0} is still open and has no settlement")]
    NotClosed(TripId),
    #[error("expense participant '{0}' is not part of the trip")]
    UnknownParticipant(String),
    #[error("no active trips owned by '{0}'")]
    NoTripsForOwner(String),
}
