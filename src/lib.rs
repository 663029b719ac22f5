// Trip Accountant - Core Library
// Shared expense tracking and settlement, used by the CLI and the API server

pub mod model;
pub mod error;
pub mod settler;     // Event Settler - per-expense transfers
pub mod ledger;      // Settlement Ledger - netted payer → payee table
pub mod aggregator;  // Trip Aggregator - all expenses of a trip
pub mod db;
pub mod import;
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use model::{
    normalize_email, Cents, Expense, ExpenseEvent, ExpenseShare, NewExpense, NewTrip,
    Participant, Transfer, Trip, TripId, User, UserId,
};
pub use error::{SettleError, TripError};
pub use settler::{fair_share, EventSettler};
pub use ledger::{SettlementDocument, SettlementLedger};
pub use aggregator::TripAggregator;
pub use db::{
    AuditEvent, Settlement,
    setup_database, load_or_create_user, set_user_verified,
    create_trip, load_trip_by_id, load_trips_by_owner,
    add_expense, load_expenses, load_expense_events,
    mark_trip_closed, complete_trip, load_settlement, settle_trip,
    insert_event, get_events_for_entity,
};
pub use import::{load_expense_csv, import_expenses, ImportSummary};
pub use config::{DatabaseUrl, ServerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Settle one expenditure event
pub fn settle<K>(event: &ExpenseEvent<K>) -> Result<Vec<Transfer<K>>, SettleError>
where
    K: Ord + Clone + std::fmt::Debug,
{
    EventSettler::new().settle(event)
}

/// Settle all events of a trip into one netted ledger
pub fn close<'a, K, I>(events: I) -> Result<SettlementLedger<K>, SettleError>
where
    K: Ord + Clone + std::fmt::Debug + 'a,
    I: IntoIterator<Item = &'a ExpenseEvent<K>>,
{
    TripAggregator::new().close(events)
}
