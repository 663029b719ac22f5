// 🧾 Trip Model - Users, trips, expenditure events and transfers
//
// Amounts are integer cents throughout. The settlement engine is generic over
// the participant identity so it can run on e-mail addresses or on resolved
// user ids alike.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount of money in cents
pub type Cents = i64;

/// Normalize an e-mail address (lower case, surrounding whitespace removed)
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// ============================================================================
// IDENTITIES
// ============================================================================

/// Primary key of a row in the `tuser` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key of a row in the `trip` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(pub i64);

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SETTLEMENT ENGINE INPUT / OUTPUT
// ============================================================================

/// How much one person actually paid toward one expenditure event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant<K> {
    pub identity: K,
    pub paid_cents: Cents,
}

impl<K> Participant<K> {
    pub fn new(identity: K, paid_cents: Cents) -> Self {
        Participant {
            identity,
            paid_cents,
        }
    }
}

/// One expenditure event as seen by the settlement engine.
///
/// The total is always derived from the participant list, so there is no way
/// to construct an event whose total disagrees with what was paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpenseEvent<K> {
    participants: Vec<Participant<K>>,
}

impl<K> ExpenseEvent<K> {
    pub fn new(participants: Vec<Participant<K>>) -> Self {
        ExpenseEvent { participants }
    }

    pub fn participants(&self) -> &[Participant<K>] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Sum of all paid amounts, `None` on overflow
    pub fn total_cents(&self) -> Option<Cents> {
        self.participants
            .iter()
            .try_fold(0 as Cents, |acc, p| acc.checked_add(p.paid_cents))
    }
}

impl<K> FromIterator<(K, Cents)> for ExpenseEvent<K> {
    fn from_iter<I: IntoIterator<Item = (K, Cents)>>(iter: I) -> Self {
        ExpenseEvent::new(
            iter.into_iter()
                .map(|(identity, paid)| Participant::new(identity, paid))
                .collect(),
        )
    }
}

/// Directed transfer: `payer` owes `payee` the given amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer<K> {
    pub payer: K,
    pub payee: K,
    pub amount_cents: Cents,
}

// ============================================================================
// PERSISTED RECORDS
// ============================================================================

/// A registered user. Every participant of a trip is a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub verified: bool,
}

/// A participant line of a stored expense
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseShare {
    #[serde(rename = "user")]
    pub email: String,
    pub user_id: UserId,
    pub paid: Cents,
}

/// A stored expenditure event of a trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub expense_id: i64,
    pub date: NaiveDate,
    pub description: String,
    pub participants: Vec<ExpenseShare>,
    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Expense {
    /// Sum of the amounts paid by all participants, saturating
    pub fn amount(&self) -> Cents {
        self.participants
            .iter()
            .fold(0 as Cents, |acc, p| acc.saturating_add(p.paid))
    }

    /// Engine view of this expense, keyed by user id
    pub fn to_event(&self) -> ExpenseEvent<UserId> {
        self.participants
            .iter()
            .map(|p| (p.user_id, p.paid))
            .collect()
    }
}

/// A trip with its owner, participants and recorded expenses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: TripId,
    pub name: String,
    pub owner: User,
    pub start_date: NaiveDate,
    /// `None` while the trip is still open
    pub end_date: Option<DateTime<Utc>>,
    pub description: String,
    /// Participants excluding the owner
    pub participants: Vec<User>,
    pub expenses: Vec<Expense>,
    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Trip {
    pub fn is_closed(&self) -> bool {
        self.end_date.is_some()
    }

    /// Owner first, then the other participants
    pub fn members(&self) -> impl Iterator<Item = &User> {
        std::iter::once(&self.owner).chain(self.participants.iter())
    }

    /// Look up a member by (not necessarily normalized) e-mail
    pub fn member_by_email(&self, email: &str) -> Option<&User> {
        let email = normalize_email(email);
        self.members().find(|u| u.email == email)
    }

    /// Sum of all recorded expenses, saturating
    pub fn total_expense(&self) -> Cents {
        self.expenses
            .iter()
            .fold(0 as Cents, |acc, e| acc.saturating_add(e.amount()))
    }
}

/// Request to create a trip. Only e-mail addresses are known at this point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrip {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub start_date: NaiveDate,
    pub participants: Vec<String>,
}

/// Request to record an expense. Participants are given by e-mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExpense {
    pub date: NaiveDate,
    pub description: String,
    pub participants: Vec<(String, Cents)>,
}
