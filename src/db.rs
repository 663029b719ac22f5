use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::aggregator::TripAggregator;
use crate::error::TripError;
use crate::ledger::SettlementDocument;
use crate::model::{
    normalize_email, Cents, Expense, ExpenseEvent, ExpenseShare, NewExpense, NewTrip, Trip, TripId,
    User, UserId,
};
use crate::settler::EventSettler;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Settlement of a closed trip, keyed by e-mail: payer → payee → cents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub trip_id: TripId,
    pub closed_at: DateTime<Utc>,
    pub ledger: SettlementDocument,
}

/// Event for the audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases report "memory" instead
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!(journal_mode = %mode, "database opened");
    conn.pragma_update(None, "foreign_keys", true)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tuser (
            user_id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            verified BOOLEAN NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS trip (
            trip_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            name_lower TEXT NOT NULL,
            created_at TEXT NOT NULL,
            start_date TEXT NOT NULL,
            -- NULL while the trip is open, set exactly once on close
            end_date TEXT,
            description TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS participant (
            trip_id INTEGER NOT NULL REFERENCES trip(trip_id),
            user_id INTEGER NOT NULL REFERENCES tuser(user_id),
            is_owner BOOLEAN NOT NULL DEFAULT 0,
            PRIMARY KEY (trip_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS expense (
            expense_id INTEGER PRIMARY KEY AUTOINCREMENT,
            trip_id INTEGER NOT NULL REFERENCES trip(trip_id),
            txn_date TEXT NOT NULL,
            created_at TEXT NOT NULL,
            description TEXT NOT NULL,
            idempotency_hash TEXT UNIQUE
        );

        CREATE TABLE IF NOT EXISTS expense_participant (
            expense_id INTEGER NOT NULL REFERENCES expense(expense_id),
            user_id INTEGER NOT NULL REFERENCES tuser(user_id),
            amount INTEGER NOT NULL CHECK (amount >= 0),
            PRIMARY KEY (expense_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS settlement (
            trip_id INTEGER NOT NULL REFERENCES trip(trip_id),
            payer_id INTEGER NOT NULL REFERENCES tuser(user_id),
            payee_id INTEGER NOT NULL REFERENCES tuser(user_id),
            amount INTEGER NOT NULL CHECK (amount > 0),
            PRIMARY KEY (trip_id, payer_id, payee_id)
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_expense_trip ON expense(trip_id);
        CREATE INDEX IF NOT EXISTS idx_participant_user ON participant(user_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);",
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

/// Start a transaction that holds the write lock from its first statement, so
/// the checks it runs stay valid until commit
fn begin_write(conn: &Connection) -> Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .context("Failed to start write transaction")
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================================================
// USERS
// ============================================================================

/// Return the user with the given e-mail, creating it when missing
pub fn load_or_create_user(conn: &Connection, email: &str) -> Result<User> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(anyhow!("user e-mail cannot be empty"));
    }

    let existing = conn
        .query_row(
            "SELECT user_id, verified FROM tuser WHERE email = ?1",
            params![email],
            |row| {
                Ok(User {
                    id: UserId(row.get(0)?),
                    email: email.clone(),
                    verified: row.get(1)?,
                })
            },
        )
        .optional()?;

    if let Some(user) = existing {
        return Ok(user);
    }

    conn.execute(
        "INSERT INTO tuser (email, verified) VALUES (?1, ?2)",
        params![email, false],
    )
    .with_context(|| format!("Failed to insert user '{}'", email))?;

    let user = User {
        id: UserId(conn.last_insert_rowid()),
        email,
        verified: false,
    };
    debug!(user_id = %user.id, email = %user.email, "created user");
    Ok(user)
}

/// Update the verified flag of one user
pub fn set_user_verified(conn: &Connection, user_id: UserId, verified: bool) -> Result<()> {
    let count = conn.execute(
        "UPDATE tuser SET verified = ?1 WHERE user_id = ?2",
        params![verified, user_id.0],
    )?;

    if count != 1 {
        return Err(anyhow!(
            "update of user {} affected {} rows instead of 1",
            user_id,
            count
        ));
    }
    Ok(())
}

// ============================================================================
// TRIPS
// ============================================================================

/// Create a trip with its owner and participants in a single transaction
pub fn create_trip(conn: &Connection, new_trip: &NewTrip) -> Result<Trip> {
    let name = new_trip.name.trim();
    if name.is_empty() {
        return Err(anyhow!("trip name cannot be empty"));
    }

    let tx = conn.unchecked_transaction()?;
    let now = Utc::now();

    let owner = load_or_create_user(&tx, &new_trip.owner)?;
    let mut participants: Vec<User> = Vec::new();
    for email in &new_trip.participants {
        let email = normalize_email(email);
        if email == owner.email {
            warn!(
                owner = %owner.email,
                "owner is also in the list of participants, ignoring"
            );
            continue;
        }
        if participants.iter().any(|u| u.email == email) {
            continue;
        }
        participants.push(load_or_create_user(&tx, &email)?);
    }

    tx.execute(
        "INSERT INTO trip (name, name_lower, created_at, start_date, end_date, description)
         VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        params![
            name,
            name.to_lowercase(),
            format_timestamp(now),
            new_trip.start_date.format(DATE_FORMAT).to_string(),
            new_trip.description,
        ],
    )?;
    let trip_id = TripId(tx.last_insert_rowid());

    {
        let mut stmt =
            tx.prepare("INSERT INTO participant (trip_id, user_id, is_owner) VALUES (?1, ?2, ?3)")?;
        stmt.execute(params![trip_id.0, owner.id.0, true])?;
        for p in &participants {
            stmt.execute(params![trip_id.0, p.id.0, false])?;
        }
    }

    tx.commit()?;
    info!(trip_id = %trip_id, name, participants = participants.len() + 1, "created trip");

    Ok(Trip {
        trip_id,
        name: name.to_string(),
        owner,
        start_date: new_trip.start_date,
        end_date: None,
        description: new_trip.description.clone(),
        participants,
        expenses: Vec::new(),
        created_at: Some(now),
    })
}

/// Load a single trip with its members and expenses
pub fn load_trip_by_id(conn: &Connection, trip_id: TripId) -> Result<Trip> {
    let row = conn
        .query_row(
            "SELECT name, created_at, start_date, end_date, description
             FROM trip WHERE trip_id = ?1",
            params![trip_id.0],
            |row| {
                let created_at: String = row.get(1)?;
                let start_date: String = row.get(2)?;
                let end_date: Option<String> = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    parse_timestamp(1, &created_at)?,
                    parse_date(2, &start_date)?,
                    end_date.map(|s| parse_timestamp(3, &s)).transpose()?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let (name, created_at, start_date, end_date, description) =
        row.ok_or(TripError::NotFound(trip_id))?;

    let mut stmt = conn.prepare(
        "SELECT u.user_id, u.email, u.verified, p.is_owner
         FROM tuser AS u JOIN participant AS p ON u.user_id = p.user_id
         WHERE p.trip_id = ?1
         ORDER BY u.user_id",
    )?;
    let members = stmt
        .query_map(params![trip_id.0], |row| {
            Ok((
                User {
                    id: UserId(row.get(0)?),
                    email: row.get(1)?,
                    verified: row.get(2)?,
                },
                row.get::<_, bool>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut owner = None;
    let mut participants = Vec::new();
    for (user, is_owner) in members {
        if is_owner {
            owner = Some(user);
        } else {
            participants.push(user);
        }
    }
    let owner = owner.ok_or_else(|| anyhow!("trip {} has no owner", trip_id))?;

    Ok(Trip {
        trip_id,
        name,
        owner,
        start_date,
        end_date,
        description,
        participants,
        expenses: load_expenses(conn, trip_id)?,
        created_at: Some(created_at),
    })
}

/// Active (not yet closed) trips owned by a user, keyed by lower-cased name
pub fn load_trips_by_owner(conn: &Connection, owner: &str) -> Result<BTreeMap<String, Trip>> {
    let mut stmt = conn.prepare(
        "SELECT t.trip_id, t.name_lower
         FROM trip AS t
         JOIN participant AS p ON p.trip_id = t.trip_id
         JOIN tuser AS u ON u.user_id = p.user_id
         WHERE p.is_owner = 1
           AND t.end_date IS NULL
           AND u.email = ?1
         ORDER BY t.trip_id",
    )?;

    let rows = stmt
        .query_map(params![normalize_email(owner)], |row| {
            Ok((TripId(row.get(0)?), row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut trips = BTreeMap::new();
    for (trip_id, name_lower) in rows {
        trips.insert(name_lower, load_trip_by_id(conn, trip_id)?);
    }
    Ok(trips)
}

/// `Some(end_date)` for a closed trip, `None` for an open one
fn trip_end_date(conn: &Connection, trip_id: TripId) -> Result<Option<DateTime<Utc>>> {
    let end_date: Option<Option<String>> = conn
        .query_row(
            "SELECT end_date FROM trip WHERE trip_id = ?1",
            params![trip_id.0],
            |row| row.get(0),
        )
        .optional()?;

    match end_date {
        None => Err(TripError::NotFound(trip_id).into()),
        Some(None) => Ok(None),
        Some(Some(s)) => Ok(Some(parse_timestamp(0, &s)?)),
    }
}

fn trip_members(conn: &Connection, trip_id: TripId) -> Result<HashMap<String, UserId>> {
    let mut stmt = conn.prepare(
        "SELECT u.email, u.user_id
         FROM tuser AS u JOIN participant AS p ON u.user_id = p.user_id
         WHERE p.trip_id = ?1",
    )?;
    let members = stmt
        .query_map(params![trip_id.0], |row| {
            Ok((row.get::<_, String>(0)?, UserId(row.get(1)?)))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(members)
}

// ============================================================================
// EXPENSES
// ============================================================================

/// Record an expense for an open trip
pub fn add_expense(conn: &Connection, trip_id: TripId, expense: &NewExpense) -> Result<Expense> {
    insert_expense(conn, trip_id, expense, None)
}

/// Insert an expense and its participant rows in one transaction.
///
/// Participants must belong to the trip and the expense must be settleable;
/// nothing is written otherwise. A repeated `idempotency_hash` fails with the
/// database's constraint violation.
pub(crate) fn insert_expense(
    conn: &Connection,
    trip_id: TripId,
    expense: &NewExpense,
    idempotency_hash: Option<&str>,
) -> Result<Expense> {
    let tx = begin_write(conn)?;
    if trip_end_date(&tx, trip_id)?.is_some() {
        return Err(TripError::AlreadyClosed(trip_id).into());
    }

    let members = trip_members(&tx, trip_id)?;
    let mut shares = Vec::with_capacity(expense.participants.len());
    for (email, paid) in &expense.participants {
        let email = normalize_email(email);
        let user_id = *members
            .get(&email)
            .ok_or_else(|| TripError::UnknownParticipant(email.clone()))?;
        shares.push(ExpenseShare {
            email,
            user_id,
            paid: *paid,
        });
    }

    let event: ExpenseEvent<UserId> = shares.iter().map(|s| (s.user_id, s.paid)).collect();
    EventSettler::new().validate(&event)?;

    let now = Utc::now();

    tx.execute(
        "INSERT INTO expense (trip_id, txn_date, created_at, description, idempotency_hash)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            trip_id.0,
            expense.date.format(DATE_FORMAT).to_string(),
            format_timestamp(now),
            expense.description,
            idempotency_hash,
        ],
    )?;
    let expense_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO expense_participant (expense_id, user_id, amount) VALUES (?1, ?2, ?3)",
        )?;
        for share in &shares {
            stmt.execute(params![expense_id, share.user_id.0, share.paid])?;
        }
    }

    tx.commit()?;
    debug!(trip_id = %trip_id, expense_id, "recorded expense");

    Ok(Expense {
        expense_id,
        date: expense.date,
        description: expense.description.clone(),
        participants: shares,
        created_at: Some(now),
    })
}

/// Expenses of a trip in the order they were recorded
pub fn load_expenses(conn: &Connection, trip_id: TripId) -> Result<Vec<Expense>> {
    let mut stmt = conn.prepare(
        "SELECT expense_id, txn_date, created_at, description
         FROM expense WHERE trip_id = ?1
         ORDER BY expense_id",
    )?;
    let mut expenses = stmt
        .query_map(params![trip_id.0], |row| {
            let txn_date: String = row.get(1)?;
            let created_at: String = row.get(2)?;
            Ok(Expense {
                expense_id: row.get(0)?,
                date: parse_date(1, &txn_date)?,
                created_at: Some(parse_timestamp(2, &created_at)?),
                description: row.get(3)?,
                participants: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT u.email, ep.user_id, ep.amount
         FROM expense_participant AS ep JOIN tuser AS u ON ep.user_id = u.user_id
         WHERE ep.expense_id = ?1
         ORDER BY ep.rowid",
    )?;
    for expense in &mut expenses {
        expense.participants = stmt
            .query_map(params![expense.expense_id], |row| {
                Ok(ExpenseShare {
                    email: row.get(0)?,
                    user_id: UserId(row.get(1)?),
                    paid: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok(expenses)
}

/// Expenditure events of a trip as the settlement engine consumes them
pub fn load_expense_events(conn: &Connection, trip_id: TripId) -> Result<Vec<ExpenseEvent<UserId>>> {
    Ok(load_expenses(conn, trip_id)?
        .iter()
        .map(Expense::to_event)
        .collect())
}

// ============================================================================
// TRIP COMPLETION
// ============================================================================

/// Record that a trip is closed. This is one-way: closing twice fails.
pub fn mark_trip_closed(conn: &Connection, trip_id: TripId, at: DateTime<Utc>) -> Result<()> {
    let count = conn.execute(
        "UPDATE trip SET end_date = ?1 WHERE trip_id = ?2 AND end_date IS NULL",
        params![format_timestamp(at), trip_id.0],
    )?;

    if count == 1 {
        return Ok(());
    }
    match trip_end_date(conn, trip_id)? {
        Some(_) => Err(TripError::AlreadyClosed(trip_id).into()),
        None => Err(anyhow!("failed to close trip {}", trip_id)),
    }
}

/// Compute the settlement of a trip, store it and close the trip.
///
/// Everything happens in one transaction so a trip is closed at most once and
/// always together with its stored settlement.
pub fn complete_trip(conn: &Connection, trip_id: TripId) -> Result<Settlement> {
    let tx = begin_write(conn)?;
    let now = Utc::now();

    if trip_end_date(&tx, trip_id)?.is_some() {
        return Err(TripError::AlreadyClosed(trip_id).into());
    }

    let events = load_expense_events(&tx, trip_id)?;
    let ledger = TripAggregator::new()
        .close(&events)
        .with_context(|| format!("Failed to settle trip {}", trip_id))?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO settlement (trip_id, payer_id, payee_id, amount) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for t in ledger.transfers() {
            stmt.execute(params![trip_id.0, t.payer.0, t.payee.0, t.amount_cents])?;
        }
    }

    mark_trip_closed(&tx, trip_id, now)?;

    let emails: HashMap<UserId, String> = trip_members(&tx, trip_id)?
        .into_iter()
        .map(|(email, id)| (id, email))
        .collect();
    let document = ledger.to_document(|id| {
        emails.get(id).cloned().unwrap_or_else(|| id.to_string())
    });

    let event = AuditEvent::new(
        "trip_closed",
        "trip",
        &trip_id.to_string(),
        serde_json::json!({
            "expenses": events.len(),
            "total_owed": ledger.total_cents(),
            "settlement": document,
        }),
        "settlement_engine",
    );
    insert_event(&tx, &event)?;

    tx.commit()?;
    info!(
        trip_id = %trip_id,
        expenses = events.len(),
        transfers = ledger.len(),
        "closed trip"
    );

    Ok(Settlement {
        trip_id,
        closed_at: now,
        ledger: document,
    })
}

/// Stored settlement of a closed trip
pub fn load_settlement(conn: &Connection, trip_id: TripId) -> Result<Settlement> {
    let closed_at = trip_end_date(conn, trip_id)?.ok_or(TripError::NotClosed(trip_id))?;

    let mut stmt = conn.prepare(
        "SELECT payer.email, payee.email, s.amount
         FROM settlement AS s
         JOIN tuser AS payer ON payer.user_id = s.payer_id
         JOIN tuser AS payee ON payee.user_id = s.payee_id
         WHERE s.trip_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![trip_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Cents>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut ledger = SettlementDocument::new();
    for (payer, payee, amount) in rows {
        ledger.entry(payer).or_default().insert(payee, amount);
    }

    Ok(Settlement {
        trip_id,
        closed_at,
        ledger,
    })
}

/// Settlement of a trip: the stored one if closed, otherwise close it now
pub fn settle_trip(conn: &Connection, trip_id: TripId) -> Result<Settlement> {
    match trip_end_date(conn, trip_id)? {
        Some(_) => load_settlement(conn, trip_id),
        None => complete_trip(conn, trip_id),
    }
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            format_timestamp(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(AuditEvent {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
