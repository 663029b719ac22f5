// 📥 Expense Import - CSV → expenses of a trip
//
// One row per participant of an expense:
//
//   date,description,participant,paid_cents
//   2024-06-02,tickets,alice@test.com,6000
//   2024-06-02,tickets,bob@test.com,0
//
// Consecutive rows with the same date and description form one expense.
// Re-importing the same file is a no-op thanks to the idempotency hash.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

use crate::db::insert_expense;
use crate::model::{normalize_email, Cents, NewExpense, TripId};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpenseRow {
    pub date: NaiveDate,
    pub description: String,
    pub participant: String,
    pub paid_cents: Cents,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Hash identifying an expense of a trip, for duplicate detection.
/// Participant order does not matter.
pub fn compute_idempotency_hash(trip_id: TripId, expense: &NewExpense) -> String {
    let mut participants: Vec<(String, Cents)> = expense
        .participants
        .iter()
        .map(|(email, paid)| (normalize_email(email), *paid))
        .collect();
    participants.sort();

    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", trip_id, expense.date, expense.description));
    for (email, paid) in participants {
        hasher.update(format!("|{}={}", email, paid));
    }
    format!("{:x}", hasher.finalize())
}

/// Group consecutive rows into expenses
pub fn group_rows(rows: Vec<ExpenseRow>) -> Vec<NewExpense> {
    let mut expenses: Vec<NewExpense> = Vec::new();

    for row in rows {
        match expenses.last_mut() {
            Some(last) if last.date == row.date && last.description == row.description => {
                last.participants.push((row.participant, row.paid_cents));
            }
            _ => expenses.push(NewExpense {
                date: row.date,
                description: row.description,
                participants: vec![(row.participant, row.paid_cents)],
            }),
        }
    }

    expenses
}

pub fn load_expense_csv(csv_path: &Path) -> Result<Vec<NewExpense>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file {}", csv_path.display()))?;

    let mut rows = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: ExpenseRow =
            result.with_context(|| format!("Failed to deserialize expense row {}", line + 1))?;
        rows.push(row);
    }

    Ok(group_rows(rows))
}

/// Insert expenses into a trip, skipping the ones imported before
pub fn import_expenses(
    conn: &Connection,
    trip_id: TripId,
    expenses: &[NewExpense],
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for expense in expenses {
        let hash = compute_idempotency_hash(trip_id, expense);

        match insert_expense(conn, trip_id, expense, Some(&hash)) {
            Ok(_) => summary.inserted += 1,
            Err(e) if is_constraint_violation(&e) => {
                debug!(description = %expense.description, "skipping duplicate expense");
                summary.duplicates += 1;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "Failed to import expense '{}' of {}",
                    expense.description, expense.date
                )))
            }
        }
    }

    Ok(summary)
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_trip, load_expenses, setup_database};
    use crate::error::TripError;
    use crate::model::NewTrip;
    use std::io::Write;

    const CSV: &str = "date,description,participant,paid_cents
2024-06-02,tickets,alice@test.com,6000
2024-06-02,tickets,bob@test.com,0
2024-06-02,tickets,charlie@test.com,0
2024-06-03,dinner,alice@test.com,3000
2024-06-03,dinner,Charlie@Test.com,0
";

    fn write_csv(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn setup_trip(conn: &Connection) -> TripId {
        setup_database(conn).unwrap();
        create_trip(
            conn,
            &NewTrip {
                name: "Trip 2".to_string(),
                owner: "alice@test.com".to_string(),
                description: "import".to_string(),
                start_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                participants: vec!["bob@test.com".to_string(), "charlie@test.com".to_string()],
            },
        )
        .unwrap()
        .trip_id
    }

    #[test]
    fn test_load_expense_csv_groups_rows() {
        let file = write_csv(CSV);
        let expenses = load_expense_csv(file.path()).unwrap();

        assert_eq!(expenses.len(), 2);
        assert_eq!(expenses[0].description, "tickets");
        assert_eq!(expenses[0].participants.len(), 3);
        assert_eq!(expenses[1].participants[1], ("Charlie@Test.com".to_string(), 0));
    }

    #[test]
    fn test_load_expense_csv_rejects_bad_amount() {
        let file = write_csv("date,description,participant,paid_cents\n2024-06-02,tickets,alice@test.com,lots\n");
        assert!(load_expense_csv(file.path()).is_err());
    }

    #[test]
    fn test_idempotency_hash_ignores_participant_order() {
        let a = NewExpense {
            date: NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
            description: "taxi".to_string(),
            participants: vec![("a@x.com".to_string(), 10), ("b@x.com".to_string(), 0)],
        };
        let mut b = a.clone();
        b.participants.reverse();

        assert_eq!(compute_idempotency_hash(TripId(1), &a), compute_idempotency_hash(TripId(1), &b));
        assert_ne!(compute_idempotency_hash(TripId(1), &a), compute_idempotency_hash(TripId(2), &a));
    }

    #[test]
    fn test_import_twice() {
        let conn = Connection::open_in_memory().unwrap();
        let trip_id = setup_trip(&conn);
        let expenses = load_expense_csv(write_csv(CSV).path()).unwrap();

        let first = import_expenses(&conn, trip_id, &expenses).unwrap();
        assert_eq!(first, ImportSummary { inserted: 2, duplicates: 0 });

        let second = import_expenses(&conn, trip_id, &expenses).unwrap();
        assert_eq!(second, ImportSummary { inserted: 0, duplicates: 2 });

        assert_eq!(load_expenses(&conn, trip_id).unwrap().len(), 2);
    }

    #[test]
    fn test_import_unknown_participant_fails() {
        let conn = Connection::open_in_memory().unwrap();
        let trip_id = setup_trip(&conn);
        let expenses = group_rows(vec![ExpenseRow {
            date: NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
            description: "gift".to_string(),
            participant: "henry@test.com".to_string(),
            paid_cents: 100,
        }]);

        let err = import_expenses(&conn, trip_id, &expenses).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TripError>(),
            Some(&TripError::UnknownParticipant("henry@test.com".to_string()))
        );
    }
}
