use anyhow::Result;
use clap::Parser;
use rusqlite::Connection;

use trip_accountant::config::{Cli, Command};
use trip_accountant::{
    complete_trip, create_trip, add_expense, import_expenses, load_expense_csv, load_expenses,
    load_trips_by_owner, logging, Cents, NewExpense, NewTrip, Settlement, TripId,
};

fn main() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    let conn = cli.database.url.open()?;

    match cli.command {
        Command::Init => {
            println!("✓ Database initialized at {}", cli.database.url);
        }
        Command::CreateTrip {
            name,
            owner,
            description,
            start_date,
            participants,
        } => {
            let new_trip = NewTrip {
                name,
                owner,
                description,
                start_date,
                participants,
            };
            let trip = create_trip(&conn, &new_trip)?;
            println!("✓ Created trip {} '{}' ({} members)", trip.trip_id, trip.name, trip.members().count());
        }
        Command::AddExpense {
            trip,
            date,
            description,
            participants,
        } => {
            let expense = NewExpense {
                date,
                description,
                participants,
            };
            let expense = add_expense(&conn, TripId(trip), &expense)?;
            println!(
                "✓ Recorded expense {} '{}' for {}",
                expense.expense_id,
                expense.description,
                format_cents(expense.amount())
            );
        }
        Command::Import { trip, csv } => run_import(&conn, TripId(trip), &csv)?,
        Command::Trips { owner } => {
            let trips = load_trips_by_owner(&conn, &owner)?;
            if trips.is_empty() {
                println!("No active trips owned by {}", owner);
            }
            for trip in trips.values() {
                println!(
                    "{:>4}  {:<24} {}  {} members, {} expenses, {}",
                    trip.trip_id,
                    trip.name,
                    trip.start_date,
                    trip.members().count(),
                    trip.expenses.len(),
                    format_cents(trip.total_expense())
                );
            }
        }
        Command::Expenses { trip } => {
            for expense in load_expenses(&conn, TripId(trip))? {
                println!(
                    "{:>4}  {}  {:<24} {}",
                    expense.expense_id,
                    expense.date,
                    expense.description,
                    format_cents(expense.amount())
                );
                for share in &expense.participants {
                    println!("        {:<32} {}", share.email, format_cents(share.paid));
                }
            }
        }
        Command::Close { trip } => {
            let settlement = complete_trip(&conn, TripId(trip))?;
            print_settlement(&settlement);
        }
    }

    Ok(())
}

fn run_import(conn: &Connection, trip_id: TripId, csv: &std::path::Path) -> Result<()> {
    println!("📂 Loading CSV...");
    let expenses = load_expense_csv(csv)?;
    println!("✓ Loaded {} expenses from {}", expenses.len(), csv.display());

    println!("💾 Inserting expenses into trip {}...", trip_id);
    let summary = import_expenses(conn, trip_id, &expenses)?;
    println!("✓ Inserted: {} expenses", summary.inserted);
    println!("✓ Skipped duplicates: {}", summary.duplicates);

    Ok(())
}

fn print_settlement(settlement: &Settlement) {
    println!("⚖️  Settlement for trip {}", settlement.trip_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if settlement.ledger.is_empty() {
        println!("Nobody owes anything.");
    }
    for (payer, payees) in &settlement.ledger {
        for (payee, amount) in payees {
            println!("{:<32} → {:<32} {:>12}", payer, payee, format_cents(*amount));
        }
    }
    println!("✓ Trip closed at {}", settlement.closed_at.format("%Y-%m-%d %H:%M:%S UTC"));
}

fn format_cents(cents: Cents) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}
