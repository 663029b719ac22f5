// ⚙️ Configuration - Command line flags with environment fallbacks

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::db::setup_database;

pub const DEFAULT_DB_URL: &str = "sqlite3:///srv/trip-accountant/data/trips.db";
pub const DEFAULT_PORT: u16 = 8081;

// ============================================================================
// DATABASE URL
// ============================================================================

/// Location of the SQLite database.
///
/// `sqlite3:///path/to/trips.db` for a file, `sqlite3::memory:` for a
/// throwaway in-memory database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    File(PathBuf),
    Memory,
}

impl FromStr for DatabaseUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s).with_context(|| format!("failed to parse database URL {:?}", s))?;
        if url.scheme() != "sqlite3" {
            bail!("unsupported database: {}", url.scheme());
        }
        if url.path() == ":memory:" {
            return Ok(DatabaseUrl::Memory);
        }

        let path = url
            .to_file_path()
            .map_err(|_| anyhow!("database URL {:?} does not name a local file", s))?;
        Ok(DatabaseUrl::File(path))
    }
}

impl fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseUrl::File(path) => write!(f, "sqlite3://{}", path.display()),
            DatabaseUrl::Memory => write!(f, "sqlite3::memory:"),
        }
    }
}

impl DatabaseUrl {
    /// Open the database and make sure the schema exists
    pub fn open(&self) -> Result<Connection> {
        let conn = match self {
            DatabaseUrl::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
                }
                Connection::open(path)
                    .with_context(|| format!("Failed to open DB file {}", path.display()))?
            }
            DatabaseUrl::Memory => Connection::open_in_memory()?,
        };
        setup_database(&conn)?;
        Ok(conn)
    }
}

/// Database selection shared by every binary
#[derive(Debug, Clone, Args)]
pub struct DatabaseArgs {
    /// Database URL
    #[clap(long = "db", value_parser, env = "TRIP_ACCOUNTANT_DB", default_value = DEFAULT_DB_URL)]
    pub url: DatabaseUrl,
}

// ============================================================================
// SERVER
// ============================================================================

/// Settings of the HTTP server
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about = "Trip expense accounting API server", long_about = None)]
pub struct ServerConfig {
    #[clap(flatten)]
    pub database: DatabaseArgs,
    /// Bind port
    #[clap(short = 'p', long, value_parser, env = "TRIP_ACCOUNTANT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Bind address
    #[clap(long, value_parser, env = "TRIP_ACCOUNTANT_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

// ============================================================================
// CLI
// ============================================================================

#[derive(Debug, Parser)]
#[clap(author, version, about = "Track shared trip expenses and settle them", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    pub database: DatabaseArgs,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the database schema
    Init,
    /// Create a new trip
    CreateTrip {
        #[clap(long)]
        name: String,
        /// E-mail of the trip owner
        #[clap(long)]
        owner: String,
        #[clap(long, default_value = "")]
        description: String,
        /// Start date, YYYY-MM-DD
        #[clap(long)]
        start_date: chrono::NaiveDate,
        /// Participant e-mails, comma separated
        #[clap(long, value_delimiter = ',')]
        participants: Vec<String>,
    },
    /// Record one expense; participants as email=cents pairs
    AddExpense {
        #[clap(long)]
        trip: i64,
        /// Transaction date, YYYY-MM-DD
        #[clap(long)]
        date: chrono::NaiveDate,
        #[clap(long)]
        description: String,
        #[clap(long = "paid", value_parser = parse_share, required = true)]
        participants: Vec<(String, i64)>,
    },
    /// Import expenses from a CSV file (date,description,participant,paid_cents)
    Import {
        #[clap(long)]
        trip: i64,
        csv: PathBuf,
    },
    /// List the active trips of an owner
    Trips { owner: String },
    /// List the expenses of a trip
    Expenses { trip: i64 },
    /// Settle a trip and mark it closed
    Close { trip: i64 },
}

/// Parse an `email=cents` pair
pub fn parse_share(s: &str) -> Result<(String, i64), String> {
    let (email, cents) = s
        .split_once('=')
        .ok_or_else(|| format!("expected email=cents, got {:?}", s))?;
    let cents = cents
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid amount in {:?}: {}", s, e))?;
    Ok((email.trim().to_string(), cents))
}
