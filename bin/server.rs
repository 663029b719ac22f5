// Trip Accountant - Web Server
// REST API with Axum over the trip store

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use trip_accountant::{
    add_expense, create_trip, load_trip_by_id, load_trips_by_owner, logging, settle_trip, Cents,
    NewExpense, NewTrip, ServerConfig, SettleError, TripError, TripId,
};

const MAX_NAME_LEN: usize = 127;
const MAX_DESCRIPTION_LEN: usize = 511;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal(anyhow::anyhow!("database lock poisoned")))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    fn bad_request(error: impl Into<anyhow::Error>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
        }
    }

    fn internal(error: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error,
        }
    }
}

/// Pick the status code from the typed error carried inside
impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        let status = if let Some(e) = error.downcast_ref::<TripError>() {
            match e {
                TripError::NotFound(_) | TripError::NoTripsForOwner(_) => StatusCode::NOT_FOUND,
                TripError::AlreadyClosed(_) | TripError::NotClosed(_) => StatusCode::CONFLICT,
                TripError::UnknownParticipant(_) => StatusCode::BAD_REQUEST,
            }
        } else if error.downcast_ref::<SettleError>().is_some() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self { status, error }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(anyhow::anyhow!(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::bad_request(anyhow::anyhow!(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(error = ?self.error, "request failed");
        } else {
            info!(status = %self.status, error = %self.error, "request rejected");
        }
        let body = ErrorBody {
            error: format!("{:#}", self.error),
        };
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Request / response bodies
// ============================================================================

/// Body of POST /trips
#[derive(Debug, Deserialize)]
struct TripRequest {
    name: String,
    owner: String,
    start_date: NaiveDate,
    description: String,
    participants: Vec<String>,
}

impl TryFrom<TripRequest> for NewTrip {
    type Error = ApiError;

    fn try_from(req: TripRequest) -> Result<Self, Self::Error> {
        if req.name.trim().is_empty() || req.name.chars().count() > MAX_NAME_LEN {
            return Err(ApiError::bad_request(anyhow::anyhow!(
                "name must be between 1 and {} characters",
                MAX_NAME_LEN
            )));
        }
        if req.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(ApiError::bad_request(anyhow::anyhow!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
        Ok(NewTrip {
            name: req.name,
            owner: req.owner,
            description: req.description,
            start_date: req.start_date,
            participants: req.participants,
        })
    }
}

/// Body of POST /trips/:trip_id/expenses, participants as email → cents paid
#[derive(Debug, Deserialize)]
struct ExpenseRequest {
    date: NaiveDate,
    description: String,
    participants: BTreeMap<String, Cents>,
}

impl From<ExpenseRequest> for NewExpense {
    fn from(req: ExpenseRequest) -> Self {
        NewExpense {
            date: req.date,
            description: req.description,
            participants: req.participants.into_iter().collect(),
        }
    }
}

#[derive(Serialize)]
struct TripCreated {
    trip_id: TripId,
}

#[derive(Serialize)]
struct ExpenseCreated {
    expense_id: i64,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "OK", "version": trip_accountant::VERSION }))
}

/// POST /trips - Create a trip
async fn post_trip(
    State(state): State<AppState>,
    body: Result<Json<TripRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let new_trip = NewTrip::try_from(req)?;

    let conn = state.conn()?;
    let trip = create_trip(&conn, &new_trip)?;

    Ok((StatusCode::CREATED, Json(TripCreated { trip_id: trip.trip_id })))
}

/// GET /users/:owner/trips - Active trips owned by a user
async fn get_trips(
    State(state): State<AppState>,
    owner: Result<Path<String>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(owner) = owner?;
    let conn = state.conn()?;
    let trips = load_trips_by_owner(&conn, &owner)?;
    if trips.is_empty() {
        return Err(anyhow::Error::from(TripError::NoTripsForOwner(owner)).into());
    }
    Ok(Json(trips))
}

/// POST /trips/:trip_id/expenses - Add an expenditure event to a trip
async fn post_expense(
    State(state): State<AppState>,
    trip_id: Result<Path<i64>, PathRejection>,
    body: Result<Json<ExpenseRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(trip_id) = trip_id?;
    let Json(req) = body?;

    let conn = state.conn()?;
    let expense = add_expense(&conn, TripId(trip_id), &req.into())?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExpenseCreated {
            expense_id: expense.expense_id,
        }),
    ))
}

/// GET /trips/:trip_id/expenses - Expenses of a trip
async fn get_expenses(
    State(state): State<AppState>,
    trip_id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(trip_id) = trip_id?;
    let conn = state.conn()?;
    let trip = load_trip_by_id(&conn, TripId(trip_id))?;
    Ok(Json(trip.expenses))
}

/// GET /trips/:trip_id/settlement - Close the trip and return who owes whom
async fn get_settlement(
    State(state): State<AppState>,
    trip_id: Result<Path<i64>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(trip_id) = trip_id?;
    let conn = state.conn()?;
    let settlement = settle_trip(&conn, TripId(trip_id))?;
    Ok(Json(settlement))
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/trips", axum::routing::post(post_trip))
        .route("/users/:owner/trips", get(get_trips))
        .route("/trips/:trip_id/expenses", get(get_expenses).post(post_expense))
        .route("/trips/:trip_id/settlement", get(get_settlement))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info");
    let config = ServerConfig::parse();

    let conn = config.database.url.open()?;
    info!(db = %config.database.url, "opened database");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🚀 Server running on http://{}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
