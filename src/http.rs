use crate::backend::BookingBackend;
use crate::clock::Clock;
use crate::configuration::Configuration;
use crate::error::BookingError;
use crate::reservation::{
    first_message, non_empty, normalize_phone, parse_date, parse_id, ReservationRequest,
    MIN_LOOKUP_DIGITS,
};
use crate::types::{
    AppointmentDetails, AppointmentStatus, BraidStyle, Client, ClientProfile, Color, FinanceEntry,
    FinanceKind, Month, NewFinanceEntry, TimePeriod,
};
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, Response};
use axum::{extract::State, http::StatusCode, Json};
use axum::{
    routing::{get, patch, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;
use validator::Validate;

pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";
const TITLE_PLACEHOLDER: &str = "{{website_title}}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DateQuery {
    date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityResponse {
    occupied_periods: Vec<TimePeriod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppointmentResponse {
    appointment: AppointmentDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoneQuery {
    phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientLookupResponse {
    client: Option<Client>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusUpdateRequest {
    status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchQuery {
    search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MonthQuery {
    month: Option<String>,
    year: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct FinanceEntryRequest {
    kind: String,
    #[validate(range(exclusive_min = 0.0, message = "Amount must be greater than zero"))]
    amount: f64,
    #[validate(length(min = 1, message = "Description is required"))]
    description: String,
    date: String,
    #[serde(default)]
    category: Option<String>,
}

pub fn create_app<T: BookingBackend, C: Configuration>(
    backend: T,
    configuration: C,
    clock: Arc<dyn Clock>,
) -> Router {
    let state = AppState {
        backend,
        configuration,
        clock,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new()
        .route("/frontend", get(get_frontend::<T, C>))
        .route("/availability", get(get_availability::<T, C>))
        .route("/reservation", post(reserve::<T, C>))
        .route("/client-lookup", get(lookup_client::<T, C>))
        .route("/braid-styles", get(get_braid_styles::<T, C>))
        .route("/colors", get(get_colors::<T, C>));

    let admin = Router::new()
        .route("/appointment/:id", patch(update_status::<T, C>))
        .route("/admin/appointments", get(get_appointments::<T, C>))
        .route(
            "/admin/appointments/upcoming",
            get(get_upcoming_appointments::<T, C>),
        )
        .route(
            "/admin/appointments/stream",
            get(stream_open_appointments::<T, C>),
        )
        .route("/admin/clients", get(get_clients::<T, C>))
        .route("/admin/clients/:id", get(get_client_profile::<T, C>))
        .route(
            "/admin/finance",
            get(get_finance_entries::<T, C>).post(add_finance_entry::<T, C>),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth::<T, C>,
        ));

    Router::new()
        .merge(public)
        .merge(admin)
        .with_state(state)
        .layer(cors)
}

async fn admin_auth<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    request: Request,
    next: Next,
) -> Result<Response, BookingError> {
    let password = request
        .headers()
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|value| value.to_str().ok());

    if password != Some(state.configuration.password().as_str()) {
        warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(BookingError::Unauthorized);
    }
    Ok(next.run(request).await)
}

/// Runs a store call on the blocking pool. Both stores hold a std mutex
/// and the database one may sleep before its retry.
async fn blocking<T, R, F>(backend: &T, operation: F) -> Result<R, BookingError>
where
    T: BookingBackend,
    R: Send + 'static,
    F: FnOnce(&T) -> Result<R, BookingError> + Send + 'static,
{
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || operation(&backend))
        .await
        .map_err(|err| BookingError::Store(format!("Backend task failed: {err}")))?
}

fn json_body<B>(payload: Result<Json<B>, JsonRejection>) -> Result<B, BookingError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| BookingError::Validation(rejection.body_text()))
}

async fn get_frontend<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
) -> Result<Html<String>, BookingError> {
    let path = state.configuration.frontend_path();
    let contents = fs::read_to_string(&path).await.map_err(|err| {
        BookingError::Store(format!(
            "Failed to read frontend file {}: {err}",
            path.display()
        ))
    })?;
    Ok(Html(contents.replace(
        TITLE_PLACEHOLDER,
        &state.configuration.website_title(),
    )))
}

async fn get_availability<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Query(query): Query<DateQuery>,
) -> Result<Json<AvailabilityResponse>, BookingError> {
    let date = query
        .date
        .ok_or_else(|| BookingError::Validation("Query parameter 'date' is required".into()))?;
    let date = parse_date(&date)?;
    let occupied_periods = blocking(&state.backend, move |backend| {
        backend.occupied_periods(date)
    })
    .await?
    .into_iter()
    .collect();
    Ok(Json(AvailabilityResponse { occupied_periods }))
}

async fn reserve<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    payload: Result<Json<ReservationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AppointmentResponse>), BookingError> {
    let reservation = json_body(payload)?.into_reservation(state.clock.today())?;
    let appointment = blocking(&state.backend, move |backend| backend.reserve(reservation)).await?;
    Ok((StatusCode::CREATED, Json(AppointmentResponse { appointment })))
}

async fn lookup_client<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Query(query): Query<PhoneQuery>,
) -> Result<Json<ClientLookupResponse>, BookingError> {
    let digits = normalize_phone(query.phone.as_deref().unwrap_or_default());
    if digits.len() < MIN_LOOKUP_DIGITS {
        return Ok(Json(ClientLookupResponse { client: None }));
    }
    let client = blocking(&state.backend, move |backend| {
        backend.find_client_by_phone(&digits)
    })
    .await?;
    Ok(Json(ClientLookupResponse { client }))
}

async fn get_braid_styles<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
) -> Result<Json<Vec<BraidStyle>>, BookingError> {
    let styles = blocking(&state.backend, |backend| backend.braid_styles()).await?;
    Ok(Json(styles))
}

async fn get_colors<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
) -> Result<Json<Vec<Color>>, BookingError> {
    let colors = blocking(&state.backend, |backend| backend.colors()).await?;
    Ok(Json(colors))
}

async fn update_status<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Path(id): Path<String>,
    payload: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> Result<Json<AppointmentDetails>, BookingError> {
    let id = parse_id(&id, "appointment")?;
    let status: AppointmentStatus = json_body(payload)?.status.parse()?;
    let policy = state.configuration.status_policy();
    let appointment = blocking(&state.backend, move |backend| {
        backend.update_status(id, status, policy)
    })
    .await?;
    Ok(Json(appointment))
}

async fn get_appointments<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<AppointmentDetails>>, BookingError> {
    let date = match non_empty(query.date) {
        Some(date) => Some(parse_date(&date)?),
        None => None,
    };
    let appointments = blocking(&state.backend, move |backend| backend.appointments(date)).await?;
    Ok(Json(appointments))
}

async fn get_upcoming_appointments<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
) -> Result<Json<Vec<AppointmentDetails>>, BookingError> {
    let today = state.clock.today();
    let upcoming = blocking(&state.backend, move |backend| {
        backend.upcoming_appointments(today)
    })
    .await?;
    Ok(Json(upcoming))
}

/// Pushes the open agenda as an `agenda` event on connect and after every change.
async fn stream_open_appointments<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, BookingError> {
    let stream = blocking(&state.backend, |backend| {
        Ok(backend.open_appointments_stream())
    })
    .await?
    .map(|open| Event::default().event("agenda").json_data(open));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn get_clients<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Client>>, BookingError> {
    let search = non_empty(query.search);
    let clients = blocking(&state.backend, move |backend| {
        backend.clients(search.as_deref())
    })
    .await?;
    Ok(Json(clients))
}

async fn get_client_profile<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Path(id): Path<String>,
) -> Result<Json<ClientProfile>, BookingError> {
    let id = parse_id(&id, "client")?;
    let profile = blocking(&state.backend, move |backend| backend.client_profile(id)).await?;
    Ok(Json(profile))
}

fn parse_month(query: MonthQuery) -> Result<Option<Month>, BookingError> {
    let (Some(month), Some(year)) = (non_empty(query.month), non_empty(query.year)) else {
        return Ok(None);
    };
    let invalid = || BookingError::Validation(format!("Invalid month {month}/{year}"));
    let month_number = month.parse().map_err(|_| invalid())?;
    let year_number = year.parse().map_err(|_| invalid())?;
    Month::new(year_number, month_number).map(Some)
}

async fn get_finance_entries<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Query(query): Query<MonthQuery>,
) -> Result<Json<Vec<FinanceEntry>>, BookingError> {
    let month = parse_month(query)?;
    let entries = blocking(&state.backend, move |backend| backend.finance_entries(month)).await?;
    Ok(Json(entries))
}

async fn add_finance_entry<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    payload: Result<Json<FinanceEntryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FinanceEntry>), BookingError> {
    let request = json_body(payload)?;
    request
        .validate()
        .map_err(|errors| BookingError::Validation(first_message(&errors)))?;

    let entry = NewFinanceEntry {
        kind: request.kind.parse::<FinanceKind>()?,
        amount: request.amount,
        description: request.description.trim().to_string(),
        date: parse_date(&request.date)?,
        category: non_empty(request.category),
    };
    let entry = blocking(&state.backend, move |backend| {
        backend.add_finance_entry(entry)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
