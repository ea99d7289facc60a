/// HTTP surface of the queue service.
///
/// Every route lives under `/api/v1`. Errors come back as
/// `{"status": "error", "kind": ..., "message": ...}` with a status code
/// chosen by the error kind.

use crate::advancer::{AdvanceOutcome, QueueAdvancer};
use crate::day::DayScope;
use crate::error::QueueError;
use crate::issuer::{RegistrationRequest, TokenIssuer};
use crate::models::{
    Appointment, AppointmentId, AppointmentStatus, Hospital, HospitalId, Patient, PatientId, PatientLookup,
};
use crate::store::{CounterStore, HospitalLocks, HospitalRepository, PatientRepository, QueueStore};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub type SharedStore = Arc<dyn QueueStore>;
pub type Issuer = TokenIssuer<dyn QueueStore, dyn QueueStore>;
pub type Advancer = QueueAdvancer<dyn QueueStore, dyn QueueStore>;

/// Shared handler state. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    store: SharedStore,
    issuer: Arc<Issuer>,
    advancer: Arc<Advancer>,
    scope: DayScope,
}

impl AppState {
    /// The issuer and the advancer share one set of hospital locks.
    pub fn new(store: SharedStore, scope: DayScope) -> Self {
        let locks = HospitalLocks::new();
        AppState {
            issuer: Arc::new(TokenIssuer::new(store.clone(), store.clone(), locks.clone(), scope)),
            advancer: Arc::new(QueueAdvancer::new(store.clone(), store.clone(), locks, scope)),
            store,
            scope,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn advancer(&self) -> &Advancer {
        &self.advancer
    }
}

#[derive(Debug)]
pub struct ApiError(QueueError);

type ApiResult<T> = Result<T, ApiError>;

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            QueueError::Conflict(_) => StatusCode::CONFLICT,
            QueueError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = Json(json!({
            "status": "error",
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

// Request bodies

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHospitalBody {
    pub name: String,
    pub address: String,
    pub contact_number: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePatientBody {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPatientBody {
    pub patient_id: Option<String>,
    pub phone: Option<String>,
    /// Name for this visit; defaults to the patient's name.
    pub name: Option<String>,
}

/// `?date=YYYY-MM-DD`; absent means today.
#[derive(Debug, Default, Deserialize)]
pub struct DayQuery {
    pub date: Option<String>,
}

impl DayQuery {
    fn day(&self, scope: &DayScope) -> ApiResult<NaiveDate> {
        match self.date.as_deref().map(str::trim) {
            None | Some("") => Ok(scope.today()),
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ApiError(QueueError::InvalidInput(format!(
                    "Invalid date: '{}'. Expected YYYY-MM-DD",
                    raw
                )))
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DoctorStatusBody {
    pub available: bool,
}

#[derive(Debug, Deserialize)]
pub struct AppointmentStatusBody {
    pub status: String,
}

// Response bodies

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPatientResponse {
    pub message: String,
    pub patient: Patient,
    pub appointment: Appointment,
    pub token_assigned: u64,
}

#[derive(Debug, Serialize)]
pub struct AdvanceResponse {
    pub message: String,
    #[serde(flatten)]
    pub outcome: AdvanceOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodaysPatient {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
    pub name: String,
    pub token_number: u64,
    pub status: AppointmentStatus,
}

fn parse_id<T>(raw: &str) -> ApiResult<T>
where
    T: std::str::FromStr<Err = QueueError>,
{
    raw.parse::<T>().map_err(ApiError::from)
}

/// Build the router with tracing and permissive CORS.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/hospitals", get(list_hospitals).post(create_hospital))
        .route("/hospitals/:hospital_id", get(get_hospital))
        .route("/hospitals/:hospital_id/register-patient", post(register_patient))
        .route("/hospitals/:hospital_id/live-counter", get(live_counter))
        .route("/hospitals/:hospital_id/increment-live-counter", post(increment_live_counter))
        .route("/hospitals/:hospital_id/current-token", get(current_token))
        .route("/hospitals/:hospital_id/doctor-status", put(update_doctor_status))
        .route("/hospitals/:hospital_id/todays-patients", get(todays_patients))
        .route("/patients", post(create_patient))
        .route("/patients/by-phone/:phone", get(patient_by_phone))
        .route("/patients/:patient_id/appointments", get(patient_appointments))
        .route(
            "/patients/:patient_id/appointments/:appointment_id",
            delete(delete_appointment),
        )
        .route(
            "/patients/:patient_id/appointments/:appointment_id/status",
            put(update_appointment_status),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

/// Serve `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "queue service listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_hospital(
    State(state): State<AppState>,
    Json(body): Json<CreateHospitalBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let hospital = Hospital::new(body.name, body.address, body.contact_number)?;
    let hospital = state.store.insert_hospital(hospital).await?;
    info!(hospital_id = %hospital.id, name = %hospital.name, "hospital created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Hospital created successfully", "hospital": hospital })),
    ))
}

async fn list_hospitals(State(state): State<AppState>) -> ApiResult<Json<Vec<Hospital>>> {
    Ok(Json(state.store.list_hospitals().await?))
}

async fn get_hospital(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
) -> ApiResult<Json<Hospital>> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    Ok(Json(state.store.find_hospital(hospital_id).await?))
}

async fn register_patient(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
    Json(body): Json<RegisterPatientBody>,
) -> ApiResult<(StatusCode, Json<RegisterPatientResponse>)> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    let lookup = PatientLookup::from_parts(body.patient_id.as_deref(), body.phone.as_deref())?;

    let mut request = RegistrationRequest::new(lookup);
    request.patient_name = body.name;

    let registration = state.issuer.register(hospital_id, request).await?;
    let token_assigned = registration.token();
    Ok((
        StatusCode::CREATED,
        Json(RegisterPatientResponse {
            message: "Patient registered successfully".to_string(),
            patient: registration.patient,
            appointment: registration.appointment,
            token_assigned,
        }),
    ))
}

async fn live_counter(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    let live_counter = state.advancer.live_counter(hospital_id).await?;
    Ok(Json(json!({ "liveCounter": live_counter })))
}

async fn increment_live_counter(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
) -> ApiResult<Json<AdvanceResponse>> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    let outcome = state.advancer.advance(hospital_id).await?;
    let message = if outcome.advanced {
        format!("Live counter updated to {}", outcome.live_counter)
    } else {
        format!("No patients waiting, live counter stays at {}", outcome.live_counter)
    };
    Ok(Json(AdvanceResponse { message, outcome }))
}

async fn current_token(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    let counters = state.store.counters(hospital_id).await?;
    Ok(Json(json!({
        "currentTokenBeingServed": counters.issued,
        "liveCounter": counters.serving,
        "waiting": counters.waiting(),
    })))
}

async fn update_doctor_status(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
    Json(body): Json<DoctorStatusBody>,
) -> ApiResult<Json<Hospital>> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    let hospital = state.store.set_doctors_available(hospital_id, body.available).await?;
    info!(%hospital_id, available = body.available, "doctor availability changed");
    Ok(Json(hospital))
}

async fn todays_patients(
    State(state): State<AppState>,
    Path(hospital_id): Path<String>,
    Query(query): Query<DayQuery>,
) -> ApiResult<Json<Value>> {
    let hospital_id: HospitalId = parse_id(&hospital_id)?;
    let day = query.day(&state.scope)?;
    state.store.find_hospital(hospital_id).await?;
    let patients: Vec<TodaysPatient> = state
        .store
        .appointments_for_day(hospital_id, day)
        .await?
        .into_iter()
        .map(|a| TodaysPatient {
            appointment_id: a.id,
            patient_id: a.patient_id,
            name: a.patient_name,
            token_number: a.token_number,
            status: a.status,
        })
        .collect();
    Ok(Json(json!({
        "hospitalId": hospital_id,
        "day": day,
        "todaysPatients": patients,
    })))
}

async fn create_patient(
    State(state): State<AppState>,
    Json(body): Json<CreatePatientBody>,
) -> ApiResult<(StatusCode, Json<Patient>)> {
    let patient = state.store.insert_patient(Patient::new(body.name, body.phone)?).await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

async fn patient_by_phone(
    State(state): State<AppState>,
    Path(phone): Path<String>,
) -> ApiResult<Json<Patient>> {
    let patient = state.store.find_by_phone_or_id(&PatientLookup::Phone(phone)).await?;
    Ok(Json(patient))
}

async fn patient_appointments(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> ApiResult<Json<Vec<Appointment>>> {
    let patient_id: PatientId = parse_id(&patient_id)?;
    Ok(Json(state.store.appointments_for_patient(patient_id).await?))
}

async fn update_appointment_status(
    State(state): State<AppState>,
    Path((patient_id, appointment_id)): Path<(String, String)>,
    Json(body): Json<AppointmentStatusBody>,
) -> ApiResult<Json<Appointment>> {
    let patient_id: PatientId = parse_id(&patient_id)?;
    let appointment_id: AppointmentId = parse_id(&appointment_id)?;
    let status = AppointmentStatus::from_string(&body.status)?;
    let appointment = state
        .store
        .update_appointment_status(patient_id, appointment_id, status)
        .await?;
    Ok(Json(appointment))
}

async fn delete_appointment(
    State(state): State<AppState>,
    Path((patient_id, appointment_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let patient_id: PatientId = parse_id(&patient_id)?;
    let appointment_id: AppointmentId = parse_id(&appointment_id)?;
    let removed = state.store.delete_appointment(patient_id, appointment_id).await?;
    info!(%patient_id, %appointment_id, token = removed.token_number, "appointment deleted");
    Ok(Json(json!({ "message": "Appointment deleted", "appointment": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::to_bytes;
    use chrono::{TimeZone, Utc};

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let cases = [
            (QueueError::hospital_not_found("x"), StatusCode::NOT_FOUND),
            (QueueError::InvalidInput("bad".to_string()), StatusCode::BAD_REQUEST),
            (QueueError::Conflict("dup".to_string()), StatusCode::CONFLICT),
            (QueueError::Internal("boom".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
            let body = body_json(response).await;
            assert_eq!(body["status"], "error");
            assert!(body["message"].is_string());
            assert!(body["kind"].is_string());
        }
    }

    #[tokio::test]
    async fn day_listing_accepts_a_past_date() {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(store.clone(), DayScope::kolkata());
        let hospital = store
            .insert_hospital(Hospital::new("Sunrise".to_string(), "Anna Salai".to_string(), "044".to_string()).unwrap())
            .await
            .unwrap();
        let patient = store
            .insert_patient(Patient::new("Gita".to_string(), "9400000001".to_string()).unwrap())
            .await
            .unwrap();
        let past_day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let visit = Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap();
        store
            .append_appointment(Appointment::new(&patient, None, hospital.id, visit, past_day, 1).unwrap())
            .await
            .unwrap();

        let Json(body) = todays_patients(
            State(state.clone()),
            Path(hospital.id.to_string()),
            Query(DayQuery { date: Some("2024-03-01".to_string()) }),
        )
        .await
        .unwrap();
        assert_eq!(body["day"], "2024-03-01");
        assert_eq!(body["todaysPatients"][0]["name"], "Gita");
        assert_eq!(body["todaysPatients"][0]["tokenNumber"], 1);

        let Json(body) = todays_patients(State(state.clone()), Path(hospital.id.to_string()), Query(DayQuery::default()))
            .await
            .unwrap();
        assert_eq!(body["todaysPatients"].as_array().unwrap().len(), 0);

        let err = todays_patients(
            State(state),
            Path(hospital.id.to_string()),
            Query(DayQuery { date: Some("01/03/2024".to_string()) }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.0, QueueError::InvalidInput(_)));
    }

    #[test]
    fn malformed_ids_are_bad_requests() {
        let err = parse_id::<HospitalId>("not-a-uuid").unwrap_err();
        assert!(matches!(err.0, QueueError::InvalidInput(_)));
    }
}
