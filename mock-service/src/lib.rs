use axum::{
    body::Bytes,
    debug_handler,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lazy_static::lazy_static;
use rand_distr::{Distribution, SkewNormal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::{
    num::NonZeroU32,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Serve the mock employee API on `addr` until the process exits.
pub async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Mock service listening on {addr}");
    axum::serve(listener, router()).await?;
    Ok(())
}

pub fn router() -> Router {
    Router::new()
        .route("/employee", get(list_employees).post(create_employee))
        .route("/employee/", get(list_employees).post(create_employee))
        .route("/status/:code", get(status))
        .route("/limited/:max_tps/server/:server_id", get(limited))
        .layer(TraceLayer::new_for_http())
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub clerk_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub estado: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmployeeCreate {
    clerk_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    estado: Option<String>,
}

impl EmployeeCreate {
    fn into_employee(self) -> Result<Employee, ApiError> {
        fn required(field: &'static str, value: Option<String>) -> Result<String, ApiError> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(ApiError::MissingField(field)),
            }
        }

        Ok(Employee {
            clerk_id: required("clerkId", self.clerk_id)?,
            first_name: required("firstName", self.first_name)?,
            last_name: required("lastName", self.last_name)?,
            email: required("email", self.email)?,
            estado: self.estado.unwrap_or_else(|| "pendiente".to_string()),
        })
    }
}

#[derive(Debug)]
enum ApiError {
    Malformed(String),
    MissingField(&'static str),
    Duplicate(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Malformed(err) => {
                (StatusCode::BAD_REQUEST, format!("Malformed body: {err}"))
            }
            ApiError::MissingField(field) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Missing field `{field}`"),
            ),
            ApiError::Duplicate(id) => (
                StatusCode::CONFLICT,
                format!("Employee `{id}` already exists"),
            ),
        }
        .into_response()
    }
}

lazy_static! {
    static ref EMPLOYEES: RwLock<HashMap<String, Employee>> = RwLock::new(HashMap::new());
}

/// Simulated database latency, right-skewed around a few milliseconds.
fn jitter() -> Duration {
    let ms: f64 = SkewNormal::new(6.0, 3.0, 4.0)
        .map(|dist| dist.sample(&mut rand::thread_rng()))
        .unwrap_or(6.0);
    Duration::from_secs_f64(ms.max(0.) / 1000.)
}

#[debug_handler]
async fn list_employees() -> Json<Vec<Employee>> {
    tokio::time::sleep(jitter()).await;
    let employees = EMPLOYEES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();
    Json(employees)
}

#[debug_handler]
async fn create_employee(body: Bytes) -> Result<(StatusCode, Json<Employee>), ApiError> {
    tokio::time::sleep(jitter()).await;

    let payload: EmployeeCreate =
        serde_json::from_slice(&body).map_err(|e| ApiError::Malformed(e.to_string()))?;
    let employee = payload.into_employee()?;

    let mut employees = EMPLOYEES.write().unwrap_or_else(PoisonError::into_inner);
    if employees.contains_key(&employee.clerk_id) {
        return Err(ApiError::Duplicate(employee.clerk_id));
    }
    debug!("Created employee {}", employee.clerk_id);
    employees.insert(employee.clerk_id.clone(), employee.clone());
    Ok((StatusCode::CREATED, Json(employee)))
}

/// Answers with the requested status code after the usual jitter.
#[debug_handler]
async fn status(Path(code): Path<u16>) -> StatusCode {
    tokio::time::sleep(jitter()).await;
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

lazy_static! {
    static ref LIMITED_MAP: RwLock<HashMap<String, Arc<DefaultDirectRateLimiter>>> =
        RwLock::new(HashMap::new());
}

/// Admits `max_tps` requests per second per `server_id`; the rest get a 429.
#[debug_handler]
async fn limited(Path((max_tps, server_id)): Path<(u32, String)>) -> StatusCode {
    let read = LIMITED_MAP
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&server_id)
        .cloned();
    let limiter = match read {
        Some(limiter) => limiter,
        None => LIMITED_MAP
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server_id)
            .or_insert_with(|| Arc::new(rate_limiter(max_tps)))
            .clone(),
    };

    match limiter.check() {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::TOO_MANY_REQUESTS,
    }
}

/** Utils **/

pub fn rate_limiter(tps: u32) -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(
        NonZeroU32::new(tps).unwrap_or(NonZeroU32::MIN),
    ))
}
