//! Read-only web dashboard over the job store.
//!
//! The dashboard opens the database with read-only flags and exposes no
//! mutating route, so it can be added or removed without touching the
//! queue's invariants.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::Result;
use crate::job::{Job, JobState};
use crate::store::Store;

#[derive(Clone)]
pub struct DashboardState {
    store: Arc<Mutex<Store>>,
}

impl DashboardState {
    /// Open the database read-only. Fails when the database does not exist
    /// yet; run `init-db` first.
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Store::open_read_only(db_path)?;
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
        })
    }
}

#[derive(Serialize)]
pub struct JobSummary {
    id: String,
    command: String,
    state: String,
    priority: i64,
    attempts: u32,
    max_retries: u32,
    created_at: String,
    updated_at: String,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            command: job.command,
            state: job.state.to_string(),
            priority: job.priority,
            attempts: job.attempts,
            max_retries: job.max_retries,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
pub struct JobsQuery {
    state: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(jobs_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "dashboard server failed");
    }
}

pub async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

pub async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let counts = state.store.lock().unwrap().counts_by_state();
    match counts {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read job counts");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn jobs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<JobsQuery>,
) -> impl IntoResponse {
    let filter = match query.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(filter) => filter,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);

    let jobs = state.store.lock().unwrap().list(filter, limit, offset);
    match jobs {
        Ok(jobs) => {
            let summaries: Vec<JobSummary> = jobs.into_iter().map(JobSummary::from).collect();
            Json(summaries).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to list jobs");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
