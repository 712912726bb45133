//! HTTP front-end: upload a job, watch its status, fetch its images.
//!
//! Thin glue over the job subsystem; all real work happens in the driver.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::app::App;
use crate::error::DreamError;
use crate::job::{self, Job};
use crate::token;

/// Multipart field carrying the uploaded image.
const UPLOAD_FIELD: &str = "file";

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct WebState {
    pub app: Arc<App>,
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

#[derive(Serialize)]
pub struct JobStatusResponse {
    pub id: String,
    pub status: String,
    pub description: &'static str,
    pub output_ready: bool,
}

pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/job", post(create_job_handler))
        .route("/job/{id}", get(job_status_handler))
        .route("/job/{id}/input", get(job_input_handler))
        .route("/job/{id}/output", get(job_output_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(WebState { app })
}

/// Serve the front-end until shutdown.
pub async fn serve(
    addr: SocketAddr,
    app: Arc<App>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %addr, "Starting web front-end");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

type ApiError = (StatusCode, String);

fn internal_error(err: DreamError) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn load_job(state: &WebState, id: &str) -> Result<Job, ApiError> {
    state
        .app
        .store
        .get::<Job>(&Job::key(id))
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No such job: {id}")))
}

pub async fn create_job_handler(
    State(state): State<WebState>,
    mut multipart: Multipart,
) -> Result<Json<CreateJobResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let data = field
            .bytes()
            .await
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
        if data.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "Empty upload".into()));
        }

        let name = format!("job/upload/{}", token::generate(32));
        let input_ref = state
            .app
            .storage
            .write_file(&name, &data)
            .await
            .map_err(internal_error)?;

        let job_id = job::create(&state.app.store, &input_ref).map_err(internal_error)?;
        return Ok(Json(CreateJobResponse { job_id }));
    }

    Err((
        StatusCode::BAD_REQUEST,
        format!("Missing upload field: {UPLOAD_FIELD}"),
    ))
}

pub async fn job_status_handler(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = load_job(&state, &id)?;

    Ok(Json(JobStatusResponse {
        id: job.id,
        status: job.status.to_string(),
        description: job.status.description(),
        output_ready: job.status.output_ready(),
    }))
}

pub async fn job_input_handler(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &id)?;
    if job.input_ref.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No processing input".into()));
    }

    serve_image(&state, &job.input_ref).await
}

pub async fn job_output_handler(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &id)?;
    let Some(output_ref) = &job.output_ref else {
        return Err((StatusCode::BAD_REQUEST, "No processing output".into()));
    };

    serve_image(&state, output_ref).await
}

async fn serve_image(state: &WebState, handle: &str) -> Result<impl IntoResponse, ApiError> {
    let data = state
        .app
        .storage
        .read_file(handle)
        .await
        .map_err(internal_error)?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=60000"),
        ],
        data,
    ))
}
