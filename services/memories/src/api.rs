use crate::config::ApiConfig;
use crate::error::LifecycleError;
use crate::extraction::UploadedFile;
use crate::lifecycle::{Lifecycle, PhotoFailure};
use crate::metadata_store::{BackgroundImage, Event, EventDetails, EventInput, Photo};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Lifecycle,
}

/// Event as returned to the timeline UI
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub id: Uuid,
    pub title: String,
    pub date: NaiveDate,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub photos: Vec<Photo>,
    pub background_images: Vec<BackgroundImage>,
}

impl From<EventDetails> for EventResponse {
    fn from(details: EventDetails) -> Self {
        let Event {
            id,
            title,
            date,
            location,
            coordinates,
            created_at,
            updated_at,
        } = details.event;

        Self {
            id,
            title,
            date,
            location,
            latitude: coordinates.map(|c| c.latitude),
            longitude: coordinates.map(|c| c.longitude),
            created_at,
            updated_at,
            photos: details.photos,
            background_images: details.background_images,
        }
    }
}

/// Event list response
#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<EventResponse>,
}

/// Event created from an upload, with the files that could not be stored
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub event: EventResponse,
    pub errors: Vec<PhotoFailure>,
}

/// Photos attached to an existing event
#[derive(Debug, Serialize)]
pub struct AttachPhotosResponse {
    pub photos: Vec<Photo>,
    pub errors: Vec<PhotoFailure>,
}

/// Detach request body. `url` is accepted but the stored row decides.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachPhotoRequest {
    pub photo_id: Uuid,
    #[serde(default)]
    pub url: Option<String>,
}

/// Values proposed from uploaded photos
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub date: Option<NaiveDate>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<LifecycleError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: LifecycleError) -> Self {
        let status = match e {
            LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::Storage(_) => StatusCode::BAD_GATEWAY,
            LifecycleError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %e, "Request failed");
        }

        let message = match e {
            LifecycleError::Database(_) => "Database operation failed".to_string(),
            ref other => other.to_string(),
        };
        api_error(status, message, e.code())
    }
}

fn multipart_error(e: MultipartError) -> ApiError {
    api_error(e.status(), e.body_text(), "INVALID_MULTIPART")
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/events", get(list_events).post(create_event))
        .route("/events/upload", post(upload_event))
        .route(
            "/events/:event_id",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route(
            "/events/:event_id/photos",
            post(attach_photos).delete(detach_photo),
        )
        .route(
            "/events/:event_id/backgrounds/:image_id",
            delete(remove_background_image),
        )
        .route("/extract", post(extract))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "memories-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.lifecycle.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// List every event with its media. A failing store yields an empty list
/// the UI shows behind a setup banner.
#[instrument(skip(state))]
async fn list_events(State(state): State<AppState>) -> Response {
    match state.lifecycle.list_events().await {
        Ok(events) => Json(EventListResponse {
            events: events.into_iter().map(EventResponse::from).collect(),
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list events");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "Event storage is not available",
                    "code": "SETUP_REQUIRED",
                    "events": []
                })),
            )
                .into_response()
        }
    }
}

#[instrument(skip(state, input))]
async fn create_event(
    State(state): State<AppState>,
    Json(input): Json<EventInput>,
) -> ApiResult<(StatusCode, Json<EventResponse>)> {
    let outcome = state.lifecycle.create_event(input, Vec::new()).await?;
    Ok((StatusCode::CREATED, Json(outcome.event.into())))
}

#[instrument(skip(state))]
async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<EventResponse>> {
    let details = state.lifecycle.get_event(event_id).await?;
    Ok(Json(details.into()))
}

#[instrument(skip(state, input))]
async fn update_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Json(input): Json<EventInput>,
) -> ApiResult<Json<EventResponse>> {
    state.lifecycle.update_event(event_id, &input).await?;
    let details = state.lifecycle.get_event(event_id).await?;
    Ok(Json(details.into()))
}

#[instrument(skip(state))]
async fn delete_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.lifecycle.delete_event(event_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(LifecycleError::not_found(format!("Event {event_id}")).into())
    }
}

/// Attach one or more multipart files to an event
#[instrument(skip(state, multipart))]
async fn attach_photos(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<AttachPhotosResponse>)> {
    let form = read_multipart(multipart).await?;
    if form.files.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "No files in request",
            "VALIDATION_ERROR",
        ));
    }

    let outcome = state.lifecycle.attach_photos(event_id, form.files).await?;
    Ok((
        StatusCode::CREATED,
        Json(AttachPhotosResponse {
            photos: outcome.photos,
            errors: outcome.failures,
        }),
    ))
}

#[instrument(skip(state, request))]
async fn detach_photo(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Json(request): Json<DetachPhotoRequest>,
) -> ApiResult<StatusCode> {
    if state
        .lifecycle
        .detach_photo(event_id, request.photo_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(LifecycleError::not_found(format!("Photo {}", request.photo_id)).into())
    }
}

#[instrument(skip(state))]
async fn remove_background_image(
    State(state): State<AppState>,
    Path((event_id, image_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state
        .lifecycle
        .remove_background_image(event_id, image_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(LifecycleError::not_found(format!("Background image {image_id}")).into())
    }
}

/// Create an event from form fields and photos in one request. Blank
/// date or location is filled from the photos.
#[instrument(skip(state, multipart))]
async fn upload_event(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let form = read_multipart(multipart).await?;
    let input = form.event_input()?;

    let outcome = state.lifecycle.create_event(input, form.files).await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            event: outcome.event.into(),
            errors: outcome.photo_failures,
        }),
    ))
}

/// Propose date and place for a set of photos without storing anything
#[instrument(skip(state, multipart))]
async fn extract(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<ExtractResponse>> {
    let form = read_multipart(multipart).await?;
    let proposal = state.lifecycle.extraction().propose(&form.files).await;

    Ok(Json(ExtractResponse {
        date: proposal.date,
        location: proposal.place.as_ref().map(|p| p.name.clone()),
        latitude: proposal.place.as_ref().map(|p| p.coordinates.latitude),
        longitude: proposal.place.as_ref().map(|p| p.coordinates.longitude),
    }))
}

/// Text fields and files of a multipart request, in arrival order
#[derive(Debug, Default)]
struct MultipartForm {
    fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
}

impl MultipartForm {
    fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }

    fn number(&self, name: &str) -> ApiResult<Option<f64>> {
        match self.fields.get(name).map(|v| v.trim()) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                LifecycleError::validation(format!("{name} must be a number")).into()
            }),
        }
    }

    fn event_input(&self) -> ApiResult<EventInput> {
        Ok(EventInput {
            title: self.text("title"),
            date: self.text("date"),
            location: self.text("location"),
            latitude: self.number("latitude")?,
            longitude: self.number("longitude")?,
        })
    }
}

/// Collect a multipart body. A `lastModified` text field (epoch
/// milliseconds) applies to the file part that follows it.
async fn read_multipart(mut multipart: Multipart) -> ApiResult<MultipartForm> {
    let mut form = MultipartForm::default();
    let mut last_modified: Option<DateTime<Utc>> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_some() {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = field.bytes().await.map_err(multipart_error)?;

            form.files.push(UploadedFile {
                file_name,
                content_type,
                bytes,
                last_modified: last_modified.take(),
            });
        } else {
            let text = field.text().await.map_err(multipart_error)?;
            if name == "lastModified" {
                last_modified = text
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(DateTime::from_timestamp_millis);
                if last_modified.is_none() {
                    warn!(value = %text, "Ignoring unreadable lastModified");
                }
            } else {
                form.fields.insert(name, text);
            }
        }
    }

    Ok(form)
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let app = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind API server")?;

    axum::serve(listener, app)
        .await
        .context("API server error")?;

    Ok(())
}
