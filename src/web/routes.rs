use axum::{
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use super::auth::api_key_middleware;
use super::handlers;
use super::ws::video_ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Live stream
        .route("/stream", get(handlers::stream::mjpeg_stream))
        // Camera control
        .route("/camera/open", post(handlers::camera::open))
        .route("/camera/close", post(handlers::camera::close))
        .route("/camera/start_preview", post(handlers::camera::start_preview))
        .route("/camera/stop_preview", post(handlers::camera::stop_preview))
        .route("/camera/capture", post(handlers::camera::capture))
        .route("/camera/start_recording", post(handlers::camera::start_recording))
        .route("/camera/stop_recording", post(handlers::camera::stop_recording))
        .route("/camera/status", get(handlers::camera::status))
        .route("/camera/devices", get(handlers::camera::list_devices))
        // Stored files
        .route("/photos", get(handlers::files::list_photos))
        .route("/photos/:file", get(handlers::files::get_photo))
        .route("/photos/:file/download", get(handlers::files::download_photo))
        .route("/videos", get(handlers::files::list_videos))
        .route("/videos/:file", get(handlers::files::get_video))
        .route("/videos/:file/download", get(handlers::files::download_video))
        // Frame extraction
        .route("/frame-extraction/start", post(handlers::extraction::start))
        .route(
            "/frame-extraction/status/:task_id",
            get(handlers::extraction::status),
        )
        .route(
            "/frame-extraction/stop/:task_id",
            post(handlers::extraction::stop),
        )
        .route(
            "/frame-extraction/download/:task_id",
            get(handlers::extraction::download),
        )
        .route(
            "/frame-extraction/preview/:task_id/:filename",
            get(handlers::extraction::preview),
        )
        .route(
            "/frame-extraction/cleanup",
            post(handlers::extraction::cleanup),
        );

    Router::new()
        .nest("/api", api_routes)
        .route("/ws/video", any(video_ws_handler))
        .fallback(unknown_endpoint)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn(options_no_content))
        .layer(cors_layer(&state.config.server.cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .max_age(Duration::from_secs(86400));

    // Credentialed CORS is incompatible with wildcard origin/headers
    if origin == "*" {
        return layer.allow_origin(Any).allow_headers(Any);
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => layer
            .allow_origin(AllowOrigin::exact(value))
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static(crate::web::auth::API_KEY_HEADER),
            ])
            .allow_credentials(true),
        Err(_) => layer.allow_origin(Any).allow_headers(Any),
    }
}

/// Bare OPTIONS requests answer 204; the CORS layer adds its headers on
/// the way out.
async fn options_no_content(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    next.run(request).await
}

async fn unknown_endpoint(request: Request) -> crate::error::AppError {
    crate::error::AppError::NotFound(format!("{} {}", request.method(), request.uri().path()))
}
