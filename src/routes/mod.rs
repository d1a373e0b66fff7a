use axum::http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{realtime, state::AppState};

pub mod documents;
pub mod execute;
pub mod folders;
pub mod health;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.frontend_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid FRONTEND_ORIGIN value")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::create_document),
        )
        .route(
            "/:id",
            get(documents::get_document)
                .patch(documents::rename_document)
                .delete(documents::archive_document),
        )
        .route("/:id/share-link", post(documents::rotate_share_link))
        .route("/:id/folder", axum::routing::patch(documents::move_document));

    let folders_routes = Router::new().route(
        "/",
        get(folders::list_folders).post(folders::create_folder),
    );

    let execute_routes = Router::new()
        .route("/", post(execute::execute))
        .route("/:id", get(execute::get_execution));

    Router::new()
        .nest("/api/documents", documents_routes)
        .nest("/api/folders", folders_routes)
        .nest("/api/execute", execute_routes)
        .route("/health", get(health::health_check))
        .route("/ws", get(realtime::ws_handler))
        .with_state(state)
        .layer(cors)
}
