//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(handlers::auth_register))
        .route("/login", post(handlers::auth_login))
        .route("/me", get(handlers::auth_me));

    let book_routes = Router::new()
        .route("/", get(handlers::books_list).post(handlers::book_create))
        .route("/search", get(handlers::books_search))
        .route("/category/{slug}", get(handlers::books_by_category))
        .route(
            "/{id}",
            get(handlers::book_detail)
                .put(handlers::book_update)
                .delete(handlers::book_delete),
        )
        .route("/{id}/chapters", post(handlers::chapter_create))
        .route(
            "/{id}/chapters/{number}",
            get(handlers::chapter_read).delete(handlers::chapter_delete),
        );

    let category_routes = Router::new()
        .route(
            "/",
            get(handlers::categories_list).post(handlers::category_create),
        )
        .route("/{slug}", get(handlers::category_get));

    let user_routes = Router::new()
        .route(
            "/profile",
            get(handlers::users_profile_get).put(handlers::users_profile_update),
        )
        .route("/bookmarks", get(handlers::users_bookmarks))
        .route("/reading-status", put(handlers::users_reading_status));

    Router::new()
        .route("/", get(handlers::index))
        .nest("/api/auth", auth_routes)
        .nest("/api/books", book_routes)
        .nest("/api/categories", category_routes)
        .nest("/api/users", user_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
