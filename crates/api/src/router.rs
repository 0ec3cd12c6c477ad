//! Route table. Everything under `/api` goes through the bearer check;
//! `/health` stays open for probes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, ApiState};

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route(
            "/user/{id}",
            post(handlers::create_user)
                .patch(handlers::update_user)
                .get(handlers::get_user)
                .delete(handlers::delete_user),
        )
        .route("/user/{id}/event/{name}", post(handlers::emit_event))
        .route("/user/{id}/event", get(handlers::list_user_events))
        .route("/user/{id}/segment", get(handlers::list_user_segments))
        .route("/segment", get(handlers::list_segments))
        .route(
            "/segment/{id}",
            post(handlers::create_segment)
                .patch(handlers::update_segment)
                .get(handlers::get_segment)
                .delete(handlers::delete_segment),
        )
        .route("/segment/{id}/user", get(handlers::list_segment_users))
        .route("/campaign", get(handlers::list_campaigns))
        .route(
            "/campaign/{id}",
            post(handlers::create_campaign)
                .get(handlers::get_campaign)
                .delete(handlers::delete_campaign),
        )
        .route(
            "/template/{id}",
            post(handlers::create_template)
                .patch(handlers::update_template)
                .delete(handlers::delete_template),
        )
        .route("/email/config", post(handlers::set_email_config))
        .route("/config", post(handlers::push_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_bearer,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}
