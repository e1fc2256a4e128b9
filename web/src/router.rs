use crate::{controller::health_check_controller, sse::handler, AppState};
use axum::{
    routing::{get, post},
    Router,
};

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(event_routes(app_state))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn event_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/events/subscribe", post(handler::subscribe))
        .with_state(app_state)
}
