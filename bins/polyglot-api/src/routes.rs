use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{channel, handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute_code))
        .route(
            "/execute/history",
            get(handlers::get_history).delete(handlers::clear_history),
        )
        .route("/execute/metrics", get(handlers::get_execution_metrics))
        .route("/execute/languages", get(handlers::list_languages))
        .route("/execute/ws", get(channel::channel_handler))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes()).with_state(state)
}
