pub mod campaigns;
pub mod emails;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(emails::router())
        .merge(campaigns::router())
        .with_state(state)
}
