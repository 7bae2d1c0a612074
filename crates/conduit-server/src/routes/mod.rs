// Export route modules
pub mod chat;
pub mod health;
pub mod models;
pub mod suggestions;

use crate::state::AppState;
use axum::Router;

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(chat::routes(state.clone()))
        .merge(suggestions::routes(state.clone()))
        .merge(models::routes(state))
        .merge(health::routes())
}
