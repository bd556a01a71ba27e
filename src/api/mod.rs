//! HTTP API module.

mod error;
mod handlers;
mod middleware;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
