pub mod extract;
pub mod handlers;
pub mod responses;
pub mod routes;

pub use extract::{replay_response, IdempotencyKey};
pub use responses::{ApiError, ApiResponse, ErrorResponse};
pub use routes::{create_router, AppState};
