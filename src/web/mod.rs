mod handlers;
mod routes;
mod ws;

pub use handlers::{health_check, HealthResponse};
pub use routes::create_router;
pub use ws::{root_handler, ws_handler};
