//! HTTP ingress: router, handlers and shared application state.

pub mod routes;
pub mod state;


pub use routes::{create_router, create_router_with_body_limit};
pub use state::AppState;
