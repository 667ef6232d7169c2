pub mod auth;
mod handlers;
mod router;

pub use router::{create_router, AppState};
