pub mod app;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod state;

pub use app::{build_app, new_state};
pub use error::ApiError;
pub use state::AppState;
