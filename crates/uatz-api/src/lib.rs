pub mod devices;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod routes;
pub mod send;
pub mod state;
pub mod webhooks;

#[cfg(test)]
mod testing;

pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, AppStateInner};
