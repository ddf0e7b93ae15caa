pub mod config;
mod http_layers;
pub mod metrics;
pub mod request_user;
pub mod server;
pub mod state;
mod task_routes;
pub mod websocket;

pub use config::ServerConfig;
pub use http_layers::*;
pub use request_user::RequestUser;
pub use server::{make_app, run_server};
pub use state::JobServices;
