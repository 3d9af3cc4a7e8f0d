pub mod admin;
pub mod analytics;
pub mod config;
pub mod errors;
pub mod frontend;
pub mod gateway;
pub mod server;
pub mod shared_types;
pub mod store;

pub use config::Config;
pub use errors::ErrorResponse;
pub use frontend::connection::FrontendConnection;
pub use gateway::Gateway;
pub use server::{Server, ServerSettings};
