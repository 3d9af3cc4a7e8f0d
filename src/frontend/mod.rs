pub mod commands;
pub mod connection;

pub(crate) mod buffers;

pub use buffers::MAX_LINE_LENGTH;
pub use commands::{BuiltinCommands, Command};
pub use connection::{FrontendConnection, GREETING};
