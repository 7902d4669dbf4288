pub mod backend;

pub use backend::{handle_backend_command, BackendCommands};
