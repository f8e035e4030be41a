pub mod dispatcher;
pub mod handler;

pub use dispatcher::Relay;
pub use handler::{Command, MessageHandler};
