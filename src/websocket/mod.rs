pub mod handler;
pub mod messages;

pub use handler::routes;
pub use messages::{ClientMessage, ProtocolError, ServerMessage};
