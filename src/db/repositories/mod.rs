pub mod captures;
pub mod client_sessions;
pub mod operations;
pub mod scanner_state;
