pub mod capture;
pub mod client_session;
pub mod operation;
pub mod scanner_state;

pub use capture::{CaptureEntry, CaptureRecord};
pub use client_session::{ActiveUser, ClientSession, SessionStats};
pub use operation::{OperationFilter, OperationKind, OperationLogEntry, OperationRecord, UserStats};
pub use scanner_state::ScannerRecord;
