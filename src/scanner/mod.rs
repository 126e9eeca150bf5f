pub mod commands;
pub mod controller;
pub mod guard;
pub mod motion;
pub mod position;
pub mod queue;
pub mod registry;
pub mod state;
pub mod store;

pub use controller::{ClientSender, LogNotice, ScannerController, ScannerEvent, CLIENT_BUFFER};
pub use guard::{PersistenceError, PersistenceGuard};
pub use position::{Delta, Position};
pub use queue::{MovementQueue, QueueOutcome, Rejection};
pub use registry::{validate_user_id, InvalidUserId, ScannerRegistry};
pub use state::{Direction, OperationStatus, ScannerSnapshot, ScannerState};
pub use store::ScannerStore;
