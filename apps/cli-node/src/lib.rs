// Library exports for the FROST MPC CLI node

pub mod app_runner;
pub mod errors;
pub mod handlers;
pub mod keystore;
pub mod network;
pub mod protocal;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use app_runner::AppRunner;
pub use errors::AppError;
pub use keystore::Keystore;
pub use protocal::signal::{CurveType, SessionInfo, SessionType};
pub use utils::state::{AppState, InternalCommand, MeshStatus, StatusUpdate};
