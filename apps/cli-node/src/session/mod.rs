pub mod controller;
pub mod mesh;

pub use controller::{ResponseOutcome, SessionController};
pub use mesh::{MeshAction, MeshController};
