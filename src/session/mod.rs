pub mod registry;

pub use registry::{SessionHandle, SessionRegistry};
