pub mod handler;
pub mod router;

pub use handler::{WebSocketHandler, WS_PATH};
pub use router::RequestRouter;
