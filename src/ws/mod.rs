pub mod handler;
pub mod manager;

pub use handler::{collab_handler, CollabState};
pub use manager::{ConnectionEvent, ConnectionManager, OutboundFrame};
