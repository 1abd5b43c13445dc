pub mod messages;
pub mod presence;

pub use messages::*;
pub use presence::*;
